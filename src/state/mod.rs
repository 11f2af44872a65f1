//! Layered, copy-on-write ledger state.
//!
//! A [Backend] is a stack of [Layer]s over a snapshot of the account trie. The bottom layer
//! belongs to the block being built, every transaction and every nested call pushes one more.
//! Reads walk the stack from the top down and fall through to the trie; writes always land in the
//! top layer, copying the account there first if needed, so an ancestor's data is never mutated
//! by a descendant. Rolling back a call is popping its layer; accepting it is folding the layer
//! into the one below. [Backend::merge] flattens all layers into the trie.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, info};

use crate::common::{Addr, Bytes, Hash, Wei};
use crate::core::abi::ContractAbi;
use crate::core::{Event, ExecError};

mod account;
mod store;

pub use account::Account;
pub use store::{MemStore, MemTrie, StoreError, Trie, WorldStateStore};

/// The block a backend is building on.
#[derive(Clone, Debug, Default)]
pub struct BlockInfo {
    pub parent_hash: Hash,
    /// Committed state of the parent block.
    pub state_root: Hash,
    pub height: u64,
    pub timestamp: u64,
    pub coinbase: Addr,
}

/// One level of modifications.
#[derive(Default)]
pub struct Layer {
    accounts: HashMap<Addr, Account>,
    /// An empty value is a tombstone: deleted here, do not ask the layers below.
    storage: HashMap<Addr, HashMap<Bytes, Bytes>>,
    code: HashMap<Hash, Bytes>,
    events: Vec<Event>,
    read_only: bool,
}

impl Layer {
    fn new(read_only: bool) -> Self {
        Self {
            read_only,
            ..Default::default()
        }
    }

    fn absorb(&mut self, child: Layer) {
        self.accounts.extend(child.accounts);
        for (addr, diff) in child.storage {
            self.storage.entry(addr).or_default().extend(diff);
        }
        self.code.extend(child.code);
        self.events.extend(child.events);
    }
}

pub struct Backend {
    block: BlockInfo,
    store: Arc<dyn WorldStateStore>,
    trie: Box<dyn Trie>,
    layers: Vec<Layer>,
}

impl Backend {
    /// Root backend of a block built on `block.state_root`.
    pub fn new(
        block: BlockInfo, store: Arc<dyn WorldStateStore>, read_only: bool,
    ) -> Result<Self, ExecError> {
        let trie = store.open(&block.state_root)?;
        Ok(Self {
            block,
            store,
            trie,
            layers: vec![Layer::new(read_only)],
        })
    }

    pub fn block(&self) -> &BlockInfo {
        &self.block
    }

    /// Number of layers above the block layer.
    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn is_static(&self) -> bool {
        self.top().read_only
    }

    fn top(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    fn top_mut(&mut self) -> Result<&mut Layer, ExecError> {
        let n = self.layers.len();
        let top = &mut self.layers[n - 1];
        if top.read_only {
            return Err(ExecError::WriteProtection)
        }
        Ok(top)
    }

    /// Push a layer. It inherits the read-only flag.
    pub fn fork(&mut self) {
        let read_only = self.is_static();
        self.layers.push(Layer::new(read_only));
        debug!("fork layer {}", self.depth());
    }

    pub fn fork_static(&mut self) {
        self.layers.push(Layer::new(true));
        debug!("fork static layer {}", self.depth());
    }

    /// Drop the top layer and everything written to it.
    pub fn discard(&mut self) {
        if self.layers.len() > 1 {
            debug!("discard layer {}", self.depth());
            self.layers.pop();
        }
    }

    /// Fold the top layer into its parent.
    pub fn commit_top(&mut self) {
        if self.layers.len() > 1 {
            debug!("commit layer {}", self.depth());
            if let Some(top) = self.layers.pop() {
                let n = self.layers.len();
                self.layers[n - 1].absorb(top);
            }
        }
    }

    fn read_committed(&self, addr: &Addr) -> Result<Account, ExecError> {
        Ok(match self.trie.get(addr.as_bytes())? {
            Some(raw) => rlp::decode(&raw).map_err(|e| {
                StoreError::Corrupted(format!("account {}: {}", addr, e))
            })?,
            None => Account::default(),
        })
    }

    /// The current view of `addr`: the newest layer that has it, else the trie, else a fresh
    /// account that is not persisted until written.
    pub fn lookup(&self, addr: &Addr) -> Result<Cow<'_, Account>, ExecError> {
        for layer in self.layers.iter().rev() {
            if let Some(acc) = layer.accounts.get(addr) {
                return Ok(Cow::Borrowed(acc))
            }
        }
        Ok(Cow::Owned(self.read_committed(addr)?))
    }

    fn account_mut(&mut self, addr: &Addr) -> Result<&mut Account, ExecError> {
        self.top_mut()?;
        let fresh = if self.top().accounts.contains_key(addr) {
            None
        } else {
            Some(self.lookup(addr)?.into_owned())
        };
        let top = self.top_mut()?;
        Ok(top
            .accounts
            .entry(addr.clone())
            .or_insert_with(|| fresh.unwrap_or_default()))
    }

    pub fn get_balance(&self, addr: &Addr) -> Result<Wei, ExecError> {
        Ok(self.lookup(addr)?.balance.clone())
    }

    pub fn get_nonce(&self, addr: &Addr) -> Result<u64, ExecError> {
        Ok(self.lookup(addr)?.nonce)
    }

    pub fn get_created_by(
        &self, addr: &Addr,
    ) -> Result<Option<Addr>, ExecError> {
        Ok(self.lookup(addr)?.created_by.clone())
    }

    pub fn get_abi(&self, addr: &Addr) -> Result<Vec<ContractAbi>, ExecError> {
        Ok(self.lookup(addr)?.abi.clone())
    }

    /// Empty for plain accounts.
    pub fn get_code(&self, addr: &Addr) -> Result<Bytes, ExecError> {
        let hash = match &self.lookup(addr)?.code_hash {
            Some(h) => h.clone(),
            None => return Ok(Bytes::empty()),
        };
        for layer in self.layers.iter().rev() {
            if let Some(code) = layer.code.get(&hash) {
                return Ok(code.clone())
            }
        }
        Ok(self
            .store
            .get_code(&hash)?
            .ok_or(StoreError::MissingCode(hash))?)
    }

    /// Writing the current value is allowed even on a static backend.
    pub fn set_balance(
        &mut self, addr: &Addr, balance: Wei,
    ) -> Result<(), ExecError> {
        if self.get_balance(addr)? == balance {
            return Ok(())
        }
        self.account_mut(addr)?.balance = balance;
        Ok(())
    }

    pub fn set_nonce(
        &mut self, addr: &Addr, nonce: u64,
    ) -> Result<(), ExecError> {
        self.account_mut(addr)?.nonce = nonce;
        Ok(())
    }

    pub fn inc_nonce(&mut self, addr: &Addr) -> Result<u64, ExecError> {
        let acc = self.account_mut(addr)?;
        acc.nonce =
            acc.nonce.checked_add(1).ok_or(ExecError::NonceIntOverflow)?;
        Ok(acc.nonce)
    }

    pub fn set_code(
        &mut self, addr: &Addr, code: Bytes,
    ) -> Result<(), ExecError> {
        let hash = Hash::hash(&code);
        self.account_mut(addr)?.code_hash = Some(hash.clone());
        self.top_mut()?.code.insert(hash, code);
        Ok(())
    }

    pub fn set_abi(
        &mut self, addr: &Addr, abi: Vec<ContractAbi>,
    ) -> Result<(), ExecError> {
        self.account_mut(addr)?.abi = abi;
        Ok(())
    }

    pub fn set_created_by(
        &mut self, addr: &Addr, creator: Addr,
    ) -> Result<(), ExecError> {
        self.account_mut(addr)?.created_by = Some(creator);
        Ok(())
    }

    pub fn add_balance(
        &mut self, addr: &Addr, amount: &Wei,
    ) -> Result<(), ExecError> {
        let balance = self
            .get_balance(addr)?
            .checked_add(amount)
            .ok_or(ExecError::Overflow)?;
        self.set_balance(addr, balance)
    }

    pub fn sub_balance(
        &mut self, addr: &Addr, amount: &Wei,
    ) -> Result<(), ExecError> {
        let balance = self
            .get_balance(addr)?
            .checked_sub(amount)
            .ok_or(ExecError::InsufficientBalance)?;
        self.set_balance(addr, balance)
    }

    pub fn transfer(
        &mut self, from: &Addr, to: &Addr, amount: &Wei,
    ) -> Result<(), ExecError> {
        self.sub_balance(from, amount)?;
        self.add_balance(to, amount)
    }

    fn check_key(key: &[u8]) -> Result<(), ExecError> {
        if key.is_empty() {
            return Err(ExecError::InvalidKey)
        }
        Ok(())
    }

    /// `None` when the key is absent or was removed.
    pub fn db_get(
        &self, addr: &Addr, key: &[u8],
    ) -> Result<Option<Bytes>, ExecError> {
        Self::check_key(key)?;
        for layer in self.layers.iter().rev() {
            let val = layer.storage.get(addr).and_then(|m| m.get(key));
            if let Some(val) = val {
                return Ok(if val.is_empty() { None } else { Some(val.clone()) })
            }
        }
        let root = match &self.lookup(addr)?.storage_root {
            Some(r) => r.clone(),
            None => return Ok(None),
        };
        Ok(self.store.open(&root)?.get(key)?.map(Bytes::from))
    }

    /// Setting an empty value is the same as removing the key.
    pub fn db_set(
        &mut self, addr: &Addr, key: Bytes, val: Bytes,
    ) -> Result<(), ExecError> {
        Self::check_key(&key)?;
        self.top_mut()?
            .storage
            .entry(addr.clone())
            .or_default()
            .insert(key, val);
        Ok(())
    }

    pub fn db_has(&self, addr: &Addr, key: &[u8]) -> Result<bool, ExecError> {
        Ok(self.db_get(addr, key)?.is_some())
    }

    pub fn db_remove(
        &mut self, addr: &Addr, key: &[u8],
    ) -> Result<(), ExecError> {
        self.db_set(addr, key.into(), Bytes::empty())
    }

    /// Dropped silently on a static backend.
    pub fn on_event(&mut self, addr: &Addr, name: String, data: Bytes) {
        if let Ok(top) = self.top_mut() {
            top.events.push(Event {
                address: addr.clone(),
                name,
                data,
            });
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.top().events
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        let n = self.layers.len();
        std::mem::take(&mut self.layers[n - 1].events)
    }

    /// Flatten every layer (oldest first, newer writes win) into the persistent store and return
    /// the new state root. The backend continues on top of the new root with a single empty layer.
    /// If the store fails, the pending layers are left untouched.
    pub fn merge(&mut self) -> Result<Hash, ExecError> {
        let read_only = self.layers[0].read_only;
        if read_only {
            return Err(ExecError::WriteProtection)
        }
        let mut accounts: BTreeMap<Addr, Account> = BTreeMap::new();
        let mut storage: BTreeMap<Addr, BTreeMap<Bytes, Bytes>> =
            BTreeMap::new();
        let mut code: BTreeMap<Hash, Bytes> = BTreeMap::new();
        for layer in &self.layers {
            for (addr, acc) in &layer.accounts {
                accounts.insert(addr.clone(), acc.clone());
            }
            for (addr, diff) in &layer.storage {
                let slots = storage.entry(addr.clone()).or_default();
                for (k, v) in diff {
                    slots.insert(k.clone(), v.clone());
                }
            }
            for (hash, blob) in &layer.code {
                code.insert(hash.clone(), blob.clone());
            }
        }

        let mut trie = self.trie.revert(self.trie.root())?;
        for (addr, diff) in storage {
            let mut acc = match accounts.remove(&addr) {
                Some(acc) => acc,
                None => self.read_committed(&addr)?,
            };
            let prev = acc.storage_root.clone().unwrap_or_default();
            let mut sub = self.store.open(&prev)?;
            for (k, v) in diff {
                if v.is_empty() {
                    sub.remove(&k)
                } else {
                    sub.put(&k, &v)
                }
            }
            let root = sub.commit()?;
            acc.storage_root = if root.is_zero() { None } else { Some(root) };
            accounts.insert(addr, acc);
        }
        for (hash, blob) in code {
            self.store.put_code(&hash, &blob)?;
        }
        let touched = accounts.len();
        for (addr, acc) in accounts {
            if acc.is_empty() {
                trie.remove(addr.as_bytes())
            } else {
                trie.put(addr.as_bytes(), &rlp::encode(&acc))
            }
        }
        let root = trie.commit()?;
        info!("merged {} accounts, state root {}", touched, root);
        self.layers = vec![Layer::new(false)];
        self.trie = trie;
        self.block.state_root = root.clone();
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Backend {
        Backend::new(BlockInfo::default(), Arc::new(MemStore::new()), false)
            .unwrap()
    }

    #[test]
    fn test_copy_on_write() {
        let mut b = backend();
        let a = Addr::from(0x1234567);
        b.set_balance(&a, 100.into()).unwrap();
        b.fork();
        b.sub_balance(&a, &30.into()).unwrap();
        assert_eq!(b.get_balance(&a).unwrap(), 70.into());
        assert_eq!(b.layers[0].accounts[&a].balance, 100.into());
        b.discard();
        assert_eq!(b.get_balance(&a).unwrap(), 100.into());
        b.fork();
        b.inc_nonce(&a).unwrap();
        b.commit_top();
        assert_eq!(b.depth(), 0);
        assert_eq!(b.get_nonce(&a).unwrap(), 1);
    }

    #[test]
    fn test_tombstone() {
        let mut b = backend();
        let a = Addr::from(0x1234567);
        b.db_set(&a, "k".into(), "v".into()).unwrap();
        b.fork();
        b.db_remove(&a, b"k").unwrap();
        assert_eq!(b.db_get(&a, b"k").unwrap(), None);
        assert!(!b.db_has(&a, b"k").unwrap());
        b.fork();
        assert_eq!(b.db_get(&a, b"k").unwrap(), None);
        b.discard();
        b.discard();
        assert_eq!(b.db_get(&a, b"k").unwrap(), Some("v".into()));
        assert_eq!(
            b.db_set(&a, Bytes::empty(), "v".into()),
            Err(ExecError::InvalidKey)
        );
        assert_eq!(b.db_get(&a, b""), Err(ExecError::InvalidKey));
    }

    #[test]
    fn test_static() {
        let mut b = backend();
        let a = Addr::from(0x1234567);
        b.set_balance(&a, 5.into()).unwrap();
        b.fork_static();
        assert!(b.is_static());
        b.fork();
        assert!(b.is_static());
        assert_eq!(b.set_nonce(&a, 1), Err(ExecError::WriteProtection));
        assert_eq!(
            b.db_set(&a, "k".into(), "v".into()),
            Err(ExecError::WriteProtection)
        );
        // unchanged value is not a write
        b.set_balance(&a, 5.into()).unwrap();
        b.on_event(&a, "e".into(), Bytes::empty());
        assert!(b.events().is_empty());
    }

    #[test]
    fn test_underflow() {
        let mut b = backend();
        let (x, y) = (Addr::from(0x1000001), Addr::from(0x1000002));
        b.set_balance(&x, 10.into()).unwrap();
        assert_eq!(
            b.transfer(&x, &y, &11.into()),
            Err(ExecError::InsufficientBalance)
        );
        b.transfer(&x, &y, &10.into()).unwrap();
        assert!(b.get_balance(&x).unwrap().is_zero());
        assert_eq!(b.get_balance(&y).unwrap(), 10.into());
    }

    #[test]
    fn test_merge() {
        let store = Arc::new(MemStore::new());
        let mut b =
            Backend::new(BlockInfo::default(), store.clone(), false).unwrap();
        let (x, c) = (Addr::from(0x1000001), Addr::from(0x1000002));
        b.set_balance(&x, 7.into()).unwrap();
        b.set_code(&c, vec![1, 2, 3].into()).unwrap();
        b.db_set(&c, "a".into(), "1".into()).unwrap();
        b.fork();
        b.db_set(&c, "b".into(), "2".into()).unwrap();
        b.db_remove(&c, b"a").unwrap();
        let root = b.merge().unwrap();
        assert_eq!(b.depth(), 0);

        let block = BlockInfo {
            state_root: root,
            ..Default::default()
        };
        let b2 = Backend::new(block, store, false).unwrap();
        assert_eq!(b2.get_balance(&x).unwrap(), 7.into());
        assert_eq!(&b2.get_code(&c).unwrap()[..], &[1, 2, 3]);
        assert_eq!(b2.db_get(&c, b"a").unwrap(), None);
        assert_eq!(b2.db_get(&c, b"b").unwrap(), Some("2".into()));
    }

    /// Refuses to store code while `broken` is set.
    struct FlakyStore {
        inner: MemStore,
        broken: std::sync::atomic::AtomicBool,
    }

    impl WorldStateStore for FlakyStore {
        fn open(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError> {
            self.inner.open(root)
        }

        fn get_code(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
            self.inner.get_code(hash)
        }

        fn put_code(&self, hash: &Hash, code: &[u8]) -> Result<(), StoreError> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()))
            }
            self.inner.put_code(hash, code)
        }
    }

    #[test]
    fn test_merge_failure_keeps_layers() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new(),
            broken: true.into(),
        });
        let mut b =
            Backend::new(BlockInfo::default(), store.clone(), false).unwrap();
        let (x, c) = (Addr::from(0x1000001), Addr::from(0x1000002));
        b.set_balance(&x, 7.into()).unwrap();
        b.set_code(&c, vec![1, 2, 3].into()).unwrap();
        b.fork();
        b.db_set(&c, "a".into(), "1".into()).unwrap();

        assert!(matches!(b.merge(), Err(ExecError::Store(_))));
        assert_eq!(b.depth(), 1);
        assert!(b.block().state_root.is_zero());
        assert_eq!(b.get_balance(&x).unwrap(), 7.into());
        assert_eq!(b.db_get(&c, b"a").unwrap(), Some("1".into()));

        store.broken.store(false, std::sync::atomic::Ordering::SeqCst);
        let root = b.merge().unwrap();
        assert_eq!(b.depth(), 0);
        let block = BlockInfo {
            state_root: root,
            ..Default::default()
        };
        let b2 = Backend::new(block, store, false).unwrap();
        assert_eq!(b2.get_balance(&x).unwrap(), 7.into());
        assert_eq!(&b2.get_code(&c).unwrap()[..], &[1, 2, 3]);
        assert_eq!(b2.db_get(&c, b"a").unwrap(), Some("1".into()));
    }
}
