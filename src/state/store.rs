use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{Bytes, Hash};
use crate::core::ExecError;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown trie root {0}")]
    MissingRoot(Hash),
    #[error("missing code blob {0}")]
    MissingCode(Hash),
    #[error("corrupted entry: {0}")]
    Corrupted(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        ExecError::Store(e.to_string())
    }
}

/// A versioned key/value trie opened at some root. Writes are buffered until [Trie::commit],
/// which persists a new version and returns its root; older roots stay readable.
///
/// [Hash::zero] denotes the empty trie.
pub trait Trie: Send {
    /// The root this handle reads from.
    fn root(&self) -> &Hash;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&mut self, key: &[u8], val: &[u8]);
    fn remove(&mut self, key: &[u8]);
    fn commit(&mut self) -> Result<Hash, StoreError>;
    /// Open another version of the same trie forest.
    fn revert(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError>;
    /// All entries of the committed version, in key order.
    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// The persistent side of the ledger: a trie forest holding both the account trie and every
/// contract's storage sub-trie, plus a content-addressed code store.
pub trait WorldStateStore: Send + Sync {
    fn open(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError>;
    fn get_code(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError>;
    fn put_code(&self, hash: &Hash, code: &[u8]) -> Result<(), StoreError>;
}

type Snapshot = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
struct MemStoreInner {
    roots: RwLock<HashMap<Hash, Snapshot>>,
    code: RwLock<HashMap<Hash, Bytes>>,
}

/// In-memory [WorldStateStore]. Each committed version is kept as a full snapshot and the root
/// is the keccak hash of the RLP-encoded sorted entries.
#[derive(Clone, Default)]
pub struct MemStore(Arc<MemStoreInner>);

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed versions.
    pub fn versions(&self) -> usize {
        self.0.roots.read().len()
    }
}

impl MemStoreInner {
    fn snapshot(&self, root: &Hash) -> Result<Snapshot, StoreError> {
        if root.is_zero() {
            return Ok(Snapshot::default())
        }
        self.roots
            .read()
            .get(root)
            .cloned()
            .ok_or_else(|| StoreError::MissingRoot(root.clone()))
    }
}

impl WorldStateStore for MemStore {
    fn open(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError> {
        Ok(Box::new(MemTrie {
            store: self.0.clone(),
            root: root.clone(),
            base: self.0.snapshot(root)?,
            pending: BTreeMap::new(),
        }))
    }

    fn get_code(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
        Ok(self.0.code.read().get(hash).cloned())
    }

    fn put_code(&self, hash: &Hash, code: &[u8]) -> Result<(), StoreError> {
        self.0.code.write().insert(hash.clone(), code.into());
        Ok(())
    }
}

pub struct MemTrie {
    store: Arc<MemStoreInner>,
    root: Hash,
    base: Snapshot,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

fn snapshot_root(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Hash {
    if entries.is_empty() {
        return Hash::zero().clone()
    }
    let mut s = rlp::RlpStream::new_list(entries.len());
    for (k, v) in entries {
        s.begin_list(2).append(k).append(v);
    }
    Hash::hash(&s.out())
}

impl Trie for MemTrie {
    fn root(&self) -> &Hash {
        &self.root
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(v) = self.pending.get(key) {
            return Ok(v.clone())
        }
        Ok(self.base.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], val: &[u8]) {
        self.pending.insert(key.to_vec(), Some(val.to_vec()));
    }

    fn remove(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    fn commit(&mut self) -> Result<Hash, StoreError> {
        if self.pending.is_empty() {
            return Ok(self.root.clone())
        }
        let mut entries = (*self.base).clone();
        for (k, v) in std::mem::take(&mut self.pending) {
            match v {
                Some(v) => entries.insert(k, v),
                None => entries.remove(&k),
            };
        }
        let root = snapshot_root(&entries);
        let snapshot = Arc::new(entries);
        if !root.is_zero() {
            self.store
                .roots
                .write()
                .insert(root.clone(), snapshot.clone());
        }
        self.base = snapshot;
        self.root = root.clone();
        Ok(root)
    }

    fn revert(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError> {
        MemStore(self.store.clone()).open(root)
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .base
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions() {
        let store = MemStore::new();
        let mut t = store.open(Hash::zero()).unwrap();
        t.put(b"a", b"1");
        t.put(b"b", b"2");
        assert_eq!(t.get(b"a").unwrap(), Some(b"1".to_vec()));
        let r1 = t.commit().unwrap();
        t.remove(b"a");
        t.put(b"b", b"3");
        let r2 = t.commit().unwrap();
        assert_ne!(r1, r2);

        let old = t.revert(&r1).unwrap();
        assert_eq!(old.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(old.get(b"b").unwrap(), Some(b"2".to_vec()));
        let new = store.open(&r2).unwrap();
        assert_eq!(new.get(b"a").unwrap(), None);
        assert_eq!(
            new.entries().unwrap(),
            vec![(b"b".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn test_same_content_same_root() {
        let store = MemStore::new();
        let mut t1 = store.open(Hash::zero()).unwrap();
        t1.put(b"x", b"1");
        t1.put(b"y", b"2");
        let mut t2 = store.open(Hash::zero()).unwrap();
        t2.put(b"y", b"2");
        t2.put(b"x", b"1");
        assert_eq!(t1.commit().unwrap(), t2.commit().unwrap());
        t1.remove(b"x");
        t1.remove(b"y");
        assert_eq!(&t1.commit().unwrap(), Hash::zero());
        assert!(matches!(
            store.open(&Hash::hash(b"nope")),
            Err(StoreError::MissingRoot(_))
        ));
    }
}
