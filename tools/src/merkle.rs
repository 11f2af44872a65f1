use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use sync_unsafe_cell::SyncUnsafeCell;

use log::debug;
use memory_db::{KeyFunction, PrefixedKey};
use parking_lot::Mutex;
use reference_trie::{ExtensionLayout, RefHasher};
use rocksdb::{WriteBatch, DB};
use trie_db::{
    DBValue, HashDB, HashDBRef, Hasher, Trie as _, TrieDB, TrieDBMut, TrieMut,
};

use ledger_vm::common::{Bytes, Hash};
use ledger_vm::state::{StoreError, Trie, WorldStateStore};

/// A [WorldStateStore] that keeps the merkle trie forest in RocksDB. All changes are
/// copy-on-write (the DB only grows), so every root ever committed stays readable.
#[derive(Clone)]
pub struct MerkleDB(Arc<MerkleDBInner>);

struct MerkleDBInner {
    db: SyncUnsafeCell<ReadWriteDB<RefHasher, PrefixedKey<RefHasher>>>,
    /// Held while a trie is mutably borrowing `db`.
    writer: Mutex<()>,
}

struct ReadWriteDBInner {
    db: DB,
    wb: Option<WriteBatch>,
}

impl ReadWriteDBInner {
    fn get_wb(&mut self) -> &mut WriteBatch {
        self.wb.get_or_insert_with(WriteBatch::default)
    }
}

struct ReadWriteDB<H: Hasher, KF: KeyFunction<H>> {
    inner: Mutex<ReadWriteDBInner>,
    prefix: Vec<u8>,
    null_node_hash: H::Out,
    null_node_data: Vec<u8>,
    _kf: PhantomData<KF>,
}

/// Reference count of a trie node.
struct Counter(i64);

impl Counter {
    fn encode(&self) -> DBValue {
        self.0.to_le_bytes().into()
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        Some(Self(i64::from_le_bytes(raw.get(..8)?.try_into().ok()?)))
    }
}

impl std::ops::Deref for Counter {
    type Target = i64;
    fn deref(&self) -> &i64 {
        &self.0
    }
}

fn backend_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn trie_err<E: std::fmt::Debug>(e: E) -> StoreError {
    StoreError::Corrupted(format!("{:?}", e))
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>>> ReadWriteDB<H, KF> {
    const CNT_SUFFIX: [u8; 1] = [0x0; 1];
    const DATA_SUFFIX: [u8; 1] = [0x1; 1];
    const CODE_TAG: &'static [u8] = b"\xffcode";

    fn new(prefix: Vec<u8>, db: DB) -> Self {
        let null_node_data = vec![0u8];
        Self {
            inner: Mutex::new(ReadWriteDBInner { db, wb: None }),
            prefix,
            null_node_hash: H::hash(&null_node_data),
            null_node_data,
            _kf: PhantomData,
        }
    }

    fn finalize_key(
        &self, key: &H::Out, prefix: hash_db::Prefix, suffix: &[u8],
    ) -> Vec<u8> {
        let mut buff = self.prefix.clone();
        buff.extend_from_slice(&KF::key(key, prefix));
        buff.extend_from_slice(suffix);
        buff
    }

    fn code_key(&self, hash: &Hash) -> Vec<u8> {
        let mut buff = self.prefix.clone();
        buff.extend_from_slice(Self::CODE_TAG);
        buff.extend_from_slice(hash.as_bytes());
        buff
    }

    fn counter(&self, inner: &ReadWriteDBInner, cnt_key: &[u8]) -> i64 {
        match inner.db.get(cnt_key) {
            Ok(Some(raw)) => Counter::decode(&raw).map_or(0, |c| *c),
            _ => 0,
        }
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(wb) = inner.wb.take() {
            debug!("flushing {} trie writes", wb.len());
            inner.db.write(wb).map_err(backend_err)?;
        }
        Ok(())
    }

    fn get_code(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock();
        inner.db.get(self.code_key(hash)).map_err(backend_err)
    }

    fn put_code(&self, hash: &Hash, code: &[u8]) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        inner.db.put(self.code_key(hash), code).map_err(backend_err)
    }
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    hash_db::AsHashDB<H, DBValue> for ReadWriteDB<H, KF>
{
    fn as_hash_db(&self) -> &dyn HashDB<H, DBValue> {
        self
    }
    fn as_hash_db_mut<'a>(
        &'a mut self,
    ) -> &'a mut (dyn HashDB<H, DBValue> + 'a) {
        self
    }
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    HashDB<H, DBValue> for ReadWriteDB<H, KF>
{
    fn get(
        &self, key: &H::Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        if key == &self.null_node_hash {
            return Some(self.null_node_data.clone())
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        let inner = self.inner.lock();
        if self.counter(&inner, &cnt_key) > 0 {
            let data_key = self.finalize_key(key, prefix, &Self::DATA_SUFFIX);
            inner.db.get(&data_key).ok()?
        } else {
            None
        }
    }
    fn contains(&self, key: &H::Out, prefix: (&[u8], Option<u8>)) -> bool {
        if key == &self.null_node_hash {
            return true
        }
        let cnt_key = self.finalize_key(key, prefix, &Self::CNT_SUFFIX);
        let inner = self.inner.lock();
        self.counter(&inner, &cnt_key) > 0
    }
    fn emplace(
        &mut self, key: H::Out, prefix: (&[u8], Option<u8>), value: DBValue,
    ) {
        if value == self.null_node_data {
            return
        }
        let cnt_key = self.finalize_key(&key, prefix, &Self::CNT_SUFFIX);
        let data_key = self.finalize_key(&key, prefix, &Self::DATA_SUFFIX);
        let mut inner = self.inner.lock();
        let cnt = self.counter(&inner, &cnt_key);
        let wb = inner.get_wb();
        if cnt <= 0 {
            wb.put(data_key, value);
        }
        wb.put(cnt_key, Counter(cnt.max(0) + 1).encode());
    }
    fn insert(&mut self, prefix: (&[u8], Option<u8>), value: &[u8]) -> H::Out {
        if value == self.null_node_data {
            return self.null_node_hash
        }
        let key = H::hash(value);
        HashDB::emplace(self, key, prefix, value.into());
        key
    }
    // nodes are never dropped so that older roots stay readable
    fn remove(&mut self, _key: &H::Out, _prefix: (&[u8], Option<u8>)) {}
}

impl<H: Hasher, KF: KeyFunction<H, Key = Vec<u8>> + Sync + Send>
    HashDBRef<H, DBValue> for ReadWriteDB<H, KF>
{
    fn get(
        &self, key: &H::Out, prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        HashDB::get(self, key, prefix)
    }
    fn contains(&self, key: &H::Out, prefix: (&[u8], Option<u8>)) -> bool {
        HashDB::contains(self, key, prefix)
    }
}

impl MerkleDB {
    pub fn new(rocksdb: DB, prefix: &[u8]) -> Self {
        Self(Arc::new(MerkleDBInner {
            db: SyncUnsafeCell::new(ReadWriteDB::new(prefix.to_vec(), rocksdb)),
            writer: Mutex::new(()),
        }))
    }

    pub fn db(&self) -> parking_lot::MappedMutexGuard<DB> {
        parking_lot::MutexGuard::map(self.0.get_inner().inner.lock(), |e| {
            &mut e.db
        })
    }

    /// Build a proof for `keys` (present or not) under `root`.
    pub fn prove(
        &self, keys: &[&[u8]], root: &Hash,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let r = root.clone().to_fixed_bytes();
        let trie = TrieDB::<ExtensionLayout>::new(self.0.get_inner(), &r)
            .map_err(|_| StoreError::MissingRoot(root.clone()))?;
        trie_db::proof::generate_proof(&trie, keys).map_err(trie_err)
    }

    /// Check that `items` (a `None` value claims absence) agree with `root`.
    pub fn verify(
        proof: &[Vec<u8>], items: &[(Vec<u8>, Option<Vec<u8>>)], root: &Hash,
    ) -> bool {
        let r = root.clone().to_fixed_bytes();
        trie_db::proof::verify_proof::<ExtensionLayout, _, _, _>(
            &r, proof, items,
        )
        .is_ok()
    }
}

impl MerkleDBInner {
    fn get_inner(&self) -> &ReadWriteDB<RefHasher, PrefixedKey<RefHasher>> {
        unsafe { &*self.db.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn get_inner_mut(
        &self,
    ) -> &mut ReadWriteDB<RefHasher, PrefixedKey<RefHasher>> {
        unsafe { &mut *self.db.get() }
    }

    fn get(
        &self, key: &[u8], root: &Hash,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if root.is_zero() {
            return Ok(None)
        }
        let r = root.clone().to_fixed_bytes();
        let trie = TrieDB::<ExtensionLayout>::new(self.get_inner(), &r)
            .map_err(|_| StoreError::MissingRoot(root.clone()))?;
        trie.get(key).map_err(trie_err)
    }

    /// Apply `changes` on top of `root` and persist the new nodes.
    fn write(
        &self, root: &Hash, changes: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> Result<Hash, StoreError> {
        let _writer = self.writer.lock();
        let wdb = self.get_inner_mut();
        let mut new_root = root.clone().to_fixed_bytes();
        let empty = {
            let mut trie = if root.is_zero() {
                TrieDBMut::<ExtensionLayout>::new(wdb, &mut new_root)
            } else {
                TrieDBMut::<ExtensionLayout>::from_existing(wdb, &mut new_root)
                    .map_err(|_| StoreError::MissingRoot(root.clone()))?
            };
            for (k, v) in changes {
                match v {
                    Some(v) => trie.insert(k, v).map(|_| ()),
                    None => trie.remove(k).map(|_| ()),
                }
                .map_err(trie_err)?;
            }
            trie.commit();
            trie.is_empty()
        };
        self.get_inner().commit()?;
        Ok(if empty {
            Hash::zero().clone()
        } else {
            new_root.into()
        })
    }
}

impl WorldStateStore for MerkleDB {
    fn open(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError> {
        if !root.is_zero() {
            let r = root.clone().to_fixed_bytes();
            TrieDB::<ExtensionLayout>::new(self.0.get_inner(), &r)
                .map_err(|_| StoreError::MissingRoot(root.clone()))?;
        }
        Ok(Box::new(MerkleTrie {
            mdb: self.0.clone(),
            root: root.clone(),
            pending: BTreeMap::new(),
        }))
    }

    fn get_code(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
        Ok(self.0.get_inner().get_code(hash)?.map(Bytes::from))
    }

    fn put_code(&self, hash: &Hash, code: &[u8]) -> Result<(), StoreError> {
        self.0.get_inner().put_code(hash, code)
    }
}

/// A handle on one version of the forest; writes stay in memory until `commit`.
pub struct MerkleTrie {
    mdb: Arc<MerkleDBInner>,
    root: Hash,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Trie for MerkleTrie {
    fn root(&self) -> &Hash {
        &self.root
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.get(key) {
            Some(v) => Ok(v.clone()),
            None => self.mdb.get(key, &self.root),
        }
    }

    fn put(&mut self, key: &[u8], val: &[u8]) {
        self.pending.insert(key.to_vec(), Some(val.to_vec()));
    }

    fn remove(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    fn commit(&mut self) -> Result<Hash, StoreError> {
        if !self.pending.is_empty() {
            self.root = self.mdb.write(&self.root, &self.pending)?;
            self.pending.clear();
        }
        Ok(self.root.clone())
    }

    fn revert(&self, root: &Hash) -> Result<Box<dyn Trie>, StoreError> {
        WorldStateStore::open(&MerkleDB(self.mdb.clone()), root)
    }

    fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        if self.root.is_zero() {
            return Ok(Vec::new())
        }
        let r = self.root.clone().to_fixed_bytes();
        let trie = TrieDB::<ExtensionLayout>::new(self.mdb.get_inner(), &r)
            .map_err(|_| StoreError::MissingRoot(self.root.clone()))?;
        let iter = trie.iter().map_err(trie_err)?;
        iter.map(|item| item.map_err(trie_err)).collect()
    }
}
