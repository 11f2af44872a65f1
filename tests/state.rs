use std::collections::BTreeMap;
use std::sync::Arc;

use ledger_vm::common::*;
use ledger_vm::core::ExecError;
use ledger_vm::state::*;

fn backend_at(store: &Arc<MemStore>, root: &Hash, read_only: bool) -> Backend {
    let block = BlockInfo {
        state_root: root.clone(),
        ..Default::default()
    };
    Backend::new(block, store.clone(), read_only).unwrap()
}

#[test]
fn test_nested_layers() {
    // [block] <- [tx: a.x = 1] <- [call: a.x = 2, b.y = 1] (discarded)
    //                          <- [call: a.x = 3] (committed)
    let store = Arc::new(MemStore::new());
    let mut b = backend_at(&store, Hash::zero(), false);
    let a = Addr::from(0x10001);
    let c = Addr::from(0x10002);

    b.fork();
    b.db_set(&a, "x".into(), "1".into()).unwrap();
    b.on_event(&a, "first".into(), Bytes::empty());

    b.fork();
    b.db_set(&a, "x".into(), "2".into()).unwrap();
    b.db_set(&c, "y".into(), "1".into()).unwrap();
    b.on_event(&a, "dropped".into(), Bytes::empty());
    assert_eq!(b.depth(), 2);
    assert_eq!(b.db_get(&a, b"x").unwrap(), Some("2".into()));
    b.discard();
    assert_eq!(b.db_get(&a, b"x").unwrap(), Some("1".into()));
    assert_eq!(b.db_get(&c, b"y").unwrap(), None);

    b.fork();
    b.db_set(&a, "x".into(), "3".into()).unwrap();
    b.on_event(&a, "second".into(), Bytes::empty());
    b.commit_top();
    assert_eq!(b.db_get(&a, b"x").unwrap(), Some("3".into()));
    let names: Vec<_> = b.events().iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec!["first".to_string(), "second".to_string()]);

    b.commit_top();
    assert_eq!(b.depth(), 0);
    let root = b.merge().unwrap();
    assert!(!root.is_zero());

    let b = backend_at(&store, &root, true);
    assert_eq!(b.db_get(&a, b"x").unwrap(), Some("3".into()));
    assert!(!b.db_has(&c, b"y").unwrap());
}

#[test]
fn test_static_backend() {
    let store = Arc::new(MemStore::new());
    let a = Addr::from(0x10001);
    let mut b = backend_at(&store, Hash::zero(), false);
    b.set_balance(&a, 100.into()).unwrap();
    let root = b.merge().unwrap();

    let mut s = backend_at(&store, &root, true);
    assert!(s.is_static());
    assert_eq!(
        s.set_balance(&a, 50.into()),
        Err(ExecError::WriteProtection)
    );
    // rewriting the current value is not a write
    s.set_balance(&a, 100.into()).unwrap();
    assert_eq!(s.inc_nonce(&a), Err(ExecError::WriteProtection));
    assert_eq!(
        s.db_set(&a, "k".into(), "v".into()),
        Err(ExecError::WriteProtection)
    );
    s.on_event(&a, "ignored".into(), Bytes::empty());
    assert!(s.events().is_empty());
    assert_eq!(s.merge(), Err(ExecError::WriteProtection));

    // a read-only layer on top of a writable backend
    b.fork_static();
    assert!(b.is_static());
    assert_eq!(b.sub_balance(&a, &1.into()), Err(ExecError::WriteProtection));
    b.discard();
    b.sub_balance(&a, &1.into()).unwrap();
}

#[test]
fn test_code_and_empty_accounts() {
    let store = Arc::new(MemStore::new());
    let a = Addr::from(0x10001);
    let mut b = backend_at(&store, Hash::zero(), false);
    assert!(b.get_code(&a).unwrap().is_empty());
    b.fork();
    b.set_code(&a, "code".into()).unwrap();
    b.commit_top();
    let root = b.merge().unwrap();

    let mut b = backend_at(&store, &root, false);
    assert_eq!(b.get_code(&a).unwrap(), Bytes::from("code"));
    assert!(b.lookup(&a).unwrap().is_contract());

    // touching an account without changing it does not create it
    let c = Addr::from(0x10002);
    b.add_balance(&c, &0.into()).unwrap();
    assert_eq!(b.merge().unwrap(), root);

    b.add_balance(&c, &5.into()).unwrap();
    let root2 = b.merge().unwrap();
    assert_ne!(root2, root);
    b.sub_balance(&c, &5.into()).unwrap();
    assert_eq!(b.merge().unwrap(), root);
    assert!(store.versions() >= 2);
}

#[derive(Clone, Default, PartialEq, Debug)]
struct Model {
    balances: BTreeMap<Addr, Wei>,
    nonces: BTreeMap<Addr, u64>,
    storage: BTreeMap<(Addr, Vec<u8>), Vec<u8>>,
}

fn check_same(b: &Backend, m: &Model) -> bool {
    for (addr, balance) in &m.balances {
        if &b.get_balance(addr).unwrap() != balance {
            return false
        }
    }
    for (addr, nonce) in &m.nonces {
        if b.get_nonce(addr).unwrap() != *nonce {
            return false
        }
    }
    for ((addr, key), val) in &m.storage {
        if b.db_get(addr, key).unwrap().as_deref() != Some(&val[..]) {
            return false
        }
    }
    true
}

#[test]
fn test_random_cross_validate() {
    use rand::{Rng, SeedableRng};
    let addr_range = 10;
    let key_range = 30;
    let total_iter = 5000;
    let mut rng = rand::rngs::StdRng::from_seed([0; 32]);
    let store = Arc::new(MemStore::new());
    let mut b = backend_at(&store, Hash::zero(), false);
    // one model per backend layer
    let mut models = vec![Model::default()];
    let mut next_val = 0u64;
    let mut max_depth = 0;
    for _ in 0..total_iter {
        let addr = Addr::from(0x10000 + rng.gen_range(0..addr_range));
        let m = models.last_mut().unwrap();
        match rng.gen_range(0.0..1.0) {
            r if r > 0.55 => {
                let key = vec![rng.gen_range(1..key_range) as u8];
                let val = next_val.to_be_bytes().to_vec();
                next_val += 1;
                b.db_set(&addr, key.clone().into(), val.clone().into())
                    .unwrap();
                m.storage.insert((addr, key), val);
            }
            r if r > 0.45 => {
                let key = vec![rng.gen_range(1..key_range) as u8];
                b.db_remove(&addr, &key).unwrap();
                m.storage.remove(&(addr, key));
            }
            r if r > 0.35 => {
                let amount = Wei::from(rng.gen_range(0..100u64));
                b.add_balance(&addr, &amount).unwrap();
                let e = m.balances.entry(addr).or_insert_with(|| 0.into());
                *e = e.checked_add(&amount).unwrap();
            }
            r if r > 0.25 => {
                let n = b.inc_nonce(&addr).unwrap();
                let e = m.nonces.entry(addr).or_insert(0);
                *e += 1;
                assert_eq!(n, *e);
            }
            r if r > 0.15 => {
                b.fork();
                models.push(models[models.len() - 1].clone());
                max_depth = max_depth.max(b.depth());
            }
            r if r > 0.08 => {
                if b.depth() > 0 {
                    b.discard();
                    models.pop();
                }
            }
            r if r > 0.01 => {
                if b.depth() > 0 {
                    b.commit_top();
                    let top = models.pop().unwrap();
                    *models.last_mut().unwrap() = top;
                }
            }
            _ => {
                while b.depth() > 0 {
                    b.commit_top();
                    let top = models.pop().unwrap();
                    *models.last_mut().unwrap() = top;
                }
                let root = b.merge().unwrap();
                let fresh = backend_at(&store, &root, true);
                assert!(check_same(&fresh, &models[0]));
            }
        }
        assert_eq!(models.len(), b.depth() + 1);
        assert!(check_same(&b, models.last().unwrap()));
    }
    println!("max depth = {}, versions = {}", max_depth, store.versions());
}
