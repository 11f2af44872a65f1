//! Drives the [Executor] over whole blocks: one root [Backend] per block, the coinbase first, then
//! every transaction in order, then a single merge into the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::common::{Addr, Bytes, Gas, Hash, Wei};
use crate::core::{CallData, Event, ExecError, Executor, TxExecEnv, VmResult};
use crate::state::{Backend, BlockInfo, WorldStateStore};
use crate::tx::Tx;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: Hash,
    pub success: bool,
    pub gas_used: Gas,
    pub cumulative_gas_used: Gas,
    pub fee: Wei,
    pub contract_address: Option<Addr>,
    pub return_data: Bytes,
    pub events: Vec<Event>,
    /// Why the transaction faulted.
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct BlockOutcome {
    pub state_root: Hash,
    pub receipts: Vec<Receipt>,
    /// Transactions left out of the block.
    pub rejected: Vec<(Hash, ExecError)>,
    pub gas_used: Gas,
}

/// Apply one transaction to the backend's current layer.
pub fn run_single_tx(
    backend: &mut Backend, env: &TxExecEnv, tx: &Tx,
) -> Result<VmResult, ExecError> {
    Executor::execute(backend, env, tx.call_data()?)
}

/// Execute a block on top of `block.state_root` and commit it.
///
/// A faulted transaction is still part of the block (it pays its fee and gets a failed receipt);
/// a rejected one is skipped. A failing coinbase invalidates the whole block.
pub fn apply_block(
    store: Arc<dyn WorldStateStore>, env: &TxExecEnv, block: BlockInfo,
    reward: Wei, txs: &[Tx],
) -> Result<BlockOutcome, ExecError> {
    let height = block.height;
    let coinbase = CallData::coinbase(block.coinbase.clone(), reward);
    let mut backend = Backend::new(block, store, false)?;
    if let Some(e) = Executor::execute(&mut backend, env, coinbase)?.error {
        return Err(e)
    }

    let mut receipts = Vec::with_capacity(txs.len());
    let mut rejected = Vec::new();
    let mut cumulative: Gas = 0;
    for tx in txs {
        match run_single_tx(&mut backend, env, tx) {
            Ok(ret) => {
                cumulative = cumulative.saturating_add(ret.gas_used);
                receipts.push(Receipt {
                    tx_hash: tx.hash().clone(),
                    success: ret.is_success(),
                    gas_used: ret.gas_used,
                    cumulative_gas_used: cumulative,
                    fee: ret.fee,
                    contract_address: ret.contract_address,
                    return_data: ret.return_data,
                    events: ret.events,
                    error: ret.error.map(|e| e.to_string()),
                })
            }
            Err(e) => {
                warn!("rejected transaction {}: {}", tx.hash(), e);
                rejected.push((tx.hash().clone(), e))
            }
        }
    }

    let state_root = backend.merge()?;
    info!(
        "block {} applied: {} txs, {} rejected, gas {}, state root {}",
        height,
        receipts.len(),
        rejected.len(),
        cumulative,
        state_root
    );
    Ok(BlockOutcome {
        state_root,
        receipts,
        rejected,
        gas_used: cumulative,
    })
}

/// Run a call against committed state without changing it, e.g. to query a contract's views.
/// The call is still metered against its own gas limit, but nothing is charged.
pub fn call_static(
    store: Arc<dyn WorldStateStore>, env: &TxExecEnv, block: BlockInfo,
    call: CallData,
) -> Result<VmResult, ExecError> {
    let mut backend = Backend::new(block, store, true)?;
    Executor::execute(&mut backend, env, call)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenesisConfig {
    pub alloc: BTreeMap<Addr, Wei>,
}

impl GenesisConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Build the state of the genesis block: the allocations plus every built-in's ABI and initial
/// storage. Returns the genesis state root.
pub fn genesis(
    store: Arc<dyn WorldStateStore>, env: &TxExecEnv, config: &GenesisConfig,
) -> Result<Hash, ExecError> {
    let mut backend = Backend::new(BlockInfo::default(), store, false)?;
    for (addr, balance) in &config.alloc {
        backend.add_balance(addr, balance)?;
    }
    for b in env.builtins.values() {
        backend.set_abi(b.address(), b.abi())?;
        for (k, v) in b.genesis_storage() {
            backend.db_set(b.address(), k, v)?;
        }
    }
    let root = backend.merge()?;
    info!("genesis state root {}", root);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{encode_addrs, Authentication, PowBios};
    use crate::common::U256;
    use crate::core::abi::{AbiValue, CallPayload};
    use crate::core::{CallKind, HostTable, Instance, Interpreter};
    use crate::state::MemStore;

    struct NoVm;

    impl Interpreter for NoVm {
        fn instantiate(
            &self, _code: &[u8], _hosts: &HostTable, _max_pages: u32,
        ) -> Result<Box<dyn Instance>, ExecError> {
            Err(ExecError::InvalidModule("no interpreter".into()))
        }
    }

    fn env() -> TxExecEnv {
        TxExecEnv::new(Arc::new(NoVm))
            .add_builtin(Arc::new(Authentication::new(
                Addr::from(1),
                vec![Addr::from(0xa)],
            )))
            .add_bios(Arc::new(PowBios::new(
                Addr::from(2),
                U256::from(1000u64),
                10,
                10,
            )))
    }

    fn transfer(nonce: u64, to: u64, value: u64) -> Tx {
        Tx::new(
            CallKind::Transfer,
            nonce,
            1.into(),
            100,
            Addr::from(0xa),
            Some(Addr::from(to)),
            value.into(),
            Bytes::empty(),
        )
    }

    #[test]
    fn test_genesis_config() {
        let config = GenesisConfig::from_json(
            r#"{"alloc": {"0x000000000000000000000000000000000000000a": "0x64"}}"#,
        )
        .unwrap();
        assert_eq!(config.alloc[&Addr::from(0xa)], Wei::from(100));
    }

    #[test]
    fn test_apply_block() {
        let store: Arc<dyn WorldStateStore> = Arc::new(MemStore::new());
        let env = env();
        let mut alloc = BTreeMap::new();
        alloc.insert(Addr::from(0xa), Wei::from(1000));
        let root =
            genesis(store.clone(), &env, &GenesisConfig { alloc }).unwrap();

        let block = BlockInfo {
            state_root: root.clone(),
            height: 1,
            timestamp: 10,
            coinbase: Addr::from(0xc),
            ..Default::default()
        };
        // the second transaction reuses nonce 0 and is rejected
        let txs = vec![
            transfer(0, 0xb, 30),
            transfer(0, 0xb, 30),
            transfer(1, 0xb, 5000),
        ];
        let out =
            apply_block(store.clone(), &env, block.clone(), 50.into(), &txs)
                .unwrap();
        assert_ne!(out.state_root, root);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.receipts.len(), 2);
        assert!(out.receipts[0].success);
        assert_eq!(out.receipts[0].gas_used, 10);
        // overdraft faults but still pays
        assert!(!out.receipts[1].success);
        assert_eq!(out.receipts[1].cumulative_gas_used, out.gas_used);

        let next = BlockInfo {
            state_root: out.state_root.clone(),
            height: 2,
            ..Default::default()
        };
        let b = Backend::new(next.clone(), store.clone(), true).unwrap();
        assert_eq!(b.get_balance(&Addr::from(0xb)).unwrap(), Wei::from(30));
        assert_eq!(b.get_balance(&Addr::from(0xc)).unwrap(), Wei::from(50));
        assert_eq!(b.get_nonce(&Addr::from(0xa)).unwrap(), 2);
        assert_eq!(
            b.get_balance(&Addr::from(0xa)).unwrap(),
            Wei::from(1000 - 30 - 10 - out.receipts[1].gas_used)
        );

        let view = CallData::new(
            CallKind::Call,
            Addr::from(0xa),
            Addr::from(1),
            0.into(),
            CallPayload::new("approved", vec![]).encode(),
        )
        .with_gas(10_000, 0.into());
        let ret = call_static(store, &env, next, view).unwrap();
        assert!(ret.is_success());
        assert_eq!(
            AbiValue::decode_list(&ret.return_data).unwrap(),
            vec![AbiValue::Bytes(encode_addrs(&[Addr::from(0xa)]))]
        );
        assert_eq!(ret.fee, Wei::from(0));
    }

    #[test]
    fn test_user_coinbase_rejected() {
        let store: Arc<dyn WorldStateStore> = Arc::new(MemStore::new());
        let env = env();
        let root = genesis(store.clone(), &env, &GenesisConfig::default())
            .unwrap();
        let block = BlockInfo {
            state_root: root,
            height: 1,
            coinbase: Addr::from(0xc),
            ..Default::default()
        };
        let attacker = Addr::from(0xe);
        let mint = Tx::new(
            CallKind::Coinbase,
            0,
            0.into(),
            0,
            attacker.clone(),
            Some(attacker.clone()),
            1_000_000_000.into(),
            Bytes::empty(),
        );
        let out = apply_block(
            store.clone(),
            &env,
            block,
            50.into(),
            &[mint.clone()],
        )
        .unwrap();
        assert!(out.receipts.is_empty());
        assert_eq!(
            out.rejected,
            vec![(
                mint.hash().clone(),
                ExecError::InvalidCallKind(CallKind::Coinbase.as_u8())
            )]
        );

        let next = BlockInfo {
            state_root: out.state_root,
            height: 2,
            ..Default::default()
        };
        let b = Backend::new(next, store, true).unwrap();
        assert_eq!(b.get_balance(&attacker).unwrap(), Wei::from(0));
        assert_eq!(b.get_balance(&Addr::from(0xc)).unwrap(), Wei::from(50));
    }
}
