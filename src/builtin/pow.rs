use log::debug;

use super::{decode_call, returns, Builtin};
use crate::common::{u256_to_bytes, Addr, Bytes, U256};
use crate::core::abi::{AbiType, AbiValue, ContractAbi};
use crate::core::{CallData, CallKind, ExecError};
use crate::state::Backend;

const NBITS_KEY: &[u8] = b"nbits";
const TIMESTAMPS_KEY: &[u8] = b"ts";
/// Per-era difficulty changes by at most this factor in either direction.
pub const MAX_ADJUST_RATE: u64 = 16;

/// Proof-of-work difficulty retargeting, run as a coinbase hook. Block timestamps are collected
/// for one era; at the end of the era `nbits` is scaled by `actual span / expected span`.
pub struct PowBios {
    address: Addr,
    genesis_nbits: U256,
    blocks_per_era: usize,
    block_interval: u64,
}

impl PowBios {
    pub fn new(
        address: Addr, genesis_nbits: U256, blocks_per_era: usize,
        block_interval: u64,
    ) -> Self {
        Self {
            address,
            genesis_nbits,
            blocks_per_era: blocks_per_era.max(2),
            block_interval: block_interval.max(1),
        }
    }

    pub fn nbits(&self, backend: &Backend) -> Result<U256, ExecError> {
        Ok(match backend.db_get(&self.address, NBITS_KEY)? {
            Some(raw) => U256::from_big_endian(&raw),
            None => self.genesis_nbits,
        })
    }

    fn timestamps(&self, backend: &Backend) -> Result<Vec<u64>, ExecError> {
        match backend.db_get(&self.address, TIMESTAMPS_KEY)? {
            Some(raw) => Ok(rlp::Rlp::new(&raw).as_list()?),
            None => Ok(Vec::new()),
        }
    }

    fn update(&self, backend: &mut Backend) -> Result<(), ExecError> {
        let mut ts = self.timestamps(backend)?;
        ts.push(backend.block().timestamp);
        if ts.len() >= self.blocks_per_era {
            let nbits = self.nbits(backend)?;
            let actual = ts[ts.len() - 1].saturating_sub(ts[0]);
            let expected = self.block_interval * (ts.len() as u64 - 1);
            let next = retarget(nbits, actual, expected);
            debug!("retarget nbits {:x} -> {:x}", nbits, next);
            backend.db_set(
                &self.address,
                NBITS_KEY.into(),
                u256_to_bytes(&next).into(),
            )?;
            ts.clear();
        }
        backend.db_set(
            &self.address,
            TIMESTAMPS_KEY.into(),
            rlp::encode_list::<u64, _>(&ts).to_vec().into(),
        )
    }
}

/// `nbits * actual / expected`, with the ratio clamped to
/// `[1/MAX_ADJUST_RATE, MAX_ADJUST_RATE]` and the product saturating.
pub fn retarget(nbits: U256, actual: u64, expected: u64) -> U256 {
    let (mut x, mut y) = (actual, expected.max(1));
    if x > y.saturating_mul(MAX_ADJUST_RATE) {
        x = MAX_ADJUST_RATE;
        y = 1;
    }
    if x.saturating_mul(MAX_ADJUST_RATE) < y {
        x = 1;
        y = MAX_ADJUST_RATE;
    }
    let scaled = nbits.checked_mul(x.into()).unwrap_or(U256::MAX);
    scaled / U256::from(y)
}

impl Builtin for PowBios {
    fn address(&self) -> &Addr {
        &self.address
    }

    fn abi(&self) -> Vec<ContractAbi> {
        vec![
            ContractAbi::function("nbits", vec![], vec![AbiType::U256]),
            ContractAbi::function("update", vec![], vec![]),
        ]
    }

    fn genesis_storage(&self) -> Vec<(Bytes, Bytes)> {
        vec![
            (NBITS_KEY.into(), u256_to_bytes(&self.genesis_nbits).into()),
            (
                TIMESTAMPS_KEY.into(),
                rlp::encode_list::<u64, u64>(&[]).to_vec().into(),
            ),
        ]
    }

    fn call(
        &self, backend: &mut Backend, call: &CallData,
    ) -> Result<Bytes, ExecError> {
        if call.kind == CallKind::Coinbase {
            self.update(backend)?;
            return Ok(Bytes::empty())
        }
        let payload = decode_call(call)?;
        match payload.method.as_str() {
            "nbits" => Ok(returns(vec![AbiValue::U256(self.nbits(backend)?)])),
            "update" => Err(ExecError::Native(
                "pow bios: update is only allowed in coinbase".into(),
            )),
            m => Err(ExecError::MethodNotFound(m.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BlockInfo, MemStore};
    use std::sync::Arc;

    #[test]
    fn test_retarget() {
        let n = U256::from(1000);
        // on schedule
        assert_eq!(retarget(n, 30, 30), n);
        assert_eq!(retarget(n, 60, 30), U256::from(2000));
        assert_eq!(retarget(n, 15, 30), U256::from(500));
        // clamped both ways
        assert_eq!(retarget(n, 10_000, 30), U256::from(16_000));
        assert_eq!(retarget(n, 0, 30), U256::from(62));
        assert_eq!(retarget(U256::MAX, 60, 30), U256::MAX / 30);
    }

    #[test]
    fn test_update_per_era() {
        let bios = PowBios::new(Addr::from(2), U256::from(1024), 3, 10);
        let store = Arc::new(MemStore::new());
        let coinbase = CallData::coinbase(Addr::from(0xaa), 0.into());
        let mut nbits = Vec::new();
        for (i, ts) in [0u64, 20, 40, 50].iter().enumerate() {
            let block = BlockInfo {
                height: i as u64 + 1,
                timestamp: *ts,
                ..Default::default()
            };
            let mut b = Backend::new(block, store.clone(), false).unwrap();
            if i == 0 {
                for (k, v) in bios.genesis_storage() {
                    b.db_set(bios.address(), k, v).unwrap();
                }
            } else {
                // carry the bios storage over by replaying it
                for (k, v) in &carried(&nbits) {
                    b.db_set(bios.address(), k.clone(), v.clone()).unwrap();
                }
            }
            bios.call(&mut b, &coinbase).unwrap();
            nbits.push((bios.nbits(&b).unwrap(), bios.timestamps(&b).unwrap()));
        }
        // era of 3 blocks spanning 40s against an expected 20s: difficulty doubles
        assert_eq!(nbits[1].0, U256::from(1024));
        assert_eq!(nbits[2].0, U256::from(2048));
        assert!(nbits[2].1.is_empty());
        assert_eq!(nbits[3].1, vec![50]);
    }

    fn carried(history: &[(U256, Vec<u64>)]) -> Vec<(Bytes, Bytes)> {
        let (n, ts) = &history[history.len() - 1];
        vec![
            (NBITS_KEY.into(), u256_to_bytes(n).into()),
            (
                TIMESTAMPS_KEY.into(),
                rlp::encode_list::<u64, _>(ts).to_vec().into(),
            ),
        ]
    }

    #[test]
    fn test_update_only_in_coinbase() {
        let bios = PowBios::new(Addr::from(2), U256::from(7u64), 4, 10);
        let mut b = Backend::new(
            BlockInfo::default(),
            Arc::new(MemStore::new()),
            false,
        )
        .unwrap();
        let call = |method: &str| {
            CallData::new(
                CallKind::Call,
                Addr::from(0xaa),
                Addr::from(2),
                0.into(),
                crate::core::abi::CallPayload::new(method, vec![]).encode(),
            )
        };
        assert!(matches!(
            bios.call(&mut b, &call("update")),
            Err(ExecError::Native(_))
        ));
        let ret = bios.call(&mut b, &call("nbits")).unwrap();
        assert_eq!(
            AbiValue::decode_list(&ret).unwrap(),
            vec![AbiValue::U256(U256::from(7u64))]
        );
    }
}
