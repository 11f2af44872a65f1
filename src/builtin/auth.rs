use log::info;

use super::{
    addr_arg, decode_addrs, decode_call, encode_addrs, returns, Builtin,
};
use crate::common::{Addr, Bytes};
use crate::core::abi::{AbiType, AbiValue, ContractAbi};
use crate::core::{CallData, ExecError};
use crate::state::Backend;

const NODES_KEY: &[u8] = b"nodes";
const PENDING_PREFIX: &[u8] = b"pending";

/// Validator set management. Any account may ask to `join`; it becomes a node once at least
/// two thirds (rounded up) of the current nodes `approve` it. A node may `exit` as long as
/// another node remains.
pub struct Authentication {
    address: Addr,
    genesis_nodes: Vec<Addr>,
}

fn fail(msg: String) -> ExecError {
    ExecError::Native(format!("authentication: {}", msg))
}

fn pending_key(candidate: &Addr) -> Vec<u8> {
    [PENDING_PREFIX, candidate.as_bytes()].concat()
}

/// Approvals needed to admit a candidate into a set of `nodes`.
pub fn quorum(nodes: usize) -> usize {
    (nodes * 2 + 2) / 3
}

impl Authentication {
    pub fn new(address: Addr, genesis_nodes: Vec<Addr>) -> Self {
        Self {
            address,
            genesis_nodes,
        }
    }

    fn nodes(&self, backend: &Backend) -> Result<Vec<Addr>, ExecError> {
        match backend.db_get(&self.address, NODES_KEY)? {
            Some(raw) => decode_addrs(&raw),
            None => Ok(Vec::new()),
        }
    }

    fn save_nodes(
        &self, backend: &mut Backend, nodes: &[Addr],
    ) -> Result<(), ExecError> {
        backend.db_set(&self.address, NODES_KEY.into(), encode_addrs(nodes))
    }

    /// Approvers of `candidate`, or `None` if it has not asked to join.
    fn pending(
        &self, backend: &Backend, candidate: &Addr,
    ) -> Result<Option<Vec<Addr>>, ExecError> {
        match backend.db_get(&self.address, &pending_key(candidate))? {
            Some(raw) => Ok(Some(decode_addrs(&raw)?)),
            None => Ok(None),
        }
    }

    fn join(
        &self, backend: &mut Backend, from: &Addr,
    ) -> Result<(), ExecError> {
        if self.nodes(backend)?.contains(from) {
            return Err(fail(format!("{} is already a node", from)))
        }
        if self.pending(backend, from)?.is_some() {
            return Err(fail(format!("{} is already pending", from)))
        }
        backend.db_set(
            &self.address,
            pending_key(from).into(),
            encode_addrs(&[]),
        )
    }

    fn approve(
        &self, backend: &mut Backend, from: &Addr, candidate: &Addr,
    ) -> Result<(), ExecError> {
        let mut nodes = self.nodes(backend)?;
        if !nodes.contains(from) {
            return Err(fail(format!("{} is not a node", from)))
        }
        let mut approvals = self
            .pending(backend, candidate)?
            .ok_or_else(|| fail(format!("{} is not pending", candidate)))?;
        if approvals.contains(from) {
            return Err(fail(format!("{} already approved {}", from, candidate)))
        }
        approvals.push(from.clone());
        approvals.sort();
        if approvals.len() >= quorum(nodes.len()) {
            info!("{} joins the validator set", candidate);
            backend.db_remove(&self.address, &pending_key(candidate))?;
            nodes.push(candidate.clone());
            self.save_nodes(backend, &nodes)
        } else {
            backend.db_set(
                &self.address,
                pending_key(candidate).into(),
                encode_addrs(&approvals),
            )
        }
    }

    fn exit(
        &self, backend: &mut Backend, from: &Addr,
    ) -> Result<(), ExecError> {
        let mut nodes = self.nodes(backend)?;
        if !nodes.contains(from) {
            return Err(fail(format!("{} is not a node", from)))
        }
        if nodes.len() <= 1 {
            return Err(fail("the last node cannot exit".into()))
        }
        nodes.retain(|n| n != from);
        info!("{} leaves the validator set", from);
        self.save_nodes(backend, &nodes)
    }
}

impl Builtin for Authentication {
    fn address(&self) -> &Addr {
        &self.address
    }

    fn abi(&self) -> Vec<ContractAbi> {
        vec![
            ContractAbi::function("join", vec![], vec![]),
            ContractAbi::function("approve", vec![AbiType::Address], vec![]),
            ContractAbi::function("exit", vec![], vec![]),
            ContractAbi::function("approved", vec![], vec![AbiType::Bytes]),
            ContractAbi::function(
                "pending",
                vec![AbiType::Address],
                vec![AbiType::Bytes],
            ),
        ]
    }

    fn genesis_storage(&self) -> Vec<(Bytes, Bytes)> {
        vec![(NODES_KEY.into(), encode_addrs(&self.genesis_nodes))]
    }

    fn call(
        &self, backend: &mut Backend, call: &CallData,
    ) -> Result<Bytes, ExecError> {
        let payload = decode_call(call)?;
        let from = &call.caller;
        match payload.method.as_str() {
            "approved" => {
                let nodes = self.nodes(backend)?;
                Ok(returns(vec![AbiValue::Bytes(encode_addrs(&nodes))]))
            }
            "pending" => {
                let candidate = addr_arg(&payload, 0)?;
                let approvals =
                    self.pending(backend, &candidate)?.unwrap_or_default();
                Ok(returns(vec![AbiValue::Bytes(encode_addrs(&approvals))]))
            }
            "join" => self.join(backend, from).map(|_| Bytes::empty()),
            "approve" => {
                let candidate = addr_arg(&payload, 0)?;
                self.approve(backend, from, &candidate)
                    .map(|_| Bytes::empty())
            }
            "exit" => self.exit(backend, from).map(|_| Bytes::empty()),
            m => Err(ExecError::MethodNotFound(m.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::abi::CallPayload;
    use crate::core::CallKind;
    use crate::state::{BlockInfo, MemStore};
    use std::sync::Arc;

    fn call(
        auth: &Authentication, backend: &mut Backend, from: u64, method: &str,
        args: Vec<AbiValue>,
    ) -> Result<Bytes, ExecError> {
        let payload = CallPayload::new(method, args).encode();
        let data = CallData::new(
            CallKind::Call,
            Addr::from(from),
            auth.address().clone(),
            0.into(),
            payload,
        );
        auth.call(backend, &data)
    }

    fn approved(auth: &Authentication, backend: &mut Backend) -> Vec<Addr> {
        let ret = call(auth, backend, 0x99, "approved", vec![]).unwrap();
        match &AbiValue::decode_list(&ret).unwrap()[0] {
            AbiValue::Bytes(b) => decode_addrs(b).unwrap(),
            v => panic!("unexpected {:?}", v),
        }
    }

    fn setup(nodes: &[u64]) -> (Authentication, Backend) {
        let auth = Authentication::new(
            Addr::from(1),
            nodes.iter().map(|n| Addr::from(0x100 + *n)).collect(),
        );
        let mut backend = Backend::new(
            BlockInfo::default(),
            Arc::new(MemStore::new()),
            false,
        )
        .unwrap();
        for (k, v) in auth.genesis_storage() {
            backend.db_set(auth.address(), k, v).unwrap();
        }
        (auth, backend)
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(6), 4);
    }

    #[test]
    fn test_join_and_approve() {
        let (auth, mut b) = setup(&[1, 2, 3]);
        let candidate = Addr::from(0x200);
        call(&auth, &mut b, 0x200, "join", vec![]).unwrap();
        assert!(call(&auth, &mut b, 0x200, "join", vec![]).is_err());

        let arg = vec![AbiValue::Address(candidate.clone())];
        // only nodes may approve
        assert!(call(&auth, &mut b, 0x300, "approve", arg.clone()).is_err());
        call(&auth, &mut b, 0x101, "approve", arg.clone()).unwrap();
        assert!(call(&auth, &mut b, 0x101, "approve", arg.clone()).is_err());
        assert!(!approved(&auth, &mut b).contains(&candidate));

        call(&auth, &mut b, 0x102, "approve", arg.clone()).unwrap();
        let nodes = approved(&auth, &mut b);
        assert_eq!(nodes.len(), 4);
        assert!(nodes.contains(&candidate));
        // no longer pending
        assert!(call(&auth, &mut b, 0x103, "approve", arg).is_err());
    }

    #[test]
    fn test_exit() {
        let (auth, mut b) = setup(&[1, 2]);
        assert!(call(&auth, &mut b, 0x300, "exit", vec![]).is_err());
        call(&auth, &mut b, 0x101, "exit", vec![]).unwrap();
        assert_eq!(approved(&auth, &mut b), vec![Addr::from(0x102)]);
        assert!(matches!(
            call(&auth, &mut b, 0x102, "exit", vec![]),
            Err(ExecError::Native(_))
        ));
        assert!(matches!(
            call(&auth, &mut b, 0x102, "nope", vec![]),
            Err(ExecError::MethodNotFound(_))
        ));
    }
}
