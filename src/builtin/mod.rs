//! Native contracts: protocol logic that lives at a fixed reserved address and runs as Rust code
//! instead of bytecode. A native contract registered as a bios hook additionally runs on every
//! coinbase.

use crate::common::{Addr, Bytes};
use crate::core::abi::{AbiValue, CallPayload, ContractAbi};
use crate::core::{CallData, ExecError};
use crate::state::Backend;

mod auth;
mod pow;

pub use auth::Authentication;
pub use pow::PowBios;

pub trait Builtin: Send + Sync {
    fn address(&self) -> &Addr;

    fn abi(&self) -> Vec<ContractAbi>;

    /// Storage entries written at genesis.
    fn genesis_storage(&self) -> Vec<(Bytes, Bytes)>;

    /// Handle one call. Value has already been moved to [Builtin::address]. The returned bytes are
    /// the call's return data.
    fn call(
        &self, backend: &mut Backend, call: &CallData,
    ) -> Result<Bytes, ExecError>;
}

pub(crate) fn decode_call(call: &CallData) -> Result<CallPayload, ExecError> {
    CallPayload::decode(&call.payload)
}

pub(crate) fn addr_arg(
    payload: &CallPayload, i: usize,
) -> Result<Addr, ExecError> {
    payload
        .args
        .0
        .get(i)
        .and_then(|v| v.as_address())
        .cloned()
        .ok_or(ExecError::AbiMismatch)
}

/// Address lists as stored by native contracts and returned by their views.
pub fn encode_addrs(addrs: &[Addr]) -> Bytes {
    rlp::encode_list::<Addr, _>(addrs).to_vec().into()
}

pub fn decode_addrs(raw: &[u8]) -> Result<Vec<Addr>, ExecError> {
    Ok(rlp::Rlp::new(raw).as_list()?)
}

pub(crate) fn returns(values: Vec<AbiValue>) -> Bytes {
    AbiValue::encode_list(&values)
}
