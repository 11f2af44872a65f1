//! Host functions exposed to contract bytecode.
//!
//! Every host function takes and returns `u64`s only (see [abi](super::abi) for how byte-like
//! values travel as blob pointers). Each one is bound to the [Frame] of the calling contract, so
//! storage, events and transfers are always scoped to the executing address.

use log::{debug, trace};
use num_traits::FromPrimitive;

use super::abi::{
    read_addr, read_blob, read_string, read_u256, write_blob, AbiValue,
    CallPayload, ContractAbi, DeployPayload, Parameters,
};
use super::alu::{self, U256Op};
use super::exec::Executor;
use super::params::INIT_METHOD;
use super::{CallKind, Env, ExecError, Instance};
use crate::common::{create_addr, u256_to_bytes, Addr, Bytes, Wei};
use crate::state::Backend;

/// Index of a host function in the host table, handed out at link time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostId(pub usize);

type HostFn =
    fn(&mut Frame<'_, '_>, &[u64], &mut dyn Instance) -> Result<u64, ExecError>;

const HOST_FUNCTIONS: &[(&str, HostFn)] = &[
    ("_db", db),
    ("_context", context),
    ("_transfer", transfer),
    ("_event", event),
    ("_u256", u256),
    ("_reflect", reflect),
    ("_log", log_text),
];

/// The import namespace a module is linked against.
pub struct HostTable;

impl HostTable {
    pub fn resolve(&self, name: &str) -> Option<HostId> {
        HOST_FUNCTIONS
            .iter()
            .position(|(n, _)| *n == name)
            .map(HostId)
    }

    pub fn name(&self, id: HostId) -> Option<&'static str> {
        HOST_FUNCTIONS.get(id.0).map(|(n, _)| *n)
    }
}

/// The execution environment of one running contract invocation.
pub struct Frame<'e, 'a> {
    exec: &'e mut Executor<'a>,
}

impl<'e, 'a> Frame<'e, 'a> {
    pub fn new(exec: &'e mut Executor<'a>) -> Self {
        Self { exec }
    }

    /// The executing contract.
    fn address(&self) -> Addr {
        self.exec.call.to.clone()
    }

    fn backend(&mut self) -> &mut Backend {
        &mut *self.exec.backend
    }
}

impl<'e, 'a> Env for Frame<'e, 'a> {
    fn on_instruction(&mut self) -> Result<(), ExecError> {
        self.exec.limit.on_instruction()
    }

    fn on_memory_grow(&mut self, pages: u32) -> Result<(), ExecError> {
        self.exec.limit.on_memory_grow(pages)
    }

    fn on_frame_enter(&mut self) -> Result<(), ExecError> {
        self.exec.limit.on_frame_enter()
    }

    fn on_frame_exit(&mut self) {
        self.exec.limit.on_frame_exit()
    }

    fn host_call(
        &mut self, id: HostId, args: &[u64], instance: &mut dyn Instance,
    ) -> Result<u64, ExecError> {
        self.exec.limit.on_host_call()?;
        let (name, f) =
            HOST_FUNCTIONS.get(id.0).ok_or(ExecError::InvalidHostCall)?;
        trace!("{} {}{:?}", self.exec.call.to, name, args);
        f(self, args, instance)
    }
}

#[inline]
fn arg(args: &[u64], i: usize) -> Result<u64, ExecError> {
    args.get(i).copied().ok_or(ExecError::InvalidHostCall)
}

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbOp {
    Set = 0,
    Get = 1,
    Has = 2,
    Remove = 3,
}

/// `_db(op, key, value)`: the calling contract's own storage. `Get` returns 0 for an absent key.
fn db(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let op = DbOp::from_u64(arg(args, 0)?).ok_or(ExecError::InvalidHostCall)?;
    let addr = frame.address();
    let key = read_blob(inst, arg(args, 1)?)?;
    match op {
        DbOp::Set => {
            let val = read_blob(inst, arg(args, 2)?)?;
            frame.backend().db_set(&addr, key.into(), val.into())?;
            Ok(0)
        }
        DbOp::Get => {
            let val = frame.backend().db_get(&addr, &key)?;
            match val {
                Some(v) => write_blob(inst, &v, frame),
                None => Ok(0),
            }
        }
        DbOp::Has => Ok(frame.backend().db_has(&addr, &key)? as u64),
        DbOp::Remove => {
            frame.backend().db_remove(&addr, &key)?;
            Ok(0)
        }
    }
}

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextOp {
    ParentHash = 0,
    BlockTimestamp = 1,
    BlockHeight = 2,
    TxNonce = 3,
    TxOrigin = 4,
    TxGasPrice = 5,
    TxAmount = 6,
    TxTo = 7,
    TxHash = 8,
    TxSignature = 9,
    ContractAddress = 10,
    ContractNonce = 11,
    ContractCreatedBy = 12,
    AccountNonce = 13,
    AccountBalance = 14,
    MsgSender = 15,
    MsgAmount = 16,
    ContractCode = 17,
    ContractAbi = 18,
}

enum ContextValue {
    Int(u64),
    Blob(Vec<u8>),
    Absent,
}

fn wei_blob(w: &Wei) -> ContextValue {
    ContextValue::Blob(u256_to_bytes(w.as_ref()))
}

/// `_context(op, addr)`: read-only queries about the block, the transaction and the current
/// message. `addr` is only read by the per-account queries.
fn context(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    use ContextValue::*;
    let op =
        ContextOp::from_u64(arg(args, 0)?).ok_or(ExecError::InvalidHostCall)?;
    let this = frame.address();
    let call = &frame.exec.call;
    let backend = &*frame.exec.backend;
    let block = backend.block();
    let value = match op {
        ContextOp::ParentHash => Blob(block.parent_hash.as_bytes().to_vec()),
        ContextOp::BlockTimestamp => Int(block.timestamp),
        ContextOp::BlockHeight => Int(block.height),
        ContextOp::TxNonce => Int(call.tx_nonce),
        ContextOp::TxOrigin => Blob(call.origin.as_bytes().to_vec()),
        ContextOp::TxGasPrice => wei_blob(&call.gas_price),
        ContextOp::TxAmount => wei_blob(&call.tx_value),
        ContextOp::TxTo => Blob(call.tx_to.as_bytes().to_vec()),
        ContextOp::TxHash => Blob(call.tx_hash.as_bytes().to_vec()),
        ContextOp::TxSignature => Blob(call.signature.to_vec()),
        ContextOp::ContractAddress => Blob(this.as_bytes().to_vec()),
        ContextOp::ContractNonce => Int(backend.get_nonce(&this)?),
        ContextOp::ContractCreatedBy => match backend.get_created_by(&this)? {
            Some(a) => Blob(a.as_bytes().to_vec()),
            None => Absent,
        },
        ContextOp::AccountNonce => {
            Int(backend.get_nonce(&read_addr(inst, arg(args, 1)?)?)?)
        }
        ContextOp::AccountBalance => {
            wei_blob(&backend.get_balance(&read_addr(inst, arg(args, 1)?)?)?)
        }
        ContextOp::MsgSender => Blob(call.caller.as_bytes().to_vec()),
        ContextOp::MsgAmount => wei_blob(&call.value),
        ContextOp::ContractCode => {
            let addr = read_addr(inst, arg(args, 1)?)?;
            let code = backend.get_code(&addr)?;
            if code.is_empty() {
                return Err(ExecError::NotContract(addr))
            }
            Blob(code.into_inner())
        }
        ContextOp::ContractAbi => {
            let addr = read_addr(inst, arg(args, 1)?)?;
            let entries = backend.get_abi(&addr)?;
            Blob(rlp::encode_list::<ContractAbi, _>(&entries).to_vec())
        }
    };
    match value {
        Int(v) => Ok(v),
        Blob(b) => write_blob(inst, &b, frame),
        Absent => Ok(0),
    }
}

/// `_transfer(to, amount)`: move value out of the executing contract.
fn transfer(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let to = read_addr(inst, arg(args, 0)?)?;
    let amount: Wei = read_u256(inst, arg(args, 1)?)?.into();
    let from = frame.address();
    frame.backend().transfer(&from, &to, &amount)?;
    Ok(0)
}

/// `_event(name, data)`
fn event(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let name = read_string(inst, arg(args, 0)?)?;
    let data = read_blob(inst, arg(args, 1)?)?;
    let addr = frame.address();
    frame.backend().on_event(&addr, name, data.into());
    Ok(0)
}

/// `_u256(op, a, b)`: 256-bit arithmetic, result as a new blob.
fn u256(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let op =
        U256Op::from_code(arg(args, 0)?).ok_or(ExecError::InvalidHostCall)?;
    let a = read_u256(inst, arg(args, 1)?)?;
    let b = read_u256(inst, arg(args, 2)?)?;
    let r = alu::apply(op, a, b)?;
    write_blob(inst, &u256_to_bytes(&r), frame)
}

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReflectOp {
    Call = 0,
    Create = 1,
}

/// `_reflect(op, target, method, params, amount, abi)`: a synchronous nested call.
///
/// For `Call`, `target` is the callee address and `params` the RLP encoded arguments; the first
/// declared return value comes back (integers raw, everything else as a blob), or 0 when the
/// callee returns nothing. For `Create`, `target` is the binary and `abi` the RLP encoded
/// interface; the new contract's address comes back.
fn reflect(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let op =
        ReflectOp::from_u64(arg(args, 0)?).ok_or(ExecError::InvalidHostCall)?;
    let params: Parameters = rlp::decode(&read_blob(inst, arg(args, 3)?)?)?;
    let amount: Wei = read_u256(inst, arg(args, 4)?)?.into();
    let this = frame.address();

    let (kind, to, payload) = match op {
        ReflectOp::Call => {
            let to = read_addr(inst, arg(args, 1)?)?;
            let method = read_string(inst, arg(args, 2)?)?;
            if method == INIT_METHOD {
                return Err(ExecError::ConstructorCall)
            }
            let payload = CallPayload {
                method,
                args: params,
            };
            (CallKind::Call, to, payload.encode())
        }
        ReflectOp::Create => {
            let binary = read_blob(inst, arg(args, 1)?)?;
            let raw_abi = read_blob(inst, arg(args, 5)?)?;
            let abi = rlp::Rlp::new(&raw_abi).as_list::<ContractAbi>()?;
            // the creator's nonce is bumped in the caller's layer
            let nonce = frame.backend().inc_nonce(&this)? - 1;
            let payload = DeployPayload {
                binary: binary.into(),
                args: params,
                abi,
            };
            (CallKind::Deploy, create_addr(&this, nonce), payload.encode())
        }
    };

    let mut child = frame.exec.fork()?;
    debug!("reflect {:?} {} -> {} at depth {}", kind, this, to, child.depth());
    child.call.kind = kind;
    child.call.caller = this;
    child.call.to = to.clone();
    child.call.value = amount;
    child.call.payload = payload;
    let ret = child.run_nested()?;

    if kind == CallKind::Deploy {
        return write_blob(inst, to.as_bytes(), frame)
    }
    match AbiValue::decode_list(&ret)?.into_iter().next() {
        None => Ok(0),
        Some(AbiValue::U64(v)) => Ok(v),
        Some(AbiValue::Bool(b)) => Ok(b as u64),
        Some(AbiValue::Bytes(b)) => write_blob(inst, &b, frame),
        Some(AbiValue::String(s)) => write_blob(inst, s.as_bytes(), frame),
        Some(AbiValue::U256(u)) => write_blob(inst, &u256_to_bytes(&u), frame),
        Some(AbiValue::Address(a)) => write_blob(inst, a.as_bytes(), frame),
    }
}

/// `_log(text)`: debug output from a contract.
fn log_text(
    frame: &mut Frame<'_, '_>, args: &[u64], inst: &mut dyn Instance,
) -> Result<u64, ExecError> {
    let text = read_blob(inst, arg(args, 0)?)?;
    debug!("{}: {}", frame.address(), String::from_utf8_lossy(&text));
    Ok(0)
}

/// Encode reflect call arguments the way `_reflect` reads them.
pub fn reflect_params(values: Vec<AbiValue>) -> Bytes {
    rlp::encode(&Parameters::new(values)).to_vec().into()
}

#[test]
fn test_host_table() {
    let t = HostTable;
    let id = t.resolve("_reflect").unwrap();
    assert_eq!(t.name(id), Some("_reflect"));
    assert!(t.resolve("_db").is_some());
    assert!(t.resolve("_nope").is_none());
    assert_eq!(t.name(HostId(HOST_FUNCTIONS.len())), None);
}
