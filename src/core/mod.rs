//! The execution core: call descriptors, the fault taxonomy, the contract with the (pluggable)
//! bytecode interpreter, and the [Executor](exec::Executor) that dispatches calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::builtin::Builtin;
use crate::common::{Addr, Bytes, Gas, Hash, Wei};

pub mod abi;
pub mod alu;
pub mod exec;
pub mod host;
pub mod limit;
pub mod params;

pub use exec::Executor;
pub use host::{HostId, HostTable};
pub use limit::Limit;
pub use params::VmConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CallKind {
    Transfer,
    Deploy,
    Call,
    Coinbase,
}

impl CallKind {
    pub fn from_u8(t: u8) -> Result<Self, ExecError> {
        Ok(match t {
            0 => CallKind::Coinbase,
            1 => CallKind::Transfer,
            2 => CallKind::Deploy,
            3 => CallKind::Call,
            _ => return Err(ExecError::InvalidCallKind(t)),
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CallKind::Coinbase => 0,
            CallKind::Transfer => 1,
            CallKind::Deploy => 2,
            CallKind::Call => 3,
        }
    }
}

/// One invocation. Nested calls get their own deep copy.
#[derive(Clone, Debug)]
pub struct CallData {
    pub kind: CallKind,
    pub caller: Addr,
    /// Recipient. For deploys this is the derived contract address once dispatch starts.
    pub to: Addr,
    pub value: Wei,
    pub payload: Bytes,
    // transaction-level metadata, unchanged across the call tree
    pub origin: Addr,
    pub tx_hash: Hash,
    pub tx_nonce: u64,
    pub tx_to: Addr,
    pub tx_value: Wei,
    pub gas_price: Wei,
    pub gas_limit: Gas,
    pub signature: Bytes,
}

impl CallData {
    /// A call descriptor where the caller is also the origin of the transaction.
    pub fn new(
        kind: CallKind, caller: Addr, to: Addr, value: Wei, payload: Bytes,
    ) -> Self {
        Self {
            kind,
            origin: caller.clone(),
            tx_to: to.clone(),
            tx_value: value.clone(),
            caller,
            to,
            value,
            payload,
            tx_hash: Hash::zero().clone(),
            tx_nonce: 0,
            gas_price: Wei::zero().clone(),
            gas_limit: 0,
            signature: Bytes::empty(),
        }
    }

    pub fn with_gas(mut self, gas_limit: Gas, gas_price: Wei) -> Self {
        self.gas_limit = gas_limit;
        self.gas_price = gas_price;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.tx_nonce = nonce;
        self
    }

    /// Coinbase crediting `reward` to `miner`.
    pub fn coinbase(miner: Addr, reward: Wei) -> Self {
        Self::new(
            CallKind::Coinbase,
            Addr::zero().clone(),
            miner,
            reward,
            Bytes::empty(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Event {
    pub address: Addr,
    pub name: String,
    pub data: Bytes,
}

/// Output of one top-level execution.
#[derive(Clone, Debug)]
pub struct VmResult {
    pub gas_used: Gas,
    pub contract_address: Option<Addr>,
    pub return_data: Bytes,
    pub events: Vec<Event>,
    pub fee: Wei,
    /// The fault that aborted the transaction. Its state changes were discarded but the fee was
    /// still charged.
    pub error: Option<ExecError>,
}

impl VmResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Validation,
    Resource,
    Arithmetic,
    Native,
    Interpreter,
    Store,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    // validation
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("invalid call kind {0}")]
    InvalidCallKind(u8),
    #[error("cannot call the constructor directly")]
    ConstructorCall,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid storage key")]
    InvalidKey,
    #[error("address {0} is reserved")]
    ReservedAddress(Addr),
    #[error("{0} is not a contract")]
    NotContract(Addr),
    #[error("contract address collision at {0}")]
    ContractAddrCollision(Addr),
    #[error("method {0} not found")]
    MethodNotFound(String),
    #[error("method {0} is not payable")]
    NotPayable(String),
    #[error("return values do not match the abi")]
    AbiMismatch,
    #[error("write to a static backend")]
    WriteProtection,
    #[error("invalid host call")]
    InvalidHostCall,
    // resource
    #[error("out of gas")]
    OutOfGas,
    #[error("gas overflow")]
    GasIntOverflow,
    #[error("step limit exceeded")]
    StepLimit,
    #[error("memory limit exceeded")]
    MemoryLimit,
    #[error("frame limit exceeded")]
    FrameLimit,
    #[error("call depth exceeded")]
    Depth,
    // arithmetic
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("arithmetic underflow")]
    Underflow,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("divided by zero")]
    DivisionByZero,
    #[error("nonce overflow")]
    NonceIntOverflow,
    // native contracts
    #[error("{0}")]
    Native(String),
    // interpreter
    #[error("invalid module: {0}")]
    InvalidModule(String),
    #[error("trap: {0}")]
    Trap(String),
    #[error("memory access out of bounds")]
    MemoryAccess,
    // storage collaborator
    #[error("store: {0}")]
    Store(String),
}

impl ExecError {
    pub fn kind(&self) -> FaultKind {
        use ExecError::*;
        match self {
            InvalidNonce { .. } | InvalidCallKind(_) | ConstructorCall |
            MalformedPayload(_) | InvalidKey | ReservedAddress(_) |
            NotContract(_) | ContractAddrCollision(_) | MethodNotFound(_) |
            NotPayable(_) | AbiMismatch | WriteProtection | InvalidHostCall => {
                FaultKind::Validation
            }
            OutOfGas | GasIntOverflow | StepLimit | MemoryLimit |
            FrameLimit | Depth => FaultKind::Resource,
            InsufficientBalance | Underflow | Overflow | DivisionByZero |
            NonceIntOverflow => FaultKind::Arithmetic,
            Native(_) => FaultKind::Native,
            InvalidModule(_) | Trap(_) | MemoryAccess => {
                FaultKind::Interpreter
            }
            Store(_) => FaultKind::Store,
        }
    }
}

impl From<rlp::DecoderError> for ExecError {
    fn from(e: rlp::DecoderError) -> Self {
        ExecError::MalformedPayload(e.to_string())
    }
}

/// Callbacks an [Instance] makes into the host while executing.
pub trait Env {
    fn on_instruction(&mut self) -> Result<(), ExecError>;
    /// `pages` is the total memory size the instance is about to have.
    fn on_memory_grow(&mut self, pages: u32) -> Result<(), ExecError>;
    fn on_frame_enter(&mut self) -> Result<(), ExecError>;
    fn on_frame_exit(&mut self);
    /// Invoke a host function. The calling instance is passed back so the host can read its
    /// memory and allocate in it.
    fn host_call(
        &mut self, id: HostId, args: &[u64], instance: &mut dyn Instance,
    ) -> Result<u64, ExecError>;
}

/// An instantiated bytecode module with its own linear memory.
pub trait Instance {
    fn has_export(&self, name: &str) -> bool;
    fn invoke(
        &mut self, export: &str, args: &[u64], env: &mut dyn Env,
    ) -> Result<Vec<u64>, ExecError>;
    fn load(&self, offset: u64, len: u64) -> Result<Vec<u8>, ExecError>;
    fn store(&mut self, offset: u64, data: &[u8]) -> Result<(), ExecError>;
    fn memory_pages(&self) -> u32;
}

/// The bytecode interpreter. Any implementation satisfying this contract can be plugged in.
pub trait Interpreter: Send + Sync {
    /// Parse and link `code`. Imports are resolved against `hosts`; an unknown import is an
    /// invalid module. Initial memory above `max_pages` fails with [ExecError::MemoryLimit]
    /// before anything is allocated.
    fn instantiate(
        &self, code: &[u8], hosts: &HostTable, max_pages: u32,
    ) -> Result<Box<dyn Instance>, ExecError>;
}

/// Everything an [Executor] needs besides the state: protocol parameters, the interpreter, and
/// the native contracts. Shared by all transactions of a block.
pub struct TxExecEnv {
    pub config: VmConfig,
    pub interpreter: Arc<dyn Interpreter>,
    pub builtins: BTreeMap<Addr, Arc<dyn Builtin>>,
    /// Hooks run on every coinbase, in address order.
    pub bios: BTreeMap<Addr, Arc<dyn Builtin>>,
}

impl TxExecEnv {
    pub fn new(interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            config: VmConfig::default(),
            interpreter,
            builtins: BTreeMap::new(),
            bios: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_builtin(mut self, b: Arc<dyn Builtin>) -> Self {
        self.builtins.insert(b.address().clone(), b);
        self
    }

    /// Register a coinbase hook. Bios contracts are callable like any other built-in too.
    pub fn add_bios(mut self, b: Arc<dyn Builtin>) -> Self {
        self.builtins.insert(b.address().clone(), b.clone());
        self.bios.insert(b.address().clone(), b);
        self
    }
}
