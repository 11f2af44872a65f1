use log::{debug, warn};

use super::abi::{
    self, AbiType, AbiValue, CallPayload, ContractAbi, DeployPayload,
};
use super::host::{Frame, HostTable};
use super::params::INIT_METHOD;
use super::{CallData, CallKind, ExecError, Limit, TxExecEnv, VmResult};
use crate::builtin::Builtin;
use crate::common::{create_addr, Addr, Bytes, Wei};
use crate::state::Backend;

/// Dispatches one call of a transaction's call tree. The root executor owns nothing: the backend
/// layer stack and the gas meter are borrowed, and nested executors reborrow them from their
/// parent.
pub struct Executor<'a> {
    pub(crate) backend: &'a mut Backend,
    pub(crate) limit: &'a mut Limit,
    pub(crate) env: &'a TxExecEnv,
    pub(crate) call: CallData,
    pub(crate) depth: usize,
}

impl<'a> Executor<'a> {
    /// Apply one transaction on top of the backend's current layer.
    ///
    /// `Err` means the transaction was rejected (wrong nonce, or it cannot pay its fee) and left
    /// no trace. A transaction that faulted during execution is still `Ok`: its changes are
    /// discarded, but the nonce is bumped and the fee charged, and [VmResult::error] carries the
    /// fault.
    pub fn execute(
        backend: &mut Backend, env: &TxExecEnv, call: CallData,
    ) -> Result<VmResult, ExecError> {
        let coinbase = call.kind == CallKind::Coinbase;
        let charged = !coinbase && !backend.is_static();
        if charged {
            let nonce = backend.get_nonce(&call.origin)?;
            if nonce != call.tx_nonce {
                return Err(ExecError::InvalidNonce {
                    expected: nonce,
                    got: call.tx_nonce,
                })
            }
        }
        let mut limit = if coinbase {
            Limit::unlimited(&env.config)
        } else {
            Limit::new(call.gas_limit, &env.config)
        };
        let origin = call.origin.clone();
        let gas_price = call.gas_price.clone();

        backend.fork();
        let outcome = Executor {
            backend: &mut *backend,
            limit: &mut limit,
            env,
            call,
            depth: 0,
        }
        .execute_root();

        let gas_used = limit.gas_used();
        let fee = match Wei::from(gas_used).checked_mul(&gas_price) {
            Some(fee) => fee,
            None => {
                backend.discard();
                return Err(ExecError::Overflow)
            }
        };
        let fault = match outcome.and_then(|ret| {
            Self::charge_fee(backend, charged, &origin, &fee).map(|_| ret)
        }) {
            Ok((return_data, contract_address)) => {
                let events = backend.take_events();
                backend.commit_top();
                return Ok(VmResult {
                    gas_used,
                    contract_address,
                    return_data,
                    events,
                    fee,
                    error: None,
                })
            }
            Err(e) => e,
        };

        backend.discard();
        warn!("transaction from {} faulted: {}", origin, fault);
        if charged {
            backend.fork();
            let billed = Self::charge_fee(backend, true, &origin, &fee)
                .and_then(|_| backend.inc_nonce(&origin));
            if let Err(e) = billed {
                backend.discard();
                return Err(e)
            }
            backend.commit_top();
        }
        Ok(VmResult {
            gas_used,
            contract_address: None,
            return_data: Bytes::empty(),
            events: Vec::new(),
            fee,
            error: Some(fault),
        })
    }

    fn charge_fee(
        backend: &mut Backend, charged: bool, payer: &Addr, fee: &Wei,
    ) -> Result<(), ExecError> {
        if !charged {
            return Ok(())
        }
        backend.sub_balance(payer, fee)
    }

    fn execute_root(&mut self) -> Result<(Bytes, Option<Addr>), ExecError> {
        let coinbase = self.call.kind == CallKind::Coinbase;
        if !coinbase && !self.backend.is_static() {
            self.backend.inc_nonce(&self.call.origin)?;
        }
        let mut contract = None;
        if self.call.kind == CallKind::Deploy {
            let addr = create_addr(&self.call.caller, self.call.tx_nonce);
            self.call.to = addr.clone();
            contract = Some(addr);
        }
        if !coinbase {
            self.limit.set_initial_gas(
                self.call.payload.len(),
                self.env.config.payload_byte_gas,
            )?;
        }
        let data = self.execute_internal()?;
        Ok((data, contract))
    }

    pub fn call(&self) -> &CallData {
        &self.call
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// A child executor one level deeper, on a fresh backend layer, sharing the gas meter. The
    /// child must be finished with [Executor::run_nested].
    pub fn fork(&mut self) -> Result<Executor<'_>, ExecError> {
        if self.depth + 1 >= self.env.config.max_call_depth {
            return Err(ExecError::Depth)
        }
        self.backend.fork();
        Ok(Executor {
            backend: &mut *self.backend,
            limit: &mut *self.limit,
            env: self.env,
            call: self.call.clone(),
            depth: self.depth + 1,
        })
    }

    /// Run a forked executor and fold its layer into the parent on success, or drop it on fault.
    pub fn run_nested(mut self) -> Result<Bytes, ExecError> {
        let ret = self.execute_internal();
        match &ret {
            Ok(_) => self.backend.commit_top(),
            Err(e) => {
                debug!("call at depth {} failed: {}", self.depth, e);
                self.backend.discard()
            }
        }
        ret
    }

    pub fn execute_internal(&mut self) -> Result<Bytes, ExecError> {
        let env = self.env;
        match self.call.kind {
            CallKind::Coinbase => self.coinbase(),
            CallKind::Transfer => self.transfer(),
            CallKind::Deploy | CallKind::Call => {
                if let Some(b) = env.builtins.get(&self.call.to) {
                    return self.call_builtin(b.as_ref())
                }
                if self.call.to.is_reserved() {
                    return Err(ExecError::ReservedAddress(self.call.to.clone()))
                }
                if self.call.kind == CallKind::Deploy {
                    self.deploy()
                } else {
                    self.invoke()
                }
            }
        }
    }

    fn coinbase(&mut self) -> Result<Bytes, ExecError> {
        self.backend.add_balance(&self.call.to, &self.call.value)?;
        let env = self.env;
        for (addr, bios) in env.bios.iter() {
            debug!("bios hook {}", addr);
            bios.call(self.backend, &self.call)?;
        }
        Ok(Bytes::empty())
    }

    fn transfer(&mut self) -> Result<Bytes, ExecError> {
        self.limit.add_gas(self.env.config.transfer_gas)?;
        self.backend
            .transfer(&self.call.caller, &self.call.to, &self.call.value)?;
        Ok(Bytes::empty())
    }

    fn call_builtin(&mut self, b: &dyn Builtin) -> Result<Bytes, ExecError> {
        self.limit.add_gas(self.env.config.builtin_call_gas)?;
        self.backend
            .transfer(&self.call.caller, &self.call.to, &self.call.value)?;
        b.call(self.backend, &self.call)
    }

    fn check_payable(
        entry: Option<&ContractAbi>, method: &str, value: &Wei,
    ) -> Result<(), ExecError> {
        match entry {
            Some(e) if !e.payable && !value.is_zero() => {
                Err(ExecError::NotPayable(method.into()))
            }
            _ => Ok(()),
        }
    }

    fn deploy(&mut self) -> Result<Bytes, ExecError> {
        let payload = DeployPayload::decode(&self.call.payload)?;
        let to = self.call.to.clone();
        if !self.backend.get_code(&to)?.is_empty() {
            return Err(ExecError::ContractAddrCollision(to))
        }
        let ctor = abi::find_constructor(&payload.abi);
        Self::check_payable(ctor, INIT_METHOD, &self.call.value)?;
        abi::check_inputs(ctor, &payload.args)?;

        self.backend.set_code(&to, payload.binary.clone())?;
        self.backend.set_abi(&to, payload.abi.clone())?;
        self.backend.set_created_by(&to, self.call.caller.clone())?;
        self.backend
            .transfer(&self.call.caller, &to, &self.call.value)?;
        let args = &payload.args.0;
        self.run_module(&payload.binary, INIT_METHOD, args, &[], true)
    }

    fn invoke(&mut self) -> Result<Bytes, ExecError> {
        let payload = CallPayload::decode(&self.call.payload)?;
        if payload.method == INIT_METHOD {
            return Err(ExecError::ConstructorCall)
        }
        let to = self.call.to.clone();
        let code = self.backend.get_code(&to)?;
        if code.is_empty() {
            return Err(ExecError::NotContract(to))
        }
        let contract_abi = self.backend.get_abi(&to)?;
        let entry = abi::find_function(&contract_abi, &payload.method);
        Self::check_payable(entry, &payload.method, &self.call.value)?;
        abi::check_inputs(entry, &payload.args)?;
        let outputs = entry.map(|e| e.outputs.clone()).unwrap_or_default();

        self.backend
            .transfer(&self.call.caller, &to, &self.call.value)?;
        let args = &payload.args.0;
        self.run_module(&code, &payload.method, args, &outputs, false)
    }

    /// Instantiate `code`, marshal `args`, run `method` and read back the declared outputs. A
    /// missing export is skipped when `optional`.
    fn run_module(
        &mut self, code: &[u8], method: &str, args: &[AbiValue],
        outputs: &[AbiType], optional: bool,
    ) -> Result<Bytes, ExecError> {
        let mut instance = self.env.interpreter.instantiate(
            code,
            &HostTable,
            self.env.config.max_memory_pages,
        )?;
        self.limit.on_memory_grow(instance.memory_pages())?;
        if !instance.has_export(method) {
            if optional {
                return Ok(Bytes::empty())
            }
            return Err(ExecError::MethodNotFound(method.into()))
        }
        debug!(
            "{:?} {}::{} at depth {}",
            self.call.kind, self.call.to, method, self.depth
        );
        let mut frame = Frame::new(self);
        let argv = abi::marshal(instance.as_mut(), args, &mut frame)?;
        let rets = instance.invoke(method, &argv, &mut frame)?;
        let values = abi::demarshal(instance.as_ref(), &rets, outputs)?;
        Ok(AbiValue::encode_list(&values))
    }
}
