//! Call payloads and the linear-memory calling convention.
//!
//! Integers cross the boundary as raw `u64`. Everything byte-like is a pointer to a blob in the
//! instance memory: a 4-byte little-endian length followed by the data. The host allocates blobs
//! through the module's `__malloc` export. A null pointer (0) stands for "absent".

use num_traits::FromPrimitive;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use super::params::MALLOC_EXPORT;
use super::{Env, ExecError, Instance};
use crate::common::{u256_to_bytes, Addr, Bytes, U256RLP, U256};

#[derive(
    FromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum AbiType {
    U64 = 0,
    Bool = 1,
    Bytes = 2,
    String = 3,
    U256 = 4,
    Address = 5,
}

#[derive(
    FromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum AbiKind {
    Function = 0,
    Constructor = 1,
    Event = 2,
}

macro_rules! impl_enum_rlp {
    ($name: ident) => {
        impl Encodable for $name {
            fn rlp_append(&self, s: &mut RlpStream) {
                (*self as u8).rlp_append(s);
            }
        }

        impl Decodable for $name {
            fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
                let t: u8 = rlp.as_val()?;
                $name::from_u8(t).ok_or(DecoderError::Custom(concat!(
                    "unknown ",
                    stringify!($name)
                )))
            }
        }
    };
}

impl_enum_rlp!(AbiType);
impl_enum_rlp!(AbiKind);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbiValue {
    U64(u64),
    Bool(bool),
    Bytes(Bytes),
    String(String),
    U256(U256),
    Address(Addr),
}

impl AbiValue {
    pub fn abi_type(&self) -> AbiType {
        match self {
            AbiValue::U64(_) => AbiType::U64,
            AbiValue::Bool(_) => AbiType::Bool,
            AbiValue::Bytes(_) => AbiType::Bytes,
            AbiValue::String(_) => AbiType::String,
            AbiValue::U256(_) => AbiType::U256,
            AbiValue::Address(_) => AbiType::Address,
        }
    }

    pub fn as_address(&self) -> Option<&Addr> {
        match self {
            AbiValue::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_u256(&self) -> Option<U256> {
        match self {
            AbiValue::U256(u) => Some(*u),
            AbiValue::U64(u) => Some((*u).into()),
            _ => None,
        }
    }

    /// Return data of a call: the RLP list of its values.
    pub fn encode_list(values: &[AbiValue]) -> Bytes {
        if values.is_empty() {
            return Bytes::empty()
        }
        rlp::encode_list::<AbiValue, _>(values).to_vec().into()
    }

    pub fn decode_list(raw: &[u8]) -> Result<Vec<AbiValue>, ExecError> {
        if raw.is_empty() {
            return Ok(Vec::new())
        }
        Ok(Rlp::new(raw).as_list()?)
    }
}

impl Encodable for AbiValue {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.abi_type());
        match self {
            AbiValue::U64(v) => s.append(v),
            AbiValue::Bool(v) => s.append(v),
            AbiValue::Bytes(v) => s.append(v),
            AbiValue::String(v) => s.append(v),
            AbiValue::U256(v) => s.append(&U256RLP(*v)),
            AbiValue::Address(v) => s.append(v),
        };
    }
}

impl Decodable for AbiValue {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(match rlp.val_at::<AbiType>(0)? {
            AbiType::U64 => AbiValue::U64(rlp.val_at(1)?),
            AbiType::Bool => AbiValue::Bool(rlp.val_at(1)?),
            AbiType::Bytes => AbiValue::Bytes(rlp.val_at(1)?),
            AbiType::String => AbiValue::String(rlp.val_at(1)?),
            AbiType::U256 => AbiValue::U256(rlp.val_at::<U256RLP>(1)?.0),
            AbiType::Address => AbiValue::Address(rlp.val_at(1)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Parameters(pub Vec<AbiValue>);

impl Parameters {
    pub fn new(values: Vec<AbiValue>) -> Self {
        Self(values)
    }

    pub fn types(&self) -> Vec<AbiType> {
        self.0.iter().map(|v| v.abi_type()).collect()
    }
}

impl Encodable for Parameters {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append_list::<AbiValue, _>(&self.0);
    }
}

impl Decodable for Parameters {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self(rlp.as_list()?))
    }
}

/// One entry of a contract's declared interface.
#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct ContractAbi {
    pub name: String,
    pub kind: AbiKind,
    pub inputs: Vec<AbiType>,
    pub outputs: Vec<AbiType>,
    pub payable: bool,
}

impl ContractAbi {
    pub fn function(
        name: &str, inputs: Vec<AbiType>, outputs: Vec<AbiType>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AbiKind::Function,
            inputs,
            outputs,
            payable: false,
        }
    }

    pub fn constructor(inputs: Vec<AbiType>) -> Self {
        Self {
            name: super::params::INIT_METHOD.into(),
            kind: AbiKind::Constructor,
            inputs,
            outputs: Vec::new(),
            payable: false,
        }
    }

    pub fn payable(mut self) -> Self {
        self.payable = true;
        self
    }
}

pub fn find_function<'a>(
    abi: &'a [ContractAbi], name: &str,
) -> Option<&'a ContractAbi> {
    abi.iter()
        .find(|e| e.kind == AbiKind::Function && e.name == name)
}

pub fn find_constructor(abi: &[ContractAbi]) -> Option<&ContractAbi> {
    abi.iter().find(|e| e.kind == AbiKind::Constructor)
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct DeployPayload {
    pub binary: Bytes,
    pub args: Parameters,
    pub abi: Vec<ContractAbi>,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct CallPayload {
    pub method: String,
    pub args: Parameters,
}

impl DeployPayload {
    pub fn encode(&self) -> Bytes {
        rlp::encode(self).to_vec().into()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ExecError> {
        Ok(rlp::decode(raw)?)
    }
}

impl CallPayload {
    pub fn new(method: &str, args: Vec<AbiValue>) -> Self {
        Self {
            method: method.into(),
            args: Parameters(args),
        }
    }

    pub fn encode(&self) -> Bytes {
        rlp::encode(self).to_vec().into()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ExecError> {
        Ok(rlp::decode(raw)?)
    }
}

pub fn read_blob(inst: &dyn Instance, ptr: u64) -> Result<Vec<u8>, ExecError> {
    let header = inst.load(ptr, 4)?;
    let len: [u8; 4] = header[..]
        .try_into()
        .map_err(|_| ExecError::MemoryAccess)?;
    let start = ptr.checked_add(4).ok_or(ExecError::MemoryAccess)?;
    inst.load(start, u32::from_le_bytes(len) as u64)
}

pub fn read_string(inst: &dyn Instance, ptr: u64) -> Result<String, ExecError> {
    String::from_utf8(read_blob(inst, ptr)?)
        .map_err(|e| ExecError::MalformedPayload(e.to_string()))
}

pub fn read_addr(inst: &dyn Instance, ptr: u64) -> Result<Addr, ExecError> {
    let raw = read_blob(inst, ptr)?;
    Addr::try_from_slice(&raw).ok_or_else(|| {
        ExecError::MalformedPayload(format!("address of {} bytes", raw.len()))
    })
}

pub fn read_u256(inst: &dyn Instance, ptr: u64) -> Result<U256, ExecError> {
    let raw = read_blob(inst, ptr)?;
    if raw.len() > 32 {
        return Err(ExecError::MalformedPayload(format!(
            "u256 of {} bytes",
            raw.len()
        )))
    }
    Ok(U256::from_big_endian(&raw))
}

/// Copy `data` into a fresh blob allocated by the instance's own allocator.
pub fn write_blob(
    inst: &mut dyn Instance, data: &[u8], env: &mut dyn Env,
) -> Result<u64, ExecError> {
    if !inst.has_export(MALLOC_EXPORT) {
        return Err(ExecError::MethodNotFound(MALLOC_EXPORT.into()))
    }
    let len = u32::try_from(data.len()).map_err(|_| ExecError::MemoryAccess)?;
    let ptr = *inst
        .invoke(MALLOC_EXPORT, &[4 + len as u64], env)?
        .first()
        .ok_or(ExecError::AbiMismatch)?;
    inst.store(ptr, &len.to_le_bytes())?;
    inst.store(ptr + 4, data)?;
    Ok(ptr)
}

/// Turn typed arguments into the numeric arguments of an export.
pub fn marshal(
    inst: &mut dyn Instance, values: &[AbiValue], env: &mut dyn Env,
) -> Result<Vec<u64>, ExecError> {
    values
        .iter()
        .map(|v| match v {
            AbiValue::U64(x) => Ok(*x),
            AbiValue::Bool(b) => Ok(*b as u64),
            AbiValue::Bytes(b) => write_blob(inst, b, env),
            AbiValue::String(s) => write_blob(inst, s.as_bytes(), env),
            AbiValue::U256(u) => write_blob(inst, &u256_to_bytes(u), env),
            AbiValue::Address(a) => write_blob(inst, a.as_bytes(), env),
        })
        .collect()
}

/// Read back the declared return values of an export. Without a declaration the raw results are
/// dropped.
pub fn demarshal(
    inst: &dyn Instance, rets: &[u64], types: &[AbiType],
) -> Result<Vec<AbiValue>, ExecError> {
    if types.is_empty() {
        return Ok(Vec::new())
    }
    if rets.len() != types.len() {
        return Err(ExecError::AbiMismatch)
    }
    rets.iter()
        .zip(types)
        .map(|(r, t)| {
            Ok(match t {
                AbiType::U64 => AbiValue::U64(*r),
                AbiType::Bool => AbiValue::Bool(*r != 0),
                AbiType::Bytes => AbiValue::Bytes(read_blob(inst, *r)?.into()),
                AbiType::String => AbiValue::String(read_string(inst, *r)?),
                AbiType::U256 => AbiValue::U256(read_u256(inst, *r)?),
                AbiType::Address => AbiValue::Address(read_addr(inst, *r)?),
            })
        })
        .collect()
}

/// Arguments must match the declared inputs when there is a declaration.
pub fn check_inputs(
    entry: Option<&ContractAbi>, args: &Parameters,
) -> Result<(), ExecError> {
    match entry {
        Some(e) if e.inputs != args.types() => Err(ExecError::AbiMismatch),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HostId;

    /// Flat memory with a native bump allocator standing in for the module's `__malloc`.
    struct FlatMemory {
        mem: Vec<u8>,
        heap: u64,
    }

    impl Instance for FlatMemory {
        fn has_export(&self, name: &str) -> bool {
            name == MALLOC_EXPORT
        }
        fn invoke(
            &mut self, _export: &str, args: &[u64], env: &mut dyn Env,
        ) -> Result<Vec<u64>, ExecError> {
            env.on_instruction()?;
            let ptr = self.heap;
            self.heap += args[0];
            Ok(vec![ptr])
        }
        fn load(&self, offset: u64, len: u64) -> Result<Vec<u8>, ExecError> {
            let end = (offset + len) as usize;
            if end > self.mem.len() {
                return Err(ExecError::MemoryAccess)
            }
            Ok(self.mem[offset as usize..end].to_vec())
        }
        fn store(&mut self, offset: u64, data: &[u8]) -> Result<(), ExecError> {
            let end = offset as usize + data.len();
            if end > self.mem.len() {
                return Err(ExecError::MemoryAccess)
            }
            self.mem[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        fn memory_pages(&self) -> u32 {
            1
        }
    }

    struct CountingEnv(u64);

    impl Env for CountingEnv {
        fn on_instruction(&mut self) -> Result<(), ExecError> {
            self.0 += 1;
            Ok(())
        }
        fn on_memory_grow(&mut self, _pages: u32) -> Result<(), ExecError> {
            Ok(())
        }
        fn on_frame_enter(&mut self) -> Result<(), ExecError> {
            Ok(())
        }
        fn on_frame_exit(&mut self) {}
        fn host_call(
            &mut self, _id: HostId, _args: &[u64], _inst: &mut dyn Instance,
        ) -> Result<u64, ExecError> {
            Err(ExecError::InvalidHostCall)
        }
    }

    #[test]
    fn test_marshal_through_memory() {
        let mut inst = FlatMemory {
            mem: vec![0; 1024],
            heap: 8,
        };
        let mut env = CountingEnv(0);
        let values = vec![
            AbiValue::U64(7),
            AbiValue::Bool(true),
            AbiValue::String("hello".into()),
            AbiValue::U256(U256::from(1) << 200),
            AbiValue::Address(Addr::from(0xbeef)),
        ];
        let args = marshal(&mut inst, &values, &mut env).unwrap();
        assert_eq!(args[0], 7);
        assert_eq!(args[1], 1);
        // one allocation per pointer-typed value
        assert_eq!(env.0, 3);
        let types: Vec<_> = values.iter().map(|v| v.abi_type()).collect();
        assert_eq!(demarshal(&inst, &args, &types).unwrap(), values);
        assert!(demarshal(&inst, &args, &[]).unwrap().is_empty());
        assert_eq!(
            demarshal(&inst, &args[..2], &types),
            Err(ExecError::AbiMismatch)
        );
        assert_eq!(read_blob(&inst, 1022), Err(ExecError::MemoryAccess));
    }

    #[test]
    fn test_payload_codec() {
        let call = CallPayload::new(
            "transfer",
            vec![
                AbiValue::Address(Addr::from(3)),
                AbiValue::U256(U256::MAX),
                AbiValue::Bytes(Bytes::empty()),
            ],
        );
        assert_eq!(CallPayload::decode(&call.encode()).unwrap(), call);

        let deploy = DeployPayload {
            binary: vec![0, 1, 2].into(),
            args: Parameters::new(vec![AbiValue::U64(0)]),
            abi: vec![
                ContractAbi::constructor(vec![AbiType::U64]).payable(),
                ContractAbi::function("get", vec![], vec![AbiType::Bytes]),
            ],
        };
        let decoded = DeployPayload::decode(&deploy.encode()).unwrap();
        assert_eq!(decoded, deploy);
        assert!(find_constructor(&decoded.abi).unwrap().payable);
        assert!(find_function(&decoded.abi, "init").is_none());
        assert!(matches!(
            CallPayload::decode(&[0xc1, 0x80]),
            Err(ExecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_abi_list_codec() {
        let f = ContractAbi::function("f", vec![], vec![]);
        // [[ "f", kind 0, [], [], false ]]
        assert_eq!(
            rlp::encode_list::<ContractAbi, _>(&[f.clone()]).to_vec(),
            vec![0xc6, 0xc5, 0x66, 0x80, 0xc0, 0xc0, 0x80]
        );
        let abi = vec![
            f,
            ContractAbi::constructor(vec![AbiType::Address, AbiType::U256]),
            ContractAbi::function("g", vec![AbiType::Bool], vec![
                AbiType::String,
            ])
            .payable(),
        ];
        let raw = rlp::encode_list::<ContractAbi, _>(&abi);
        assert_eq!(Rlp::new(&raw).as_list::<ContractAbi>().unwrap(), abi);

        let values = vec![
            AbiValue::U64(u64::MAX),
            AbiValue::Bool(false),
            AbiValue::Bytes("x".into()),
            AbiValue::String(String::new()),
            AbiValue::U256(U256::from(5)),
            AbiValue::Address(Addr::from(9)),
        ];
        let raw = AbiValue::encode_list(&values);
        assert_eq!(AbiValue::decode_list(&raw).unwrap(), values);
        assert_eq!(
            rlp::encode(&AbiValue::U64(1)).to_vec(),
            vec![0xc2, 0x80, 0x01]
        );
    }

    #[test]
    fn test_check_inputs() {
        let f = ContractAbi::function("f", vec![AbiType::U64], vec![]);
        let ok = Parameters::new(vec![AbiValue::U64(1)]);
        let bad = Parameters::new(vec![AbiValue::Bool(true)]);
        assert!(check_inputs(Some(&f), &ok).is_ok());
        assert_eq!(check_inputs(Some(&f), &bad), Err(ExecError::AbiMismatch));
        assert!(check_inputs(None, &bad).is_ok());
    }
}
