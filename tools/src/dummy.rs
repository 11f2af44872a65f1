//! A tiny stack machine implementing [Interpreter], so that contracts can be written directly in
//! tests. A module is the RLP encoding of [DummyModule]: functions over `u64` values, imports
//! bound to host functions by name, linear memory made of 64KiB pages, and globals.
//!
//! [ModuleBuilder] assembles modules and can add a bump allocator as the `__malloc` export, which
//! the host needs to pass blobs into the module.

use std::ops::Range;
use std::sync::Arc;

use log::trace;
use num_traits::FromPrimitive;
use rlp_derive::{RlpDecodable, RlpEncodable};

use ledger_vm::common::Bytes;
use ledger_vm::core::params::{MALLOC_EXPORT, WASM_PAGE_SIZE};
use ledger_vm::core::{Env, ExecError, HostId, HostTable, Instance, Interpreter};

#[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Nop = 0x00,
    Unreachable = 0x01,
    /// push `arg`
    Const = 0x02,
    Drop = 0x03,
    Dup = 0x04,
    LocalGet = 0x10,
    LocalSet = 0x11,
    GlobalGet = 0x12,
    GlobalSet = 0x13,
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    DivU = 0x23,
    Eq = 0x24,
    Eqz = 0x25,
    LtU = 0x26,
    /// `[addr] -> [u64]`, little-endian
    Load = 0x30,
    /// `[addr, value] -> []`
    Store = 0x31,
    Load32 = 0x32,
    Store32 = 0x33,
    MemorySize = 0x34,
    /// `[delta] -> [old pages]`
    MemoryGrow = 0x35,
    /// jump to instruction `arg` of the current function
    Jump = 0x40,
    JumpIf = 0x41,
    /// call function `arg`
    Call = 0x42,
    /// call import `arg`
    CallHost = 0x43,
    Return = 0x44,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub op: u8,
    pub arg: u64,
}

impl Inst {
    pub fn of(op: Op) -> Self {
        Self::arg(op, 0)
    }

    pub fn arg(op: Op, arg: u64) -> Self {
        Self { op: op as u8, arg }
    }
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub params: u64,
    pub results: u64,
}

/// A function. It is exported under `name` unless the name is empty.
#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct Func {
    pub name: String,
    pub params: u64,
    pub locals: u64,
    pub results: u64,
    pub body: Vec<Inst>,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub data: Bytes,
}

#[derive(RlpEncodable, RlpDecodable, Clone, Debug, PartialEq, Eq)]
pub struct DummyModule {
    pub imports: Vec<Import>,
    pub funcs: Vec<Func>,
    pub pages: u32,
    pub globals: Vec<u64>,
    pub data: Vec<Segment>,
}

/// Locals (parameters included) of one function.
const MAX_LOCALS: u64 = 1 << 16;

fn invalid(msg: String) -> ExecError {
    ExecError::InvalidModule(msg)
}

fn trap(msg: &str) -> ExecError {
    ExecError::Trap(msg.into())
}

impl DummyModule {
    pub fn decode(code: &[u8]) -> Result<Self, ExecError> {
        rlp::decode(code).map_err(|e| invalid(e.to_string()))
    }

    pub fn encode(&self) -> Bytes {
        rlp::encode(self).to_vec().into()
    }

    /// Structural checks done once at instantiation so that execution only has to deal with
    /// dynamic faults.
    fn validate(&self, max_pages: u32) -> Result<(), ExecError> {
        if self.pages > max_pages {
            return Err(ExecError::MemoryLimit)
        }
        let mem_size = self.pages as u64 * WASM_PAGE_SIZE;
        for seg in &self.data {
            let end = seg.offset.checked_add(seg.data.len() as u64);
            if end.map_or(true, |end| end > mem_size) {
                return Err(invalid("data segment out of memory".into()))
            }
        }
        for imp in &self.imports {
            if imp.results > 1 {
                return Err(invalid(format!("import {} has results", imp.name)))
            }
        }
        for f in &self.funcs {
            let nlocals = f
                .params
                .checked_add(f.locals)
                .filter(|n| *n <= MAX_LOCALS)
                .ok_or_else(|| {
                    invalid(format!("too many locals in {}", f.name))
                })?;
            for inst in &f.body {
                let op = Op::from_u8(inst.op).ok_or_else(|| {
                    invalid(format!("unknown op 0x{:02x}", inst.op))
                })?;
                let ok = match op {
                    Op::LocalGet | Op::LocalSet => inst.arg < nlocals,
                    Op::GlobalGet | Op::GlobalSet => {
                        inst.arg < self.globals.len() as u64
                    }
                    Op::Jump | Op::JumpIf => inst.arg <= f.body.len() as u64,
                    Op::Call => inst.arg < self.funcs.len() as u64,
                    Op::CallHost => inst.arg < self.imports.len() as u64,
                    _ => true,
                };
                if !ok {
                    return Err(invalid(format!(
                        "bad operand {} of {:?} in {}",
                        inst.arg, op, f.name
                    )))
                }
            }
        }
        Ok(())
    }
}

/// The [Interpreter] for [DummyModule] code.
pub struct DummyVm;

impl Interpreter for DummyVm {
    fn instantiate(
        &self, code: &[u8], hosts: &HostTable, max_pages: u32,
    ) -> Result<Box<dyn Instance>, ExecError> {
        let module = DummyModule::decode(code)?;
        module.validate(max_pages)?;
        let hosts = module
            .imports
            .iter()
            .map(|imp| {
                hosts.resolve(&imp.name).ok_or_else(|| {
                    invalid(format!("unknown import {}", imp.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let size = module.pages as u64 * WASM_PAGE_SIZE;
        let mut memory = vec![0; size as usize];
        for seg in &module.data {
            let start = seg.offset as usize;
            memory[start..start + seg.data.len()].copy_from_slice(&seg.data);
        }
        Ok(Box::new(DummyInstance {
            globals: module.globals.clone(),
            module: Arc::new(module),
            hosts,
            memory,
        }))
    }
}

pub struct DummyInstance {
    module: Arc<DummyModule>,
    hosts: Vec<HostId>,
    memory: Vec<u8>,
    globals: Vec<u64>,
}

#[inline]
fn pop(stack: &mut Vec<u64>) -> Result<u64, ExecError> {
    stack.pop().ok_or_else(|| trap("stack underflow"))
}

impl DummyInstance {
    fn range(&self, addr: u64, len: u64) -> Result<Range<usize>, ExecError> {
        let end = addr.checked_add(len).ok_or(ExecError::MemoryAccess)?;
        if end > self.memory.len() as u64 {
            return Err(ExecError::MemoryAccess)
        }
        Ok(addr as usize..end as usize)
    }

    fn run(
        &mut self, module: &DummyModule, idx: usize, args: &[u64],
        env: &mut dyn Env,
    ) -> Result<Vec<u64>, ExecError> {
        let f = &module.funcs[idx];
        if args.len() as u64 != f.params {
            return Err(trap("argument count mismatch"))
        }
        env.on_frame_enter()?;
        let ret = self.exec(module, f, args, env);
        env.on_frame_exit();
        ret
    }

    fn exec(
        &mut self, module: &DummyModule, f: &Func, args: &[u64],
        env: &mut dyn Env,
    ) -> Result<Vec<u64>, ExecError> {
        let mut locals = args.to_vec();
        locals.resize((f.params + f.locals) as usize, 0);
        let mut stack: Vec<u64> = Vec::new();
        let mut pc = 0;
        while let Some(inst) = f.body.get(pc) {
            env.on_instruction()?;
            pc += 1;
            let op = Op::from_u8(inst.op).ok_or_else(|| trap("bad op"))?;
            match op {
                Op::Nop => {}
                Op::Unreachable => return Err(trap("unreachable")),
                Op::Const => stack.push(inst.arg),
                Op::Drop => {
                    pop(&mut stack)?;
                }
                Op::Dup => {
                    let v = pop(&mut stack)?;
                    stack.extend([v, v]);
                }
                Op::LocalGet => stack.push(locals[inst.arg as usize]),
                Op::LocalSet => locals[inst.arg as usize] = pop(&mut stack)?,
                Op::GlobalGet => stack.push(self.globals[inst.arg as usize]),
                Op::GlobalSet => {
                    self.globals[inst.arg as usize] = pop(&mut stack)?
                }
                Op::Add | Op::Sub | Op::Mul | Op::DivU | Op::Eq | Op::LtU => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(match op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Mul => a.wrapping_mul(b),
                        Op::DivU => a
                            .checked_div(b)
                            .ok_or_else(|| trap("integer divide by zero"))?,
                        Op::Eq => (a == b) as u64,
                        _ => (a < b) as u64,
                    })
                }
                Op::Eqz => {
                    let a = pop(&mut stack)?;
                    stack.push((a == 0) as u64)
                }
                Op::Load | Op::Load32 => {
                    let width = if op == Op::Load { 8 } else { 4 };
                    let r = self.range(pop(&mut stack)?, width)?;
                    let mut buff = [0u8; 8];
                    buff[..width as usize].copy_from_slice(&self.memory[r]);
                    stack.push(u64::from_le_bytes(buff))
                }
                Op::Store | Op::Store32 => {
                    let width = if op == Op::Store { 8 } else { 4 };
                    let v = pop(&mut stack)?;
                    let r = self.range(pop(&mut stack)?, width)?;
                    self.memory[r]
                        .copy_from_slice(&v.to_le_bytes()[..width as usize]);
                }
                Op::MemorySize => stack.push(self.memory_pages() as u64),
                Op::MemoryGrow => {
                    let old = self.memory_pages();
                    let delta = u32::try_from(pop(&mut stack)?)
                        .map_err(|_| ExecError::MemoryLimit)?;
                    let pages =
                        old.checked_add(delta).ok_or(ExecError::MemoryLimit)?;
                    env.on_memory_grow(pages)?;
                    self.memory
                        .resize((pages as u64 * WASM_PAGE_SIZE) as usize, 0);
                    stack.push(old as u64)
                }
                Op::Jump => pc = inst.arg as usize,
                Op::JumpIf => {
                    if pop(&mut stack)? != 0 {
                        pc = inst.arg as usize
                    }
                }
                Op::Call => {
                    let callee = &module.funcs[inst.arg as usize];
                    let n = callee.params as usize;
                    if stack.len() < n {
                        return Err(trap("stack underflow"))
                    }
                    let argv = stack.split_off(stack.len() - n);
                    let rets = self.run(module, inst.arg as usize, &argv, env)?;
                    stack.extend(rets);
                }
                Op::CallHost => {
                    let imp = &module.imports[inst.arg as usize];
                    let n = imp.params as usize;
                    if stack.len() < n {
                        return Err(trap("stack underflow"))
                    }
                    let argv = stack.split_off(stack.len() - n);
                    trace!("host call {}{:?}", imp.name, argv);
                    let id = self.hosts[inst.arg as usize];
                    let ret = env.host_call(id, &argv, self)?;
                    if imp.results == 1 {
                        stack.push(ret)
                    }
                }
                Op::Return => break,
            }
        }
        let n = f.results as usize;
        if stack.len() < n {
            return Err(trap("missing return value"))
        }
        Ok(stack.split_off(stack.len() - n))
    }
}

impl Instance for DummyInstance {
    fn has_export(&self, name: &str) -> bool {
        self.module.funcs.iter().any(|f| !f.name.is_empty() && f.name == name)
    }

    fn invoke(
        &mut self, export: &str, args: &[u64], env: &mut dyn Env,
    ) -> Result<Vec<u64>, ExecError> {
        let module = self.module.clone();
        let idx = module
            .funcs
            .iter()
            .position(|f| !f.name.is_empty() && f.name == export)
            .ok_or_else(|| ExecError::MethodNotFound(export.into()))?;
        self.run(&module, idx, args, env)
    }

    fn load(&self, offset: u64, len: u64) -> Result<Vec<u8>, ExecError> {
        Ok(self.memory[self.range(offset, len)?].to_vec())
    }

    fn store(&mut self, offset: u64, data: &[u8]) -> Result<(), ExecError> {
        let r = self.range(offset, data.len() as u64)?;
        self.memory[r].copy_from_slice(data);
        Ok(())
    }

    fn memory_pages(&self) -> u32 {
        (self.memory.len() as u64 / WASM_PAGE_SIZE) as u32
    }
}

/// Assembles a [DummyModule].
pub struct ModuleBuilder {
    module: DummyModule,
    data_end: u64,
    heap_global: Option<usize>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            module: DummyModule {
                imports: Vec::new(),
                funcs: Vec::new(),
                pages: 1,
                globals: Vec::new(),
                data: Vec::new(),
            },
            // keep 0 free: a null pointer means "absent"
            data_end: 8,
            heap_global: None,
        }
    }

    pub fn pages(mut self, pages: u32) -> Self {
        self.module.pages = pages;
        self
    }

    /// Add a bump allocator exported as `__malloc`. The heap starts after the data segments and
    /// grows memory when it runs out.
    pub fn with_allocator(mut self) -> Self {
        use Op::*;
        let heap = self.global(0);
        let g = heap as u64;
        let grow_loop = 6;
        let done = 17;
        self.func(MALLOC_EXPORT, 1, 1, 1, vec![
            Inst::arg(GlobalGet, g),
            Inst::arg(LocalSet, 1),
            Inst::arg(GlobalGet, g),
            Inst::arg(LocalGet, 0),
            Inst::of(Add),
            Inst::arg(GlobalSet, g),
            // while pages * PAGE < heap: grow by one page
            Inst::of(MemorySize),
            Inst::arg(Const, WASM_PAGE_SIZE),
            Inst::of(Mul),
            Inst::arg(GlobalGet, g),
            Inst::of(LtU),
            Inst::of(Eqz),
            Inst::arg(JumpIf, done),
            Inst::arg(Const, 1),
            Inst::of(MemoryGrow),
            Inst::of(Drop),
            Inst::arg(Jump, grow_loop),
            Inst::arg(LocalGet, 1),
        ]);
        self.heap_global = Some(heap);
        self
    }

    /// Declare a host import; returns its index for `CallHost`.
    pub fn import(&mut self, name: &str, params: u64, results: u64) -> u64 {
        self.module.imports.push(Import {
            name: name.into(),
            params,
            results,
        });
        self.module.imports.len() as u64 - 1
    }

    pub fn global(&mut self, init: u64) -> usize {
        self.module.globals.push(init);
        self.module.globals.len() - 1
    }

    /// Place `data` as a blob (4-byte length, then the bytes) in the data section; returns the
    /// blob pointer.
    pub fn blob(&mut self, data: &[u8]) -> u64 {
        let ptr = self.data_end;
        let mut raw = (data.len() as u32).to_le_bytes().to_vec();
        raw.extend_from_slice(data);
        self.data_end = (ptr + raw.len() as u64 + 7) & !7;
        self.module.data.push(Segment {
            offset: ptr,
            data: raw.into(),
        });
        ptr
    }

    /// Add a function; returns its index for `Call`.
    pub fn func(
        &mut self, name: &str, params: u64, locals: u64, results: u64,
        body: Vec<Inst>,
    ) -> u64 {
        self.module.funcs.push(Func {
            name: name.into(),
            params,
            locals,
            results,
            body,
        });
        self.module.funcs.len() as u64 - 1
    }

    pub fn build(mut self) -> Bytes {
        if let Some(g) = self.heap_global {
            self.module.globals[g] = self.data_end;
        }
        self.module.encode()
    }
}
