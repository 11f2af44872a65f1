#[macro_use] extern crate num_derive;

pub mod dummy;
pub mod merkle;

use dummy::{DummyModule, Op};
use num_traits::FromPrimitive;

pub fn op_to_str(op: u8) -> Option<&'static str> {
    let op: Option<Op> = FromPrimitive::from_u8(op);
    use Op::*;
    op.map(|op| match op {
        Nop => "nop",
        Unreachable => "unreachable",
        Const => "const",
        Drop => "drop",
        Dup => "dup",
        LocalGet => "local.get",
        LocalSet => "local.set",
        GlobalGet => "global.get",
        GlobalSet => "global.set",
        Add => "add",
        Sub => "sub",
        Mul => "mul",
        DivU => "div_u",
        Eq => "eq",
        Eqz => "eqz",
        LtU => "lt_u",
        Load => "load",
        Store => "store",
        Load32 => "load32",
        Store32 => "store32",
        MemorySize => "memory.size",
        MemoryGrow => "memory.grow",
        Jump => "jump",
        JumpIf => "jump_if",
        Call => "call",
        CallHost => "call_host",
        Return => "return",
    })
}

fn has_operand(op: u8) -> bool {
    use Op::*;
    matches!(
        Op::from_u8(op),
        Some(
            Const | LocalGet | LocalSet | GlobalGet | GlobalSet | Jump |
                JumpIf | Call | CallHost
        )
    )
}

/// Render a dummy module as text, one instruction per line. Returns `None` if `code` does not
/// decode.
pub fn disasm(code: &[u8]) -> Option<String> {
    let module = DummyModule::decode(code).ok()?;
    let mut asm = Vec::new();
    asm.push(format!("(memory {})", module.pages));
    for (i, imp) in module.imports.iter().enumerate() {
        asm.push(format!(
            "(import {} {} (params {}) (results {}))",
            i, imp.name, imp.params, imp.results
        ));
    }
    for (i, g) in module.globals.iter().enumerate() {
        asm.push(format!("(global {} {})", i, g));
    }
    for seg in &module.data {
        asm.push(format!(
            "(data 0x{:x} 0x{})",
            seg.offset,
            hex::encode(&seg.data[..])
        ));
    }
    for (i, f) in module.funcs.iter().enumerate() {
        asm.push(format!(
            "(func {} \"{}\" (params {}) (locals {}) (results {})",
            i, f.name, f.params, f.locals, f.results
        ));
        for (pc, inst) in f.body.iter().enumerate() {
            let line = match op_to_str(inst.op) {
                Some(s) if has_operand(inst.op) => {
                    format!("{} {}", s, inst.arg)
                }
                Some(s) => s.to_string(),
                None => format!("0x{:02x}?", inst.op),
            };
            asm.push(format!("  {:04} {}", pc, line));
        }
        asm.push(")".into());
    }
    Some(asm.join("\n"))
}

#[test]
fn test_disasm() {
    use dummy::{Inst, ModuleBuilder};
    let mut m = ModuleBuilder::new();
    let log = m.import("_log", 1, 0);
    let msg = m.blob(b"hi");
    m.func("hello", 0, 0, 0, vec![
        Inst::arg(Op::Const, msg),
        Inst::arg(Op::CallHost, log),
    ]);
    let asm = disasm(&m.build()).unwrap();
    assert!(asm.contains("(import 0 _log (params 1) (results 0))"));
    assert!(asm.contains("0000 const 8"));
    assert!(asm.contains("0001 call_host 0"));
    assert!(disasm(b"\x01\x02").is_none());
}
