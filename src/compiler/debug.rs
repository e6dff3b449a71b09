//! Debug utilities for inspecting IR, allocation and encoded records

use super::encoder::{AddressResolver, EncodedItem};
use super::ir::{IrInstruction, LoweredUnit, SpillOp};
use crate::error::InternalError;
use std::fmt::Write as _;

/// Render a unit's IR in human-readable form, one instruction per line with
/// spill traffic above the instruction it belongs to
pub fn format_ir(unit: &LoweredUnit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "═══ {} ({:?}, {} bytes of locals) ═══", unit.name, unit.kind, unit.locals);
    for (i, instr) in unit.code.iter().enumerate() {
        let _ = writeln!(out, "{:04}: {}", i, format_ir_instr(instr));
    }
    out
}

/// Print a unit's IR to stdout
pub fn dump_ir(unit: &LoweredUnit) {
    println!("{}", format_ir(unit));
}

/// Format a single IR instruction, allocator annotations included
pub fn format_ir_instr(instr: &IrInstruction) -> String {
    let mut text = instr.op_text();
    for pre in &instr.pre {
        let note = match pre {
            SpillOp::Spill { physical, slot } => format!(" [spill r{} -> {}]", physical, slot),
            SpillOp::Load { physical, slot } => format!(" [load r{} <- {}]", physical, slot),
        };
        text.push_str(&note);
    }
    if !instr.closing.is_empty() {
        let dead: Vec<String> = instr.closing.iter().map(|r| format!("%{}", r)).collect();
        let _ = write!(text, " ; dies {}", dead.join(" "));
    }
    text
}

/// Serialize a unit, allocator bookkeeping included, as pretty JSON
pub fn dump_ir_json(unit: &LoweredUnit) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(unit)
}

/// Hex listing of packed records: byte address, packed bytes, disassembly
pub fn hex_listing(
    items: &[EncodedItem],
    resolver: &dyn AddressResolver,
    base: u32,
) -> Result<String, InternalError> {
    let mut out = String::new();
    let mut address = base;
    for item in items {
        match item {
            EncodedItem::Label(target) => {
                let _ = writeln!(out, "{:>8}  {}:", "", target);
            }
            EncodedItem::Instruction(instr) => {
                let bytes = instr.pack(resolver)?;
                let _ = writeln!(out, "{:08x}  {:<24} {}", address, hex::encode(&bytes), instr);
                address += bytes.len() as u32;
            }
        }
    }
    Ok(out)
}

impl IrInstruction {
    /// The operation alone, without the spill lines `Display` prefixes
    fn op_text(&self) -> String {
        let bare = IrInstruction {
            op: self.op.clone(),
            pre: Vec::new(),
            closing: Default::default(),
            origin: None,
        };
        bare.to_string().trim_start().to_string()
    }
}
