//! # Instruction Encoder
//!
//! Maps allocated IR to hardware instruction records and packs records into
//! 16-bit little-endian words.
//!
//! ## Key Technical Details
//! - Opcodes live in five groups: binary arithmetic, unary arithmetic,
//!   machine manipulation, memory and io. An instruction word is
//!   `width_class << 14 | group << 8 | index`.
//! - Every operand is one word: bit 15 marks a register, bit 14 a
//!   dereference, the low 14 bits are the payload (two's complement when
//!   negative).
//! - A record takes `1 + operands` words. Data references and jump targets
//!   stay symbolic until an [`AddressResolver`] supplied by the assembler
//!   packs them.

use super::ir::{
    AllocatedRegister, BinaryOp, DataReference, DerefTarget, Dereference, FrameLayout,
    HardwareRegister, Immediate, IrInstruction, IrOp, JumpTargetId, Operand, SpillLocation,
    SpillOp, UnaryOp,
};
use super::desugar::fits_inline;
use crate::error::InternalError;
use crate::syntax::{Width, POINTER_WIDTH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// OPCODES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpcodeGroup {
    Binary = 0,
    Unary = 1,
    Manipulation = 2,
    Memory = 3,
    Io = 4,
}

impl OpcodeGroup {
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Every instruction the machine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // binary arithmetic
    Add,
    Sub,
    Mul,
    UDiv,
    IDiv,
    Shl,
    Shr,
    Sar,
    And,
    Or,
    Xor,
    IMod,
    UMod,
    // unary arithmetic
    BInv,
    LInv,
    Neg,
    Pos,
    // manipulation
    Mov,
    Sxu,
    Sxi,
    Jmp,
    Set,
    Tst,
    Halt,
    // memory
    Stks,
    Push,
    Pop,
    Call,
    Ret,
    // io
    Getc,
    Putc,
    Putint,
}

impl Opcode {
    pub const ALL: [Opcode; 32] = [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::UDiv,
        Opcode::IDiv,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Sar,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::IMod,
        Opcode::UMod,
        Opcode::BInv,
        Opcode::LInv,
        Opcode::Neg,
        Opcode::Pos,
        Opcode::Mov,
        Opcode::Sxu,
        Opcode::Sxi,
        Opcode::Jmp,
        Opcode::Set,
        Opcode::Tst,
        Opcode::Halt,
        Opcode::Stks,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Call,
        Opcode::Ret,
        Opcode::Getc,
        Opcode::Putc,
        Opcode::Putint,
    ];

    pub fn group(self) -> OpcodeGroup {
        use Opcode::*;
        match self {
            Add | Sub | Mul | UDiv | IDiv | Shl | Shr | Sar | And | Or | Xor | IMod | UMod => {
                OpcodeGroup::Binary
            }
            BInv | LInv | Neg | Pos => OpcodeGroup::Unary,
            Mov | Sxu | Sxi | Jmp | Set | Tst | Halt => OpcodeGroup::Manipulation,
            Stks | Push | Pop | Call | Ret => OpcodeGroup::Memory,
            Getc | Putc | Putint => OpcodeGroup::Io,
        }
    }

    /// Position within the group
    pub fn index(self) -> u8 {
        use Opcode::*;
        match self {
            Add => 0,
            Sub => 1,
            Mul => 2,
            UDiv => 3,
            IDiv => 4,
            Shl => 5,
            Shr => 6,
            Sar => 7,
            And => 8,
            Or => 9,
            Xor => 10,
            IMod => 11,
            UMod => 12,

            BInv => 0,
            LInv => 1,
            Neg => 2,
            Pos => 3,

            Mov => 0,
            Sxu => 1,
            Sxi => 2,
            Jmp => 3,
            Set => 4,
            Tst => 5,
            Halt => 6,

            Stks => 0,
            Push => 1,
            Pop => 2,
            Call => 3,
            Ret => 4,

            Getc => 0,
            Putc => 1,
            Putint => 2,
        }
    }

    /// Assembly name. `and` and `or` carry a trailing underscore.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            UDiv => "udiv",
            IDiv => "idiv",
            Shl => "shl",
            Shr => "shr",
            Sar => "sar",
            And => "and_",
            Or => "or_",
            Xor => "xor",
            IMod => "imod",
            UMod => "umod",
            BInv => "binv",
            LInv => "linv",
            Neg => "neg",
            Pos => "pos",
            Mov => "mov",
            Sxu => "sxu",
            Sxi => "sxi",
            Jmp => "jmp",
            Set => "set",
            Tst => "tst",
            Halt => "halt",
            Stks => "stks",
            Push => "push",
            Pop => "pop",
            Call => "call",
            Ret => "ret",
            Getc => "getc",
            Putc => "putc",
            Putint => "putint",
        }
    }

    /// Look an opcode up by assembly name across all groups
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        MNEMONICS.get(name).copied()
    }

    pub fn from_parts(group: u8, index: u8) -> Option<Opcode> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.group().id() == group && op.index() == index)
    }
}

lazy_static::lazy_static! {
    static ref MNEMONICS: HashMap<&'static str, Opcode> =
        Opcode::ALL.iter().map(|op| (op.mnemonic(), *op)).collect();
}

impl From<BinaryOp> for Opcode {
    fn from(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::UDiv => Opcode::UDiv,
            BinaryOp::IDiv => Opcode::IDiv,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            BinaryOp::Sar => Opcode::Sar,
            BinaryOp::And => Opcode::And,
            BinaryOp::Or => Opcode::Or,
            BinaryOp::Xor => Opcode::Xor,
            BinaryOp::IMod => Opcode::IMod,
            BinaryOp::UMod => Opcode::UMod,
        }
    }
}

impl From<UnaryOp> for Opcode {
    fn from(op: UnaryOp) -> Self {
        match op {
            UnaryOp::BitInvert => Opcode::BInv,
            UnaryOp::LogicalInvert => Opcode::LInv,
            UnaryOp::Negate => Opcode::Neg,
            UnaryOp::Positive => Opcode::Pos,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// =============================================================================
// HARDWARE RECORDS
// =============================================================================

/// Operand of a hardware instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwOperand {
    /// Register file index
    Register { index: u8, deref: bool },
    Immediate { value: i64, deref: bool },
    /// Address of a data entry, resolved at packing
    Data { reference: DataReference, deref: bool },
    /// Address of a label in the same unit, resolved at packing
    Target(JumpTargetId),
}

impl HwOperand {
    pub fn register(index: u8) -> Self {
        HwOperand::Register {
            index,
            deref: false,
        }
    }

    pub fn immediate(value: i64) -> Self {
        HwOperand::Immediate {
            value,
            deref: false,
        }
    }

    /// Lower an allocated IR operand. Virtual registers must carry a
    /// physical slot by now.
    pub fn from_operand(operand: &Operand) -> Result<Self, InternalError> {
        let operand = match operand {
            Operand::Register(reg) => HwOperand::Register {
                index: physical(reg.physical, operand)?,
                deref: false,
            },
            Operand::Allocated(reg) => HwOperand::register(reg.physical),
            Operand::Hardware(reg) => HwOperand::register(reg.index()),
            Operand::Immediate(imm) => HwOperand::immediate(imm.value),
            Operand::Data(reference) => HwOperand::Data {
                reference: reference.clone(),
                deref: false,
            },
            Operand::Dereference(Dereference { target, .. }) => match target {
                DerefTarget::Register(reg) => HwOperand::Register {
                    index: physical(reg.physical, operand)?,
                    deref: true,
                },
                DerefTarget::Allocated(reg) => HwOperand::Register {
                    index: reg.physical,
                    deref: true,
                },
                DerefTarget::Immediate(imm) => HwOperand::Immediate {
                    value: imm.value,
                    deref: true,
                },
                DerefTarget::Data(reference) => HwOperand::Data {
                    reference: reference.clone(),
                    deref: true,
                },
            },
        };
        Ok(operand)
    }
}

fn physical(slot: Option<u8>, operand: &Operand) -> Result<u8, InternalError> {
    slot.ok_or_else(|| InternalError::UnresolvedOperand(format!("unallocated register {}", operand)))
}

impl fmt::Display for HwOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, deref) = match self {
            HwOperand::Register { index, deref } => (format!("r{}", index), *deref),
            HwOperand::Immediate { value, deref } => (format!("#{}", value), *deref),
            HwOperand::Data { reference, deref } => (format!("${}", reference.name()), *deref),
            HwOperand::Target(target) => (target.to_string(), false),
        };
        if deref {
            write!(f, "[{}]", text)
        } else {
            f.write_str(&text)
        }
    }
}

/// One machine instruction before packing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInstruction {
    pub opcode: Opcode,
    pub width: Width,
    pub operands: Vec<HwOperand>,
}

impl HardwareInstruction {
    pub fn new(opcode: Opcode, width: Width, operands: Vec<HwOperand>) -> Self {
        Self {
            opcode,
            width,
            operands,
        }
    }

    /// Words the record occupies once packed
    pub fn word_count(&self) -> usize {
        1 + self.operands.len()
    }

    pub fn instruction_word(&self) -> InstructionWord {
        InstructionWord {
            width_class: self.width.class(),
            group: self.opcode.group().id(),
            index: self.opcode.index(),
        }
    }

    /// Pack into words, resolving symbolic operands through `resolver`
    pub fn pack_words(&self, resolver: &dyn AddressResolver) -> Result<Vec<u16>, InternalError> {
        let mut words = Vec::with_capacity(self.word_count());
        words.push(self.instruction_word().pack());
        for operand in &self.operands {
            let word = match operand {
                HwOperand::Register { index, deref } => OperandWord::register(*index, *deref),
                HwOperand::Immediate { value, deref } => OperandWord::immediate(*value, *deref)?,
                HwOperand::Data { reference, deref } => {
                    let address = resolver.resolve_data(reference).ok_or_else(|| {
                        InternalError::UnresolvedOperand(format!("data {}", reference.name()))
                    })?;
                    OperandWord::immediate(i64::from(address), *deref)?
                }
                HwOperand::Target(target) => {
                    let address = resolver.resolve_target(*target).ok_or_else(|| {
                        InternalError::UnresolvedOperand(format!("jump target {}", target))
                    })?;
                    OperandWord::immediate(i64::from(address), false)?
                }
            };
            words.push(word.pack());
        }
        Ok(words)
    }

    /// Pack into little-endian bytes
    pub fn pack(&self, resolver: &dyn AddressResolver) -> Result<Vec<u8>, InternalError> {
        Ok(self
            .pack_words(resolver)?
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect())
    }
}

impl fmt::Display for HardwareInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.opcode, self.width)?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{}", sep, operand)?;
        }
        Ok(())
    }
}

/// Encoder output: instructions interleaved with the labels jumps refer to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodedItem {
    Instruction(HardwareInstruction),
    Label(JumpTargetId),
}

impl EncodedItem {
    pub fn word_count(&self) -> usize {
        match self {
            EncodedItem::Instruction(instr) => instr.word_count(),
            EncodedItem::Label(_) => 0,
        }
    }
}

// =============================================================================
// WORD PACKING
// =============================================================================

/// First word of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionWord {
    /// 0 = 1 byte .. 3 = 8 bytes
    pub width_class: u8,
    pub group: u8,
    pub index: u8,
}

impl InstructionWord {
    pub fn pack(self) -> u16 {
        (u16::from(self.width_class & 0x3) << 14)
            | (u16::from(self.group & 0x3F) << 8)
            | u16::from(self.index)
    }

    pub fn unpack(word: u16) -> Self {
        Self {
            width_class: (word >> 14) as u8,
            group: ((word >> 8) & 0x3F) as u8,
            index: (word & 0xFF) as u8,
        }
    }

    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_parts(self.group, self.index)
    }
}

/// Operand word: register flag, dereference flag and a 14-bit payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperandWord {
    pub register: bool,
    pub dereference: bool,
    /// Raw payload bits
    pub payload: u16,
}

pub const PAYLOAD_BITS: u32 = 14;
const PAYLOAD_MASK: u16 = (1 << PAYLOAD_BITS) - 1;

impl OperandWord {
    pub fn register(index: u8, dereference: bool) -> Self {
        Self {
            register: true,
            dereference,
            payload: u16::from(index) & PAYLOAD_MASK,
        }
    }

    /// Immediate payload, stored as 14-bit two's complement when negative
    pub fn immediate(value: i64, dereference: bool) -> Result<Self, InternalError> {
        if !(-(1 << (PAYLOAD_BITS - 1))..(1 << PAYLOAD_BITS)).contains(&value) {
            return Err(InternalError::ImmediateOutOfRange { value });
        }
        Ok(Self {
            register: false,
            dereference,
            payload: (value as u16) & PAYLOAD_MASK,
        })
    }

    pub fn pack(self) -> u16 {
        (u16::from(self.register) << 15) | (u16::from(self.dereference) << 14) | (self.payload & PAYLOAD_MASK)
    }

    pub fn unpack(word: u16) -> Self {
        Self {
            register: word & 0x8000 != 0,
            dereference: word & 0x4000 != 0,
            payload: word & PAYLOAD_MASK,
        }
    }

    /// Payload read as a signed 14-bit value
    pub fn signed_payload(self) -> i64 {
        let shift = 16 - PAYLOAD_BITS;
        i64::from(((self.payload << shift) as i16) >> shift)
    }
}

/// Split the bytes of one packed record back into words
pub fn unpack_record(bytes: &[u8]) -> Result<(InstructionWord, Vec<OperandWord>), InternalError> {
    if bytes.len() < 2 || bytes.len() % 2 != 0 {
        return Err(InternalError::Invariant(format!(
            "packed record of {} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    let mut words = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    let head = words
        .next()
        .map(InstructionWord::unpack)
        .ok_or_else(|| InternalError::Invariant("empty record".into()))?;
    Ok((head, words.map(OperandWord::unpack).collect()))
}

// =============================================================================
// ADDRESS RESOLUTION
// =============================================================================

/// Supplies final addresses for symbolic operands at packing time
pub trait AddressResolver {
    fn resolve_data(&self, reference: &DataReference) -> Option<u32>;
    fn resolve_target(&self, target: JumpTargetId) -> Option<u32>;
}

/// Map-backed resolver for one unit
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub data: HashMap<String, u32>,
    pub targets: HashMap<JumpTargetId, u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: HashMap<String, u32>) -> Self {
        Self {
            data,
            targets: HashMap::new(),
        }
    }

    /// Record label addresses of `items` laid out from byte address `base`
    pub fn place_labels(&mut self, items: &[EncodedItem], base: u32) {
        let mut address = base;
        for item in items {
            match item {
                EncodedItem::Label(target) => {
                    self.targets.insert(*target, address);
                }
                EncodedItem::Instruction(instr) => address += 2 * instr.word_count() as u32,
            }
        }
    }
}

impl AddressResolver for SymbolTable {
    fn resolve_data(&self, reference: &DataReference) -> Option<u32> {
        self.data.get(reference.name()).copied()
    }

    fn resolve_target(&self, target: JumpTargetId) -> Option<u32> {
        self.targets.get(&target).copied()
    }
}

/// Pack every instruction of a unit, in order
pub fn pack_unit(items: &[EncodedItem], resolver: &dyn AddressResolver) -> Result<Vec<u8>, InternalError> {
    let mut bytes = Vec::new();
    for item in items {
        if let EncodedItem::Instruction(instr) = item {
            bytes.extend(instr.pack(resolver)?);
        }
    }
    Ok(bytes)
}

// =============================================================================
// IR → HARDWARE
// =============================================================================

fn hw(operand: &Operand) -> Result<HwOperand, InternalError> {
    HwOperand::from_operand(operand)
}

fn stack() -> HwOperand {
    HwOperand::register(HardwareRegister::Stack.index())
}

/// Inline immediate when `value` fits, otherwise a read of the data entry
/// added by [`lift_frame_constants`](super::desugar::lift_frame_constants)
fn frame_constant(value: i64, reference: DataReference) -> HwOperand {
    if fits_inline(value) {
        HwOperand::immediate(value)
    } else {
        HwOperand::Data {
            reference,
            deref: true,
        }
    }
}

fn instruction(opcode: Opcode, width: Width, operands: Vec<HwOperand>) -> EncodedItem {
    EncodedItem::Instruction(HardwareInstruction::new(opcode, width, operands))
}

/// Hardware records for one allocated IR operation.
///
/// `frame` supplies the frame size and saved registers a `Return` restores.
pub fn encode_op(op: &IrOp, frame: &FrameLayout) -> Result<Vec<EncodedItem>, InternalError> {
    let items = match op {
        IrOp::Mov { to, from } => vec![instruction(Opcode::Mov, to.width(), vec![hw(to)?, hw(from)?])],
        IrOp::Unary { op, arg, to } => {
            vec![instruction(Opcode::from(*op), arg.width(), vec![hw(arg)?, hw(to)?])]
        }
        IrOp::Binary {
            op,
            left,
            right,
            to,
        } => vec![instruction(
            Opcode::from(*op),
            left.width(),
            vec![hw(left)?, hw(right)?, hw(to)?],
        )],
        IrOp::Compare { left, right } => {
            vec![instruction(Opcode::Tst, left.width(), vec![hw(left)?, hw(right)?])]
        }
        IrOp::SetCmp { dest, kind } => vec![instruction(
            Opcode::Set,
            dest.width(),
            vec![HwOperand::immediate(kind.code()), hw(dest)?],
        )],
        IrOp::Push { arg } => vec![instruction(Opcode::Push, arg.width(), vec![hw(arg)?])],
        IrOp::Pop { arg } => vec![instruction(Opcode::Pop, arg.width(), vec![hw(arg)?])],
        IrOp::Return { arg } => {
            let mut items = Vec::with_capacity(frame.saved_registers.len() + 3);
            if let Some(arg) = arg {
                items.push(instruction(
                    Opcode::Mov,
                    arg.width(),
                    vec![HwOperand::register(HardwareRegister::Return.index()), hw(arg)?],
                ));
            }
            for &reg in frame.saved_registers.iter().rev() {
                items.push(instruction(Opcode::Pop, Width::W8, vec![HwOperand::register(reg)]));
            }
            items.push(instruction(
                Opcode::Sub,
                Width::W8,
                vec![
                    stack(),
                    frame_constant(i64::from(frame.size()), frame.size_data()),
                    stack(),
                ],
            ));
            items.push(instruction(Opcode::Ret, Width::W1, Vec::new()));
            items
        }
        IrOp::Call { args, jump, result } => {
            let arg_bytes: u32 = args.iter().map(|arg| arg.width().bytes()).sum();
            let mut items = vec![
                instruction(Opcode::Call, jump.width(), vec![hw(jump)?]),
                instruction(
                    Opcode::Sub,
                    Width::W8,
                    vec![stack(), HwOperand::immediate(i64::from(arg_bytes)), stack()],
                ),
            ];
            if let Some(result) = result {
                items.push(instruction(
                    Opcode::Mov,
                    result.width(),
                    vec![hw(result)?, HwOperand::register(HardwareRegister::Return.index())],
                ));
            }
            items
        }
        IrOp::Jump { target, condition } => {
            let condition = condition
                .clone()
                .unwrap_or(Operand::Immediate(Immediate::new(1, Width::W2)));
            vec![instruction(
                Opcode::Jmp,
                condition.width(),
                vec![hw(&condition)?, HwOperand::Target(*target)],
            )]
        }
        IrOp::Target(target) => vec![EncodedItem::Label(*target)],
        IrOp::Resize { from, to } => {
            let opcode = if from.signed() { Opcode::Sxi } else { Opcode::Sxu };
            vec![instruction(
                opcode,
                from.width(),
                vec![
                    hw(from)?,
                    HwOperand::immediate(i64::from(to.width().class())),
                    hw(to)?,
                ],
            )]
        }
        IrOp::Machine {
            mnemonic,
            width,
            args,
        } => {
            let opcode = Opcode::from_mnemonic(mnemonic).ok_or_else(|| InternalError::UnknownOpcode {
                name: mnemonic.clone(),
            })?;
            let operands = args.iter().map(hw).collect::<Result<Vec<_>, _>>()?;
            vec![instruction(opcode, *width, operands)]
        }
        IrOp::LoadVar { .. } | IrOp::SaveVar { .. } | IrOp::Prelude => {
            return Err(InternalError::UnmappedInstruction {
                name: op.name().to_string(),
            })
        }
    };
    Ok(items)
}

/// Hardware records moving a register to or from its spill slot
pub fn encode_spill(spill: &SpillOp, frame: &FrameLayout) -> Vec<EncodedItem> {
    let (physical, slot, store) = match *spill {
        SpillOp::Spill { physical, slot } => (physical, slot, true),
        SpillOp::Load { physical, slot } => (physical, slot, false),
    };
    let full = AllocatedRegister::new(physical, Width::W8);
    let address = HwOperand::register(physical);
    let through = HwOperand::Register {
        index: physical,
        deref: true,
    };

    let mut items = Vec::with_capacity(4);
    if store {
        items.push(instruction(Opcode::Push, Width::W8, vec![HwOperand::register(full.physical)]));
    }
    match frame.spill_location(slot) {
        SpillLocation::Frame(offset) => {
            items.push(instruction(
                Opcode::Mov,
                POINTER_WIDTH,
                vec![address.clone(), HwOperand::register(HardwareRegister::Base.index())],
            ));
            items.push(instruction(
                Opcode::Add,
                POINTER_WIDTH,
                vec![
                    address.clone(),
                    frame_constant(offset, frame.spill_offset_data(slot)),
                    address.clone(),
                ],
            ));
        }
        SpillLocation::Data(reference) => items.push(instruction(
            Opcode::Mov,
            POINTER_WIDTH,
            vec![
                address.clone(),
                HwOperand::Data {
                    reference,
                    deref: false,
                },
            ],
        )),
    }
    if store {
        items.push(instruction(Opcode::Pop, Width::W8, vec![through]));
    } else {
        items.push(instruction(Opcode::Mov, Width::W8, vec![HwOperand::register(full.physical), through]));
    }
    items
}

/// Encode a whole allocated unit: spill traffic first, then each operation
pub fn encode_unit(code: &[IrInstruction], frame: &FrameLayout) -> Result<Vec<EncodedItem>, InternalError> {
    let mut items = Vec::with_capacity(code.len());
    for instr in code {
        for spill in &instr.pre {
            items.extend(encode_spill(spill, frame));
        }
        items.extend(encode_op(&instr.op, frame)?);
    }
    tracing::debug!(
        "encoded {} into {} words",
        frame.unit,
        items.iter().map(EncodedItem::word_count).sum::<usize>()
    );
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{CompareKind, UnitKind, VirtualRegister};

    fn allocated(index: u32, physical: u8, width: Width, signed: bool) -> VirtualRegister {
        let mut reg = VirtualRegister::new(index, width, signed);
        reg.physical = Some(physical);
        reg
    }

    fn frame() -> FrameLayout {
        FrameLayout::new(UnitKind::Function, "f", 6)
    }

    fn single(op: IrOp) -> HardwareInstruction {
        let mut items = encode_op(&op, &frame()).unwrap();
        assert_eq!(items.len(), 1);
        match items.remove(0) {
            EncodedItem::Instruction(instr) => instr,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_opcode_table_is_consistent() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
            assert_eq!(Opcode::from_parts(op.group().id(), op.index()), Some(op));
        }
        assert_eq!(Opcode::from_mnemonic("and"), None);
        assert_eq!(Opcode::from(BinaryOp::And).mnemonic(), "and_");
    }

    #[test]
    fn test_instruction_word_layout() {
        let instr = single(IrOp::binary(
            BinaryOp::Sub,
            allocated(0, 5, Width::W4, false),
            Operand::imm(3, Width::W4),
        ));
        // width class 2, group 0, index 1
        assert_eq!(instr.instruction_word().pack(), 0x8001);
        let bytes = instr.pack(&SymbolTable::new()).unwrap();
        assert_eq!(bytes, vec![0x01, 0x80, 0x05, 0x80, 0x03, 0x00, 0x05, 0x80]);
    }

    #[test]
    fn test_operand_word_flags() {
        assert_eq!(OperandWord::register(4, true).pack(), 0xC004);
        assert_eq!(OperandWord::immediate(0x3FFF, false).unwrap().pack(), 0x3FFF);
        let negative = OperandWord::immediate(-2, false).unwrap();
        assert_eq!(negative.pack(), 0x3FFE);
        assert_eq!(negative.signed_payload(), -2);
        assert!(OperandWord::immediate(0x4000, false).is_err());
        assert!(OperandWord::immediate(-0x2001, false).is_err());
    }

    #[test]
    fn test_setcmp_carries_kind() {
        let instr = single(IrOp::SetCmp {
            dest: allocated(0, 4, Width::W1, false).into(),
            kind: CompareKind::GtSigned,
        });
        assert_eq!(instr.opcode, Opcode::Set);
        assert_eq!(instr.operands[0], HwOperand::immediate(10));
    }

    #[test]
    fn test_resize_follows_source_sign() {
        let from = allocated(0, 4, Width::W1, true);
        let to = allocated(1, 5, Width::W8, false);
        let instr = single(IrOp::Resize {
            from: from.into(),
            to: to.into(),
        });
        assert_eq!(instr.opcode, Opcode::Sxi);
        assert_eq!(instr.width, Width::W1);
        assert_eq!(instr.operands[1], HwOperand::immediate(3));

        let instr = single(IrOp::Resize {
            from: from.with_sign(false).into(),
            to: to.with_sign(true).into(),
        });
        assert_eq!(instr.opcode, Opcode::Sxu);
    }

    #[test]
    fn test_return_restores_frame() {
        let mut frame = frame();
        frame.spill_slots = 1;
        frame.saved_registers = vec![4, 7];
        let items = encode_op(
            &IrOp::Return {
                arg: Some(allocated(0, 4, Width::W2, false).into()),
            },
            &frame,
        )
        .unwrap();
        let rendered: Vec<String> = items
            .iter()
            .map(|item| match item {
                EncodedItem::Instruction(instr) => instr.to_string(),
                EncodedItem::Label(l) => l.to_string(),
            })
            .collect();
        assert_eq!(
            rendered,
            vec!["mov.2 r3, r4", "pop.8 r7", "pop.8 r4", "sub.8 r0, #14, r0", "ret.1"]
        );
    }

    #[test]
    fn test_call_clears_arguments() {
        let items = encode_op(
            &IrOp::Call {
                args: vec![Operand::imm(1, Width::W1), Operand::imm(2, Width::W4)],
                jump: Operand::Data(DataReference::new("g")),
                result: Some(allocated(0, 6, Width::W1, false).into()),
            },
            &frame(),
        )
        .unwrap();
        assert_eq!(items.len(), 3);
        match &items[1] {
            EncodedItem::Instruction(instr) => {
                assert_eq!(instr.opcode, Opcode::Sub);
                assert_eq!(instr.operands[1], HwOperand::immediate(5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unconditional_jump_uses_true_immediate() {
        let instr = single(IrOp::Jump {
            target: JumpTargetId(2),
            condition: None,
        });
        assert_eq!(instr.width, Width::W2);
        assert_eq!(
            instr.operands,
            vec![HwOperand::immediate(1), HwOperand::Target(JumpTargetId(2))]
        );
    }

    #[test]
    fn test_machine_escape_and_unmapped_ops() {
        let instr = single(IrOp::Machine {
            mnemonic: "putc".into(),
            width: Width::W1,
            args: vec![Operand::imm(65, Width::W1)],
        });
        assert_eq!(instr.opcode, Opcode::Putc);

        let err = encode_op(
            &IrOp::Machine {
                mnemonic: "frobnicate".into(),
                width: Width::W1,
                args: vec![],
            },
            &frame(),
        )
        .unwrap_err();
        assert!(matches!(err, InternalError::UnknownOpcode { .. }));
        assert!(matches!(
            encode_op(&IrOp::Prelude, &frame()),
            Err(InternalError::UnmappedInstruction { .. })
        ));
    }

    #[test]
    fn test_unallocated_register_is_rejected() {
        let op = IrOp::mov(VirtualRegister::new(0, Width::W1, false), Operand::imm(0, Width::W1));
        assert!(matches!(
            encode_op(&op, &frame()),
            Err(InternalError::UnresolvedOperand(_))
        ));
    }

    #[test]
    fn test_spill_sequences() {
        let mut frame = frame();
        frame.spill_slots = 2;
        let spill = encode_spill(&SpillOp::Spill { physical: 5, slot: 1 }, &frame);
        let text: Vec<String> = spill
            .iter()
            .map(|item| match item {
                EncodedItem::Instruction(instr) => instr.to_string(),
                EncodedItem::Label(l) => l.to_string(),
            })
            .collect();
        assert_eq!(text, vec!["push.8 r5", "mov.2 r5, r1", "add.2 r5, #14, r5", "pop.8 [r5]"]);

        let top = FrameLayout::new(UnitKind::TopLevel, "g#init0", 0);
        let load = encode_spill(&SpillOp::Load { physical: 4, slot: 0 }, &top);
        assert_eq!(load.len(), 2);
        match &load[0] {
            EncodedItem::Instruction(instr) => assert_eq!(
                instr.operands[1],
                HwOperand::Data {
                    reference: DataReference::new("g#init0.spill.0"),
                    deref: false
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wide_frame_constants_read_data() {
        let mut frame = FrameLayout::new(UnitKind::Function, "big", 20_000);
        frame.spill_slots = 1;
        let items = encode_op(&IrOp::Return { arg: None }, &frame).unwrap();
        let EncodedItem::Instruction(sub) = &items[0] else {
            panic!("expected the frame release first");
        };
        assert_eq!(sub.opcode, Opcode::Sub);
        assert_eq!(
            sub.operands[1],
            HwOperand::Data {
                reference: DataReference::new("big.frame"),
                deref: true
            }
        );

        let spill = encode_spill(&SpillOp::Spill { physical: 5, slot: 0 }, &frame);
        let EncodedItem::Instruction(add) = &spill[2] else {
            panic!("expected the offset add");
        };
        assert_eq!(add.opcode, Opcode::Add);
        assert_eq!(
            add.operands[1],
            HwOperand::Data {
                reference: DataReference::new("big.spill_offset.0"),
                deref: true
            }
        );
    }

    #[test]
    fn test_labels_resolve_to_byte_addresses() {
        let code = vec![
            IrInstruction::new(IrOp::Jump {
                target: JumpTargetId(0),
                condition: None,
            }),
            IrInstruction::new(IrOp::Target(JumpTargetId(0))),
        ];
        let items = encode_unit(&code, &frame()).unwrap();
        let mut table = SymbolTable::new();
        table.place_labels(&items, 100);
        assert_eq!(table.resolve_target(JumpTargetId(0)), Some(106));
        let bytes = pack_unit(&items, &table).unwrap();
        let (head, operands) = unpack_record(&bytes).unwrap();
        assert_eq!(head.opcode(), Some(Opcode::Jmp));
        assert_eq!(operands[1].payload, 106);

        let missing = pack_unit(&items, &SymbolTable::new());
        assert!(matches!(missing, Err(InternalError::UnresolvedOperand(_))));
    }
}
