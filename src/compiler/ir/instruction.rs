//! IR instruction definitions

use super::operand::{Operand, VirtualRegister};
use crate::compiler::scope::Variable;
use crate::syntax::{Span, Width};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Label placed in the instruction stream by [`IrOp::Target`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JumpTargetId(pub u32);

impl fmt::Display for JumpTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Bitwise invert
    BitInvert,
    /// Logical invert
    LogicalInvert,
    Negate,
    Positive,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::BitInvert => "binv",
            UnaryOp::LogicalInvert => "linv",
            UnaryOp::Negate => "neg",
            UnaryOp::Positive => "pos",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::UDiv => "udiv",
            BinaryOp::IDiv => "idiv",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::Sar => "sar",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::IMod => "imod",
            BinaryOp::UMod => "umod",
        }
    }
}

/// Condition latched by a compare. The discriminant is the immediate encoded
/// into `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareKind {
    Unconditional = 0,
    Lt = 1,
    Le = 2,
    Eq = 3,
    LtSigned = 4,
    LeSigned = 5,
    Ge = 6,
    Gt = 7,
    Ne = 8,
    GeSigned = 9,
    GtSigned = 10,
}

impl CompareKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            CompareKind::Unconditional => "uncond",
            CompareKind::Lt => "lt",
            CompareKind::Le => "leq",
            CompareKind::Eq => "eq",
            CompareKind::LtSigned => "lts",
            CompareKind::LeSigned => "leqs",
            CompareKind::Ge => "geq",
            CompareKind::Gt => "gt",
            CompareKind::Ne => "neq",
            CompareKind::GeSigned => "geqs",
            CompareKind::GtSigned => "gts",
        }
    }
}

/// Spill traffic the allocator inserts in front of an instruction.
///
/// `physical` is the slot being saved or restored, `slot` the spill slot index
/// in the unit's spill area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpillOp {
    Spill { physical: u8, slot: u32 },
    Load { physical: u8, slot: u32 },
}

/// Operation of an IR instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrOp {
    /// Load a variable's value, or its address when `lvalue` is set
    LoadVar {
        variable: Variable,
        to: Operand,
        lvalue: bool,
    },
    /// Store into a variable
    SaveVar { variable: Variable, from: Operand },
    Mov { to: Operand, from: Operand },
    Unary {
        op: UnaryOp,
        arg: Operand,
        to: Operand,
    },
    Binary {
        op: BinaryOp,
        left: Operand,
        right: Operand,
        to: Operand,
    },
    /// Compare and latch flags for a following [`IrOp::SetCmp`]
    Compare { left: Operand, right: Operand },
    /// Materialize the latched compare result as 0/1
    SetCmp { dest: Operand, kind: CompareKind },
    Push { arg: Operand },
    Pop { arg: Operand },
    /// Function entry: allocate the frame and save used registers
    Prelude,
    Return { arg: Option<Operand> },
    /// Call `jump`, pushing `args` right to left; `result` receives `ret`
    Call {
        args: Vec<Operand>,
        jump: Operand,
        result: Option<Operand>,
    },
    /// Jump to `target`, unconditionally when `condition` is absent
    Jump {
        target: JumpTargetId,
        condition: Option<Operand>,
    },
    Target(JumpTargetId),
    /// Sign or zero extend (by the source's signedness) into `to`
    Resize { from: Operand, to: Operand },
    /// Raw instruction escape, looked up by mnemonic at encoding
    Machine {
        mnemonic: String,
        width: Width,
        args: Vec<Operand>,
    },
}

impl IrOp {
    /// In-place unary operation
    pub fn unary(op: UnaryOp, arg: impl Into<Operand>) -> Self {
        let arg = arg.into();
        IrOp::Unary {
            op,
            to: arg.clone(),
            arg,
        }
    }

    /// In-place binary operation: the result overwrites `left`
    pub fn binary(op: BinaryOp, left: impl Into<Operand>, right: impl Into<Operand>) -> Self {
        let left = left.into();
        IrOp::Binary {
            op,
            to: left.clone(),
            left,
            right: right.into(),
        }
    }

    pub fn mov(to: impl Into<Operand>, from: impl Into<Operand>) -> Self {
        IrOp::Mov {
            to: to.into(),
            from: from.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IrOp::LoadVar { .. } => "LoadVar",
            IrOp::SaveVar { .. } => "SaveVar",
            IrOp::Mov { .. } => "Mov",
            IrOp::Unary { .. } => "Unary",
            IrOp::Binary { .. } => "Binary",
            IrOp::Compare { .. } => "Compare",
            IrOp::SetCmp { .. } => "SetCmp",
            IrOp::Push { .. } => "Push",
            IrOp::Pop { .. } => "Pop",
            IrOp::Prelude => "Prelude",
            IrOp::Return { .. } => "Return",
            IrOp::Call { .. } => "Call",
            IrOp::Jump { .. } => "Jump",
            IrOp::Target(_) => "Target",
            IrOp::Resize { .. } => "Resize",
            IrOp::Machine { .. } => "Machine",
        }
    }
}

/// One IR instruction with the bookkeeping the allocator attaches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrInstruction {
    pub op: IrOp,
    /// Spill/load operations to run before this instruction
    pub pre: Vec<SpillOp>,
    /// Indices of registers whose last use is this instruction
    pub closing: BTreeSet<u32>,
    /// Source location of the statement or expression that produced it
    pub origin: Option<Span>,
}

impl IrInstruction {
    pub fn new(op: IrOp) -> Self {
        Self {
            op,
            pre: Vec::new(),
            closing: BTreeSet::new(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<Span>) -> Self {
        self.origin = origin;
        self
    }

    /// Operands the instruction reads or writes
    pub fn touched(&self) -> Vec<&Operand> {
        match &self.op {
            IrOp::LoadVar { to, .. } => vec![to],
            IrOp::SaveVar { from, .. } => vec![from],
            IrOp::Mov { to, from } => vec![to, from],
            IrOp::Unary { arg, to, .. } => vec![arg, to],
            IrOp::Binary {
                left, right, to, ..
            } => vec![left, right, to],
            IrOp::Compare { left, right } => vec![left, right],
            IrOp::SetCmp { dest, .. } => vec![dest],
            IrOp::Push { arg } | IrOp::Pop { arg } => vec![arg],
            IrOp::Return { arg } => arg.iter().collect(),
            IrOp::Call { jump, result, .. } => std::iter::once(jump).chain(result.iter()).collect(),
            IrOp::Jump { condition, .. } => condition.iter().collect(),
            IrOp::Resize { from, to } => vec![from, to],
            IrOp::Machine { args, .. } => args.iter().collect(),
            IrOp::Prelude | IrOp::Target(_) => Vec::new(),
        }
    }

    pub fn touched_mut(&mut self) -> Vec<&mut Operand> {
        match &mut self.op {
            IrOp::LoadVar { to, .. } => vec![to],
            IrOp::SaveVar { from, .. } => vec![from],
            IrOp::Mov { to, from } => vec![to, from],
            IrOp::Unary { arg, to, .. } => vec![arg, to],
            IrOp::Binary {
                left, right, to, ..
            } => vec![left, right, to],
            IrOp::Compare { left, right } => vec![left, right],
            IrOp::SetCmp { dest, .. } => vec![dest],
            IrOp::Push { arg } | IrOp::Pop { arg } => vec![arg],
            IrOp::Return { arg } => arg.iter_mut().collect(),
            IrOp::Call { jump, result, .. } => {
                std::iter::once(jump).chain(result.iter_mut()).collect()
            }
            IrOp::Jump { condition, .. } => condition.iter_mut().collect(),
            IrOp::Resize { from, to } => vec![from, to],
            IrOp::Machine { args, .. } => args.iter_mut().collect(),
            IrOp::Prelude | IrOp::Target(_) => Vec::new(),
        }
    }

    /// Virtual registers touched, in operand order, possibly repeated
    pub fn touched_registers(&self) -> Vec<VirtualRegister> {
        self.touched()
            .into_iter()
            .filter_map(|op| op.register().copied())
            .collect()
    }
}

impl fmt::Display for IrInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pre in &self.pre {
            match pre {
                SpillOp::Spill { physical, slot } => writeln!(f, "  spill r{} -> slot{}", physical, slot)?,
                SpillOp::Load { physical, slot } => writeln!(f, "  load  r{} <- slot{}", physical, slot)?,
            }
        }
        match &self.op {
            IrOp::LoadVar {
                variable,
                to,
                lvalue,
            } => {
                let amp = if *lvalue { "&" } else { "" };
                write!(f, "  {} = load {}{}", to, amp, variable.name)
            }
            IrOp::SaveVar { variable, from } => write!(f, "  save {} = {}", variable.name, from),
            IrOp::Mov { to, from } => write!(f, "  {} = {}", to, from),
            IrOp::Unary { op, arg, to } => write!(f, "  {} = {} {}", to, op.name(), arg),
            IrOp::Binary {
                op,
                left,
                right,
                to,
            } => write!(f, "  {} = {} {}, {}", to, op.name(), left, right),
            IrOp::Compare { left, right } => write!(f, "  cmp {}, {}", left, right),
            IrOp::SetCmp { dest, kind } => write!(f, "  {} = set {}", dest, kind.name()),
            IrOp::Push { arg } => write!(f, "  push {}", arg),
            IrOp::Pop { arg } => write!(f, "  pop {}", arg),
            IrOp::Prelude => write!(f, "  prelude"),
            IrOp::Return { arg: Some(arg) } => write!(f, "  ret {}", arg),
            IrOp::Return { arg: None } => write!(f, "  ret"),
            IrOp::Call { args, jump, result } => {
                if let Some(result) = result {
                    write!(f, "  {} = ", result)?;
                } else {
                    write!(f, "  ")?;
                }
                write!(f, "call {}(", jump)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            IrOp::Jump {
                target,
                condition: Some(cond),
            } => write!(f, "  jmp {} if {}", target, cond),
            IrOp::Jump {
                target,
                condition: None,
            } => write!(f, "  jmp {}", target),
            IrOp::Target(id) => write!(f, "{}:", id),
            IrOp::Resize { from, to } => write!(f, "  {} = resize {}", to, from),
            IrOp::Machine {
                mnemonic,
                width,
                args,
            } => {
                write!(f, "  {}.{}", mnemonic, width)?;
                for (i, arg) in args.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { ", " }, arg)?;
                }
                Ok(())
            }
        }
    }
}
