//! IR operands: virtual registers, fixed registers, immediates and memory
//! references

use crate::syntax::{Width, POINTER_WIDTH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Virtual register (unbounded supply, mapped to a physical slot by the
/// allocator).
///
/// Identity is the `index` alone: two handles with the same index denote the
/// same register even if they were resized views or one has been allocated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VirtualRegister {
    pub index: u32,
    pub width: Width,
    pub signed: bool,
    /// Physical slot, filled in by the allocator
    pub physical: Option<u8>,
}

impl VirtualRegister {
    pub fn new(index: u32, width: Width, signed: bool) -> Self {
        Self {
            index,
            width,
            signed,
            physical: None,
        }
    }

    /// Same register seen with a different sign
    pub fn with_sign(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    /// Same register read at a different width without extension
    pub fn reinterpret(mut self, width: Width) -> Self {
        self.width = width;
        self
    }
}

impl PartialEq for VirtualRegister {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for VirtualRegister {}

impl Hash for VirtualRegister {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.signed { 's' } else { 'u' };
        match self.physical {
            Some(slot) => write!(f, "%{}@r{}({}{})", self.index, slot, sign, self.width),
            None => write!(f, "%{}({}{})", self.index, sign, self.width),
        }
    }
}

/// Register fixed by the programmer or the backend (inline assembly, saved
/// registers, spill scratch). Never touched by allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocatedRegister {
    pub physical: u8,
    pub width: Width,
    pub signed: bool,
}

impl AllocatedRegister {
    pub fn new(physical: u8, width: Width) -> Self {
        Self {
            physical,
            width,
            signed: false,
        }
    }
}

/// Machine registers with a fixed role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareRegister {
    /// Stack pointer (`stk`)
    Stack,
    /// Frame base pointer (`bas`)
    Base,
    /// Instruction pointer (`cur`)
    Current,
    /// Return value register (`ret`)
    Return,
}

impl HardwareRegister {
    pub fn index(self) -> u8 {
        match self {
            HardwareRegister::Stack => 0,
            HardwareRegister::Base => 1,
            HardwareRegister::Current => 2,
            HardwareRegister::Return => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HardwareRegister::Stack => "stk",
            HardwareRegister::Base => "bas",
            HardwareRegister::Current => "cur",
            HardwareRegister::Return => "ret",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Immediate {
    pub value: i64,
    pub width: Width,
}

impl Immediate {
    pub fn new(value: i64, width: Width) -> Self {
        Self { value, width }
    }
}

/// Named entry in the global data table, resolved to an address at assembly
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataReference(pub String);

impl DataReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// What a [`Dereference`] reads through
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerefTarget {
    Register(VirtualRegister),
    Allocated(AllocatedRegister),
    Immediate(Immediate),
    Data(DataReference),
}

/// Memory access of `width` bytes at the address held by `target`.
///
/// Holds its own copy of the target so a resized view of a register never
/// changes the dereference built from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dereference {
    pub target: DerefTarget,
    pub width: Width,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Register(VirtualRegister),
    Allocated(AllocatedRegister),
    Hardware(HardwareRegister),
    Immediate(Immediate),
    Dereference(Dereference),
    /// Address of a data table entry
    Data(DataReference),
}

impl Operand {
    pub fn imm(value: i64, width: Width) -> Self {
        Operand::Immediate(Immediate::new(value, width))
    }

    /// Memory access through a virtual register
    pub fn deref(reg: VirtualRegister, width: Width) -> Self {
        Operand::Dereference(Dereference {
            target: DerefTarget::Register(reg),
            width,
        })
    }

    pub fn deref_allocated(reg: AllocatedRegister, width: Width) -> Self {
        Operand::Dereference(Dereference {
            target: DerefTarget::Allocated(reg),
            width,
        })
    }

    pub fn deref_data(reference: DataReference, width: Width) -> Self {
        Operand::Dereference(Dereference {
            target: DerefTarget::Data(reference),
            width,
        })
    }

    /// Access width of the operand
    pub fn width(&self) -> Width {
        match self {
            Operand::Register(reg) => reg.width,
            Operand::Allocated(reg) => reg.width,
            Operand::Hardware(_) => Width::W8,
            Operand::Immediate(imm) => imm.width,
            Operand::Dereference(deref) => deref.width,
            Operand::Data(_) => POINTER_WIDTH,
        }
    }

    /// Whether the operand holds a signed value; decides sign extension
    pub fn signed(&self) -> bool {
        match self {
            Operand::Register(reg) => reg.signed,
            Operand::Allocated(reg) => reg.signed,
            Operand::Immediate(imm) => imm.value < 0,
            Operand::Hardware(_) | Operand::Dereference(_) | Operand::Data(_) => false,
        }
    }

    /// Virtual register this operand reads or writes, directly or as the
    /// address of a dereference
    pub fn register(&self) -> Option<&VirtualRegister> {
        match self {
            Operand::Register(reg) => Some(reg),
            Operand::Dereference(Dereference {
                target: DerefTarget::Register(reg),
                ..
            }) => Some(reg),
            _ => None,
        }
    }

    pub fn register_mut(&mut self) -> Option<&mut VirtualRegister> {
        match self {
            Operand::Register(reg) => Some(reg),
            Operand::Dereference(Dereference {
                target: DerefTarget::Register(reg),
                ..
            }) => Some(reg),
            _ => None,
        }
    }
}

impl From<VirtualRegister> for Operand {
    fn from(reg: VirtualRegister) -> Self {
        Operand::Register(reg)
    }
}

impl From<AllocatedRegister> for Operand {
    fn from(reg: AllocatedRegister) -> Self {
        Operand::Allocated(reg)
    }
}

impl From<HardwareRegister> for Operand {
    fn from(reg: HardwareRegister) -> Self {
        Operand::Hardware(reg)
    }
}

impl fmt::Display for DerefTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerefTarget::Register(reg) => write!(f, "{}", reg),
            DerefTarget::Allocated(reg) => write!(f, "r{}", reg.physical),
            DerefTarget::Immediate(imm) => write!(f, "{}", imm.value),
            DerefTarget::Data(data) => write!(f, "${}", data.0),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(reg) => write!(f, "{}", reg),
            Operand::Allocated(reg) => write!(f, "r{}({})", reg.physical, reg.width),
            Operand::Hardware(reg) => write!(f, "{}", reg.name()),
            Operand::Immediate(imm) => write!(f, "#{}({})", imm.value, imm.width),
            Operand::Dereference(deref) => write!(f, "[{}]{}", deref.target, deref.width),
            Operand::Data(data) => write!(f, "${}", data.0),
        }
    }
}
