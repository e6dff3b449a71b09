//! # Intermediate Representation
//!
//! Programs are lowered one unit at a time (a function body or a top-level
//! initialiser) into a linear list of [`IrInstruction`]s over an unbounded
//! supply of [`VirtualRegister`]s.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── operand.rs      # Widths, virtual/fixed registers, immediates, dereferences
//! ├── instruction.rs  # IrOp variants, touched-operand sets, spill bookkeeping
//! ├── program.rs      # LoweredUnit, FrameLayout, DataTable, ControlFlowGraph
//! ├── context.rs      # CompileContext, Registry, suspension on missing names
//! └── generator.rs    # Statement and expression lowering
//! ```
//!
//! ## Conventions
//!
//! - Binary and unary operations work in place: the destination defaults to
//!   the left operand. Width changes always go through a `Resize` into a
//!   fresh register.
//! - Comparisons are a `Compare` followed by a `SetCmp` into a 1-byte register.
//! - Variable access stays symbolic (`LoadVar`/`SaveVar`) until the
//!   pre-allocation desugar pass turns it into address arithmetic.

mod context;
mod generator;
mod instruction;
pub mod operand;
mod program;

pub use context::{CompileContext, Halt, LowerResult, Registry, ResolutionRequest};
pub use generator::{binary_result_type, literal_type, lower_function, lower_global};
pub use instruction::{
    BinaryOp, CompareKind, IrInstruction, IrOp, JumpTargetId, SpillOp, UnaryOp,
};
pub use operand::{
    AllocatedRegister, DataReference, DerefTarget, Dereference, HardwareRegister, Immediate,
    Operand, VirtualRegister,
};
pub use program::{
    BasicBlock, ControlFlowGraph, DataEntry, DataTable, FrameLayout, LoweredUnit, SpillLocation,
    UnitKind, SPILL_SLOT_SIZE,
};
