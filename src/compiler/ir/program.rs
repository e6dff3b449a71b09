//! Compilation units, frame layout, the global data table and the control
//! flow graph

use super::instruction::{IrInstruction, IrOp, JumpTargetId};
use super::operand::{DataReference, VirtualRegister};
use crate::syntax::{Span, Width};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Spill slots are 8 bytes: a whole physical register
pub const SPILL_SLOT_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Function,
    /// Initialiser code of a top-level variable. Runs without a frame.
    TopLevel,
}

/// Where a unit's spill slot lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpillLocation {
    /// Byte offset from the frame base
    Frame(i64),
    /// Global data entry
    Data(DataReference),
}

/// Stack frame of a unit: locals first, then spill slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub kind: UnitKind,
    /// Name of the owning unit, used to name global spill slots
    pub unit: String,
    /// Bytes of local variables
    pub locals: u32,
    /// Spill slots the allocator needed
    pub spill_slots: u32,
    /// Physical registers saved on entry and restored on return
    pub saved_registers: Vec<u8>,
}

impl FrameLayout {
    pub fn new(kind: UnitKind, unit: impl Into<String>, locals: u32) -> Self {
        Self {
            kind,
            unit: unit.into(),
            locals,
            spill_slots: 0,
            saved_registers: Vec::new(),
        }
    }

    /// Bytes the prelude reserves on the stack. Top-level units spill into
    /// global data and reserve nothing for spills.
    pub fn size(&self) -> u32 {
        match self.kind {
            UnitKind::Function => self.locals + self.spill_slots * SPILL_SLOT_SIZE,
            UnitKind::TopLevel => self.locals,
        }
    }

    pub fn spill_location(&self, slot: u32) -> SpillLocation {
        match self.kind {
            UnitKind::Function => {
                SpillLocation::Frame(i64::from(self.locals + slot * SPILL_SLOT_SIZE))
            }
            UnitKind::TopLevel => SpillLocation::Data(self.spill_data(slot)),
        }
    }

    /// Data table name of a top-level unit's spill slot
    pub fn spill_data(&self, slot: u32) -> DataReference {
        DataReference::new(format!("{}.spill.{}", self.unit, slot))
    }

    /// Data entry read in place of a frame size too wide for an operand word
    pub fn size_data(&self) -> DataReference {
        DataReference::new(format!("{}.frame", self.unit))
    }

    /// Data entry read in place of a spill slot offset too wide for an
    /// operand word
    pub fn spill_offset_data(&self, slot: u32) -> DataReference {
        DataReference::new(format!("{}.spill_offset.{}", self.unit, slot))
    }
}

/// Output of lowering one function body or top-level initialiser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoweredUnit {
    pub name: String,
    pub kind: UnitKind,
    pub code: Vec<IrInstruction>,
    /// Bytes of locals declared in the body
    pub locals: u32,
    pub span: Option<Span>,
    /// Next unused virtual register index
    pub next_register: u32,
}

impl LoweredUnit {
    /// Fresh register for passes that run after lowering
    pub fn new_register(&mut self, width: Width, signed: bool) -> VirtualRegister {
        let reg = VirtualRegister::new(self.next_register, width, signed);
        self.next_register += 1;
        reg
    }
}

/// Initial contents of a data table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataEntry {
    /// `n` zero bytes
    Zeroed(u32),
    Bytes(Vec<u8>),
}

impl DataEntry {
    pub fn size(&self) -> u32 {
        match self {
            DataEntry::Zeroed(n) => *n,
            DataEntry::Bytes(bytes) => bytes.len() as u32,
        }
    }
}

/// Named global data, in insertion order
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataTable {
    entries: Vec<(String, DataEntry)>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry unless one with the same name exists
    pub fn insert(&mut self, name: impl Into<String>, entry: DataEntry) -> DataReference {
        let name = name.into();
        if !self.index.contains_key(&name) {
            self.index.insert(name.clone(), self.entries.len());
            self.entries.push((name.clone(), entry));
        }
        DataReference::new(name)
    }

    pub fn get(&self, name: &str) -> Option<&DataEntry> {
        self.index.get(name).map(|i| &self.entries[*i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every entry of `other` not already present
    pub fn merge(&mut self, other: DataTable) {
        for (name, entry) in other.entries {
            self.insert(name, entry);
        }
    }

    /// Byte address of each entry when laid out back to back from `base`
    pub fn layout(&self, base: u32) -> HashMap<String, u32> {
        let mut offset = base;
        let mut addresses = HashMap::with_capacity(self.entries.len());
        for (name, entry) in &self.entries {
            addresses.insert(name.clone(), offset);
            offset += entry.size();
        }
        addresses
    }
}

/// Basic block in the control flow graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Index of the first instruction
    pub start: usize,
    /// One past the last instruction
    pub end: usize,
    /// Indices of successor blocks
    pub successors: Vec<usize>,
    /// Indices of predecessor blocks
    pub predecessors: Vec<usize>,
}

/// Blocks of a unit with jump edges between them
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    /// Block that starts at each jump target
    targets: HashMap<JumpTargetId, usize>,
    /// Instructions jumping to each target
    incoming: HashMap<JumpTargetId, Vec<usize>>,
}

impl ControlFlowGraph {
    pub fn build(code: &[IrInstruction]) -> Self {
        let mut leaders = vec![false; code.len()];
        if let Some(first) = leaders.first_mut() {
            *first = true;
        }
        let mut incoming: HashMap<JumpTargetId, Vec<usize>> = HashMap::new();
        for (i, instr) in code.iter().enumerate() {
            match &instr.op {
                IrOp::Target(_) => leaders[i] = true,
                IrOp::Jump { target, .. } => {
                    incoming.entry(*target).or_default().push(i);
                    if i + 1 < code.len() {
                        leaders[i + 1] = true;
                    }
                }
                IrOp::Return { .. } if i + 1 < code.len() => leaders[i + 1] = true,
                _ => {}
            }
        }

        let starts: Vec<usize> = (0..code.len()).filter(|&i| leaders[i]).collect();
        let mut blocks: Vec<BasicBlock> = starts
            .iter()
            .enumerate()
            .map(|(b, &start)| BasicBlock {
                start,
                end: starts.get(b + 1).copied().unwrap_or(code.len()),
                successors: Vec::new(),
                predecessors: Vec::new(),
            })
            .collect();

        let targets: HashMap<JumpTargetId, usize> = blocks
            .iter()
            .enumerate()
            .filter_map(|(b, block)| match code[block.start].op {
                IrOp::Target(id) => Some((id, b)),
                _ => None,
            })
            .collect();

        for b in 0..blocks.len() {
            let last = &code[blocks[b].end - 1];
            let fallthrough = (b + 1 < blocks.len()).then_some(b + 1);
            let mut successors = Vec::new();
            match &last.op {
                IrOp::Jump { target, condition } => {
                    if let Some(&dest) = targets.get(target) {
                        successors.push(dest);
                    }
                    if condition.is_some() {
                        successors.extend(fallthrough);
                    }
                }
                IrOp::Return { .. } => {}
                _ => successors.extend(fallthrough),
            }
            successors.dedup();
            blocks[b].successors = successors;
        }
        for b in 0..blocks.len() {
            for s in blocks[b].successors.clone() {
                blocks[s].predecessors.push(b);
            }
        }

        Self {
            blocks,
            targets,
            incoming,
        }
    }

    /// Block beginning at `target`
    pub fn block_of_target(&self, target: JumpTargetId) -> Option<usize> {
        self.targets.get(&target).copied()
    }

    /// Indices of the jump instructions that reach `target`
    pub fn jumps_into(&self, target: JumpTargetId) -> &[usize] {
        self.incoming.get(&target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Block containing instruction `index`
    pub fn block_of(&self, index: usize) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.start <= index && index < b.end)
    }
}
