//! Linear register allocation with spilling
//!
//! One forward pass over a unit's instructions maps every virtual register to
//! a physical slot of the register file. Slots are handed out lowest first.
//! When every allocatable slot is taken, the occupant whose next use is
//! furthest away is spilled (ties go to the lowest slot) and its slot reused.
//! A spilled register is reloaded, possibly into a different slot, the next
//! time an instruction touches it.
//!
//! Liveness is the backward sweep in [`mark_last_uses`]: a register's slot is
//! released right after the instruction that last touches it.

use super::ir::{IrInstruction, SpillOp};
use crate::error::InternalError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Size of the register file and the slots allocation must never use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBudget {
    registers: u8,
    reserved: BTreeSet<u8>,
}

impl RegisterBudget {
    /// Validate a register file of `registers` slots with `reserved` held
    /// back for the stack, base, instruction and return registers.
    ///
    /// A budget with a single allocatable slot is accepted, but an
    /// instruction that touches two different registers cannot be placed in
    /// it: [`allocate`] reports `InternalError::RegisterPressure` for that
    /// instruction instead of emitting wrong code. See
    /// [`RegisterBudget::is_degraded`].
    pub fn new(registers: u8, reserved: impl IntoIterator<Item = u8>) -> Result<Self, InternalError> {
        let reserved: BTreeSet<u8> = reserved.into_iter().collect();
        let outside = reserved.iter().any(|&r| r >= registers);
        if outside || usize::from(registers) < reserved.len() + 1 {
            return Err(InternalError::RegisterBudget {
                registers,
                reserved: reserved.len(),
            });
        }
        Ok(Self { registers, reserved })
    }

    pub fn registers(&self) -> u8 {
        self.registers
    }

    pub fn reserved(&self) -> &BTreeSet<u8> {
        &self.reserved
    }

    /// Slots available to virtual registers, ascending
    pub fn allocatable(&self) -> Vec<u8> {
        (0..self.registers)
            .filter(|r| !self.reserved.contains(r))
            .collect()
    }

    /// Fewer than two allocatable slots: two-register instructions
    /// (binary operations, moves through a pointer) cannot be allocated
    pub fn is_degraded(&self) -> bool {
        usize::from(self.registers) - self.reserved.len() < 2
    }
}

impl Default for RegisterBudget {
    fn default() -> Self {
        Self {
            registers: 14,
            reserved: (0..4).collect(),
        }
    }
}

/// Summary of one allocation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Spill slots the unit needs (8 bytes each)
    pub spill_slots: u32,
    /// Physical slots written to at least once
    pub used_registers: BTreeSet<u8>,
    pub spills: usize,
    pub loads: usize,
}

/// Record in each instruction's `closing` set the registers it touches for
/// the last time.
pub fn mark_last_uses(code: &mut [IrInstruction]) {
    let mut seen = HashSet::new();
    for instr in code.iter_mut().rev() {
        instr.closing.clear();
        for reg in instr.touched_registers() {
            if seen.insert(reg.index) {
                instr.closing.insert(reg.index);
            }
        }
    }
}

/// Instruction indices at which each register is touched, ascending
fn use_positions(code: &[IrInstruction]) -> HashMap<u32, Vec<usize>> {
    let mut uses: HashMap<u32, Vec<usize>> = HashMap::new();
    for (i, instr) in code.iter().enumerate() {
        for reg in instr.touched_registers() {
            let positions = uses.entry(reg.index).or_default();
            if positions.last() != Some(&i) {
                positions.push(i);
            }
        }
    }
    uses
}

struct Allocator<'a> {
    uses: HashMap<u32, Vec<usize>>,
    allocatable: &'a [u8],
    /// Virtual register held by each physical slot
    occupant: HashMap<u8, u32>,
    assigned: HashMap<u32, u8>,
    /// Spill slot of every register currently living in memory
    spilled: HashMap<u32, u32>,
    free_spill_slots: BTreeSet<u32>,
    result: Allocation,
}

impl<'a> Allocator<'a> {
    fn next_use(&self, reg: u32, after: usize) -> usize {
        self.uses
            .get(&reg)
            .and_then(|positions| {
                let at = positions.partition_point(|&p| p <= after);
                positions.get(at).copied()
            })
            .unwrap_or(usize::MAX)
    }

    fn free_slot(&self) -> Option<u8> {
        self.allocatable
            .iter()
            .copied()
            .find(|slot| !self.occupant.contains_key(slot))
    }

    fn spill_slot(&mut self) -> u32 {
        match self.free_spill_slots.pop_first() {
            Some(slot) => slot,
            None => {
                self.result.spill_slots += 1;
                self.result.spill_slots - 1
            }
        }
    }

    /// Free a slot by spilling the occupant used furthest in the future
    fn evict(&mut self, index: usize, pinned: &BTreeSet<u8>, pre: &mut Vec<SpillOp>) -> Result<u8, InternalError> {
        let candidates: Vec<u8> = self
            .allocatable
            .iter()
            .copied()
            .filter(|slot| !pinned.contains(slot))
            .collect();
        if candidates.is_empty() {
            tracing::warn!(
                "instruction {} touches more registers than the {} allocatable slots",
                index,
                self.allocatable.len()
            );
            return Err(InternalError::RegisterPressure {
                instruction: index,
                allocatable: self.allocatable.len(),
            });
        }

        let mut victim = candidates[0];
        let mut furthest = 0;
        for slot in candidates {
            let Some(&reg) = self.occupant.get(&slot) else {
                continue;
            };
            let next = self.next_use(reg, index);
            if next > furthest {
                furthest = next;
                victim = slot;
            }
        }

        if let Some(reg) = self.occupant.remove(&victim) {
            self.assigned.remove(&reg);
            let slot = self.spill_slot();
            tracing::trace!("spilling %{} from r{} to slot {} at {}", reg, victim, slot, index);
            self.spilled.insert(reg, slot);
            pre.push(SpillOp::Spill {
                physical: victim,
                slot,
            });
            self.result.spills += 1;
        }
        Ok(victim)
    }

    fn step(&mut self, index: usize, instr: &mut IrInstruction) -> Result<(), InternalError> {
        let touched = instr.touched_registers();
        // slots already feeding this instruction cannot be given away
        let mut pinned: BTreeSet<u8> = touched
            .iter()
            .filter_map(|reg| self.assigned.get(&reg.index).copied())
            .collect();
        let mut pre = Vec::new();

        for reg in touched {
            if self.assigned.contains_key(&reg.index) {
                continue;
            }
            let physical = match self.free_slot() {
                Some(slot) => slot,
                None => self.evict(index, &pinned, &mut pre)?,
            };
            if let Some(slot) = self.spilled.remove(&reg.index) {
                pre.push(SpillOp::Load { physical, slot });
                self.free_spill_slots.insert(slot);
                self.result.loads += 1;
            }
            self.assigned.insert(reg.index, physical);
            self.occupant.insert(physical, reg.index);
            self.result.used_registers.insert(physical);
            pinned.insert(physical);
        }

        for operand in instr.touched_mut() {
            if let Some(reg) = operand.register_mut() {
                reg.physical = self.assigned.get(&reg.index).copied();
            }
        }
        instr.pre.extend(pre);

        for reg in &instr.closing {
            if let Some(physical) = self.assigned.remove(reg) {
                self.occupant.remove(&physical);
            }
        }
        Ok(())
    }
}

/// Assign a physical slot to every virtual register operand of `code`,
/// attaching spill and load operations to the instructions that need them.
///
/// `closing` sets must be current; see [`mark_last_uses`].
pub fn allocate(budget: &RegisterBudget, code: &mut [IrInstruction]) -> Result<Allocation, InternalError> {
    let allocatable = budget.allocatable();
    if allocatable.is_empty() {
        return Err(InternalError::RegisterBudget {
            registers: budget.registers,
            reserved: budget.reserved.len(),
        });
    }

    let mut allocator = Allocator {
        uses: use_positions(code),
        allocatable: &allocatable,
        occupant: HashMap::new(),
        assigned: HashMap::new(),
        spilled: HashMap::new(),
        free_spill_slots: BTreeSet::new(),
        result: Allocation::default(),
    };
    for (index, instr) in code.iter_mut().enumerate() {
        allocator.step(index, instr)?;
    }

    let result = allocator.result;
    tracing::debug!(
        "allocated {} instructions: {} registers, {} spills, {} loads",
        code.len(),
        result.used_registers.len(),
        result.spills,
        result.loads
    );
    Ok(result)
}
