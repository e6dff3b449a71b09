//! Desugaring passes around register allocation
//!
//! Before allocation, symbolic variable access and calls become plain moves
//! and pushes so the allocator sees every register they need. After
//! allocation the frame size and the set of used registers are known, which
//! is what the function prelude needs. Immediates too wide for an operand
//! word are moved into the data table at the same point.

use super::ir::{
    AllocatedRegister, BinaryOp, DataEntry, DataTable, FrameLayout, HardwareRegister,
    IrInstruction, IrOp, LoweredUnit, Operand, SpillLocation, VirtualRegister,
};
use super::scope::{Storage, Variable};
use crate::error::InternalError;
use crate::syntax::{Width, POINTER_WIDTH};

/// Smallest and largest immediates kept inline. The machine reads an
/// immediate payload as unsigned, so negative values always go to data.
pub const INLINE_IMMEDIATE_MIN: i64 = 0;
pub const INLINE_IMMEDIATE_MAX: i64 = 0x3FFF;

pub fn fits_inline(value: i64) -> bool {
    (INLINE_IMMEDIATE_MIN..=INLINE_IMMEDIATE_MAX).contains(&value)
}

/// Rewrite `LoadVar`, `SaveVar` and `Call` into allocatable instructions
pub fn expand_variables(unit: &mut LoweredUnit) -> Result<(), InternalError> {
    let code = std::mem::take(&mut unit.code);
    let mut out = Vec::with_capacity(code.len() * 2);

    for instr in code {
        let origin = instr.origin;
        let push = |out: &mut Vec<IrInstruction>, op: IrOp| {
            out.push(IrInstruction::new(op).with_origin(origin))
        };
        match instr.op {
            IrOp::LoadVar {
                variable,
                to,
                lvalue,
            } => {
                if variable.address_only && lvalue {
                    return Err(InternalError::Invariant(format!(
                        "lvalue load of address-only variable {}",
                        variable.name
                    )));
                }
                let address = unit.new_register(POINTER_WIDTH, false);
                for op in address_of(&variable, address) {
                    push(&mut out, op);
                }
                let from = if lvalue || variable.decays() {
                    address.into()
                } else {
                    Operand::deref(address, to.width())
                };
                push(&mut out, IrOp::Mov { to, from });
            }
            IrOp::SaveVar { variable, from } => {
                let address = unit.new_register(POINTER_WIDTH, false);
                for op in address_of(&variable, address) {
                    push(&mut out, op);
                }
                let to = Operand::deref(address, from.width());
                push(&mut out, IrOp::Mov { to, from });
            }
            IrOp::Call { args, jump, result } => {
                for arg in args.iter().rev() {
                    push(&mut out, IrOp::Push { arg: arg.clone() });
                }
                push(&mut out, IrOp::Call { args, jump, result });
            }
            op => out.push(IrInstruction {
                op,
                pre: instr.pre,
                closing: instr.closing,
                origin,
            }),
        }
    }

    unit.code = out;
    Ok(())
}

/// Instructions leaving the address of `variable` in `address`
fn address_of(variable: &Variable, address: VirtualRegister) -> Vec<IrOp> {
    match variable.storage() {
        Storage::Stack(offset) => {
            let mut ops = vec![IrOp::mov(address, HardwareRegister::Base)];
            let (op, amount) = if *offset < 0 {
                (BinaryOp::Sub, -i64::from(*offset))
            } else {
                (BinaryOp::Add, i64::from(*offset))
            };
            if amount != 0 {
                ops.push(IrOp::binary(op, address, Operand::imm(amount, POINTER_WIDTH)));
            }
            ops
        }
        Storage::Global(reference) => vec![IrOp::mov(address, Operand::Data(reference.clone()))],
    }
}

/// Expand `Prelude` now that the frame size and saved registers are known
pub fn expand_prelude(code: &mut Vec<IrInstruction>, frame: &FrameLayout) {
    let mut out = Vec::with_capacity(code.len() + frame.saved_registers.len());
    for instr in code.drain(..) {
        if instr.op != IrOp::Prelude {
            out.push(instr);
            continue;
        }
        let origin = instr.origin;
        let stack = Operand::Hardware(HardwareRegister::Stack);
        out.push(
            IrInstruction {
                pre: instr.pre,
                ..IrInstruction::new(IrOp::Binary {
                    op: BinaryOp::Add,
                    left: stack.clone(),
                    right: Operand::imm(i64::from(frame.size()), Width::W8),
                    to: stack,
                })
            }
            .with_origin(origin),
        );
        for &reg in &frame.saved_registers {
            out.push(
                IrInstruction::new(IrOp::Push {
                    arg: AllocatedRegister::new(reg, Width::W8).into(),
                })
                .with_origin(origin),
            );
        }
    }
    *code = out;
}

/// Replace immediates outside the inline range with reads of a data entry
/// named `{unit}.const.{n}` holding the little-endian value.
pub fn lift_wide_immediates(code: &mut [IrInstruction], unit: &str, data: &mut DataTable) -> usize {
    let mut lifted = 0;
    for instr in code.iter_mut() {
        for operand in instr.touched_mut() {
            let Operand::Immediate(imm) = *operand else {
                continue;
            };
            if fits_inline(imm.value) {
                continue;
            }
            let bytes = imm.value.to_le_bytes()[..imm.width.bytes() as usize].to_vec();
            let reference = data.insert(format!("{}.const.{}", unit, lifted), DataEntry::Bytes(bytes));
            tracing::trace!("lifted immediate {} into {}", imm.value, reference.name());
            *operand = Operand::deref_data(reference, imm.width);
            lifted += 1;
        }
    }
    lifted
}

/// Add data entries for the frame constants the encoder emits after the
/// immediate lifting pass: the frame size a `Return` releases and the offset
/// of every spill slot. Only values outside the inline range get an entry;
/// the encoder makes the same choice.
pub fn lift_frame_constants(frame: &FrameLayout, data: &mut DataTable) -> usize {
    let mut lifted = 0;
    let size = i64::from(frame.size());
    if !fits_inline(size) {
        data.insert(frame.size_data().name(), DataEntry::Bytes(size.to_le_bytes().to_vec()));
        lifted += 1;
    }
    for slot in 0..frame.spill_slots {
        if let SpillLocation::Frame(offset) = frame.spill_location(slot) {
            if fits_inline(offset) {
                continue;
            }
            let bytes = offset.to_le_bytes()[..POINTER_WIDTH.bytes() as usize].to_vec();
            data.insert(frame.spill_offset_data(slot).name(), DataEntry::Bytes(bytes));
            lifted += 1;
        }
    }
    lifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{DataReference, UnitKind};
    use crate::syntax::Type;

    fn unit(code: Vec<IrOp>, next_register: u32) -> LoweredUnit {
        LoweredUnit {
            name: "u".into(),
            kind: UnitKind::Function,
            code: code.into_iter().map(IrInstruction::new).collect(),
            locals: 0,
            span: None,
            next_register,
        }
    }

    fn names(unit: &LoweredUnit) -> Vec<&'static str> {
        unit.code.iter().map(|i| i.op.name()).collect()
    }

    #[test]
    fn test_stack_load_becomes_address_arithmetic() {
        let var = Variable::new("x", Type::uint(Width::W4), Storage::Stack(-6), false);
        let to = VirtualRegister::new(0, Width::W4, false);
        let mut u = unit(
            vec![IrOp::LoadVar {
                variable: var,
                to: to.into(),
                lvalue: false,
            }],
            1,
        );
        expand_variables(&mut u).unwrap();
        assert_eq!(names(&u), vec!["Mov", "Binary", "Mov"]);
        let address = VirtualRegister::new(1, POINTER_WIDTH, false);
        assert_eq!(
            u.code[1].op,
            IrOp::binary(BinaryOp::Sub, address, Operand::imm(6, POINTER_WIDTH))
        );
        assert_eq!(u.code[2].op, IrOp::mov(to, Operand::deref(address, Width::W4)));
        assert_eq!(u.next_register, 2);
    }

    #[test]
    fn test_global_save_goes_through_data_reference() {
        let var = Variable::new(
            "g",
            Type::uint(Width::W2),
            Storage::Global(DataReference::new("g")),
            false,
        );
        let from = VirtualRegister::new(0, Width::W2, false);
        let mut u = unit(
            vec![IrOp::SaveVar {
                variable: var,
                from: from.into(),
            }],
            1,
        );
        expand_variables(&mut u).unwrap();
        let address = VirtualRegister::new(1, POINTER_WIDTH, false);
        assert_eq!(u.code[0].op, IrOp::mov(address, Operand::Data(DataReference::new("g"))));
        assert_eq!(u.code[1].op, IrOp::mov(Operand::deref(address, Width::W2), from));
    }

    #[test]
    fn test_call_pushes_arguments_in_reverse() {
        let a = VirtualRegister::new(0, Width::W1, false);
        let b = VirtualRegister::new(1, Width::W2, false);
        let f = VirtualRegister::new(2, POINTER_WIDTH, false);
        let mut u = unit(
            vec![IrOp::Call {
                args: vec![a.into(), b.into()],
                jump: f.into(),
                result: None,
            }],
            3,
        );
        expand_variables(&mut u).unwrap();
        assert_eq!(u.code[0].op, IrOp::Push { arg: b.into() });
        assert_eq!(u.code[1].op, IrOp::Push { arg: a.into() });
        assert_eq!(u.code[2].op.name(), "Call");
    }

    #[test]
    fn test_address_only_lvalue_is_internal_error() {
        let var = Variable::new("f", Type::function(Type::Void, vec![], false), Storage::Global(DataReference::new("f")), true);
        let mut u = unit(
            vec![IrOp::LoadVar {
                variable: var,
                to: VirtualRegister::new(0, POINTER_WIDTH, false).into(),
                lvalue: true,
            }],
            1,
        );
        assert!(expand_variables(&mut u).is_err());
    }

    #[test]
    fn test_prelude_expansion() {
        let mut frame = FrameLayout::new(UnitKind::Function, "f", 4);
        frame.spill_slots = 1;
        frame.saved_registers = vec![4, 6];
        let mut code = vec![IrInstruction::new(IrOp::Prelude), IrInstruction::new(IrOp::Return { arg: None })];
        expand_prelude(&mut code, &frame);
        let ops: Vec<_> = code.iter().map(|i| i.op.name()).collect();
        assert_eq!(ops, vec!["Binary", "Push", "Push", "Return"]);
        match &code[0].op {
            IrOp::Binary { right, .. } => assert_eq!(right, &Operand::imm(12, Width::W8)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wide_immediates_are_lifted() {
        let reg = VirtualRegister::new(0, Width::W4, false);
        let mut code = vec![
            IrInstruction::new(IrOp::mov(reg, Operand::imm(0x12345, Width::W4))),
            IrInstruction::new(IrOp::mov(reg, Operand::imm(0x3FFF, Width::W4))),
            IrInstruction::new(IrOp::mov(reg, Operand::imm(-1, Width::W2))),
        ];
        let mut data = DataTable::new();
        assert_eq!(lift_wide_immediates(&mut code, "f", &mut data), 2);
        assert_eq!(data.get("f.const.1"), Some(&DataEntry::Bytes(vec![0xFF, 0xFF])));
        assert_eq!(
            data.get("f.const.0"),
            Some(&DataEntry::Bytes(vec![0x45, 0x23, 0x01, 0x00]))
        );
        assert_eq!(
            code[0].op,
            IrOp::mov(reg, Operand::deref_data(DataReference::new("f.const.0"), Width::W4))
        );
        assert!(fits_inline(INLINE_IMMEDIATE_MAX));
        assert!(!fits_inline(INLINE_IMMEDIATE_MAX + 1));
        assert!(!fits_inline(-1));
    }

    #[test]
    fn test_frame_constants_only_when_wide() {
        let mut data = DataTable::new();
        let small = FrameLayout::new(UnitKind::Function, "small", 64);
        assert_eq!(lift_frame_constants(&small, &mut data), 0);
        assert!(data.is_empty());

        let mut big = FrameLayout::new(UnitKind::Function, "big", 0x4000);
        big.spill_slots = 2;
        assert_eq!(lift_frame_constants(&big, &mut data), 3);
        let size = 0x4000 + 16i64;
        assert_eq!(data.get("big.frame"), Some(&DataEntry::Bytes(size.to_le_bytes().to_vec())));
        assert_eq!(data.get("big.spill_offset.1"), Some(&DataEntry::Bytes(vec![0x08, 0x40])));
    }
}
