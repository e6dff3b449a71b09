//! End-to-end scenarios: typed program in, lowered units and hardware records out

use vregc::compiler::encoder::{pack_unit, unpack_record, EncodedItem, Opcode, SymbolTable};
use vregc::compiler::ir::{BinaryOp, IrInstruction, IrOp, Operand, SpillOp, VirtualRegister};
use vregc::compiler::scope::Storage;
use vregc::compiler::{allocate, mark_last_uses, CompileOptions, Compiler, RegisterBudget};
use vregc::syntax::{BinaryOperator, Expr, Item, Path, Program, Span, Stmt, Type, Width};
use vregc::{CompileErrorKind, Error};

fn compiler() -> Compiler {
    Compiler::new(CompileOptions::default())
}

fn kind_of(err: Error) -> CompileErrorKind {
    match err.compile_kind() {
        Some(kind) => kind,
        None => panic!("expected a compile error, got {}", err),
    }
}

#[test]
fn test_inferred_global_is_one_byte_unsigned() {
    let program = Program::new(vec![Item::var("a", None, Some(Expr::int(4)))]);
    let lowering = compiler().lower(&program).unwrap();
    let scopes = &lowering.registry.scopes;
    let a = scopes.resolve(scopes.root(), &Path::parse("a")).unwrap();
    assert_eq!(a.ty, Type::uint(Width::W1));
    assert!(matches!(a.storage(), Storage::Global(_)));
}

#[test]
fn test_identical_redeclaration_is_accepted() {
    let program = Program::new(vec![
        Item::var("a", Some(Type::uint(Width::W4)), None),
        Item::var("a", Some(Type::uint(Width::W4)), None),
    ]);
    assert!(compiler().compile(&program).is_ok());

    let in_function = Program::new(vec![Item::function(
        "f",
        vec![],
        Type::Void,
        vec![
            Stmt::var("a", Some(Type::uint(Width::W4)), None),
            Stmt::var("a", Some(Type::uint(Width::W4)), None),
        ],
    )]);
    assert!(compiler().compile(&in_function).is_ok());
}

#[test]
fn test_conflicting_redeclaration_fails() {
    let program = Program::new(vec![
        Item::var("a", Some(Type::uint(Width::W4)), None),
        Item::var("a", Some(Type::sint(Width::W1)), None),
    ]);
    let err = compiler().compile(&program).unwrap_err();
    assert_eq!(kind_of(err), CompileErrorKind::ConflictingDeclaration);

    let in_function = Program::new(vec![Item::function(
        "f",
        vec![],
        Type::Void,
        vec![
            Stmt::var("a", Some(Type::uint(Width::W4)), None),
            Stmt::var("a", Some(Type::sint(Width::W1)), None),
        ],
    )]);
    let err = compiler().compile(&in_function).unwrap_err();
    assert_eq!(kind_of(err), CompileErrorKind::ConflictingDeclaration);
}

#[test]
fn test_shadowing_in_nested_block_is_allowed() {
    let program = Program::new(vec![Item::function(
        "f",
        vec![],
        Type::Void,
        vec![
            Stmt::var("a", Some(Type::uint(Width::W4)), None),
            Stmt::block(vec![Stmt::var("a", Some(Type::sint(Width::W1)), None)]),
        ],
    )]);
    assert!(compiler().compile(&program).is_ok());
}

#[test]
fn test_forward_reference_resolves() {
    let program = Program::new(vec![
        Item::function(
            "main",
            vec![],
            Type::uint(Width::W2),
            vec![Stmt::ret(Some(Expr::call(Expr::name("helper"), vec![])))],
        ),
        Item::function(
            "helper",
            vec![],
            Type::uint(Width::W2),
            vec![Stmt::ret(Some(Expr::name("counter")))],
        ),
        Item::var("counter", Some(Type::uint(Width::W2)), Some(Expr::int(9))),
    ]);
    let result = compiler().compile(&program).unwrap();
    let names: Vec<_> = result.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["main", "helper", "counter#init2"]);
}

#[test]
fn test_module_member_needs_qualification() {
    let module = Item::module("m", vec![Item::var("x", None, Some(Expr::int(1)))]);

    let qualified = Program::new(vec![
        module.clone(),
        Item::function(
            "f",
            vec![],
            Type::uint(Width::W1),
            vec![Stmt::ret(Some(Expr::name("m.x")))],
        ),
    ]);
    assert!(compiler().compile(&qualified).is_ok());

    let use_site = Span::line(4, 12, 12);
    let unqualified = Program::new(vec![
        module,
        Item::function(
            "f",
            vec![],
            Type::uint(Width::W1),
            vec![Stmt::ret(Some(Expr::name("x").at(use_site)))],
        ),
    ]);
    match compiler().compile(&unqualified).unwrap_err() {
        Error::Compile(err) => {
            assert_eq!(err.kind, CompileErrorKind::UndefinedName);
            assert_eq!(err.span, Some(use_site));
        }
        other => panic!("unexpected {}", other),
    }
}

#[test]
fn test_assigning_to_literal_is_not_an_lvalue() {
    let program = Program::new(vec![Item::function(
        "f",
        vec![],
        Type::Void,
        vec![Stmt::expr(Expr::assign(Expr::int(1), Expr::int(2)))],
    )]);
    let err = compiler().compile(&program).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert_eq!(kind_of(err), CompileErrorKind::NotAnLvalue);
}

#[test]
fn test_array_literal_storage_is_read_only() {
    let pair = || Expr::array(vec![Expr::int(1), Expr::int(2)]);
    let write = |target: Expr| {
        Program::new(vec![Item::function(
            "f",
            vec![],
            Type::Void,
            vec![
                Stmt::var("a", None, Some(pair())),
                Stmt::expr(Expr::assign(target, Expr::int(5))),
            ],
        )])
    };

    let through_name = write(Expr::deref(Expr::name("a")));
    let err = compiler().compile(&through_name).unwrap_err();
    assert_eq!(kind_of(err), CompileErrorKind::NotAnLvalue);

    let through_offset = write(Expr::deref(Expr::binary(
        BinaryOperator::Add,
        Expr::name("a"),
        Expr::int(1),
    )));
    let err = compiler().compile(&through_offset).unwrap_err();
    assert_eq!(kind_of(err), CompileErrorKind::NotAnLvalue);

    let grid = Type::array(Type::array(Type::uint(Width::W1), Some(2)), Some(2));
    let nested = Program::new(vec![
        Item::var("g", Some(grid), Some(Expr::array(vec![pair(), pair()]))),
        Item::function(
            "f",
            vec![],
            Type::Void,
            vec![Stmt::expr(Expr::assign(
                Expr::index(Expr::index(Expr::name("g"), Expr::int(0)), Expr::int(1)),
                Expr::int(9),
            ))],
        ),
    ]);
    let err = compiler().compile(&nested).unwrap_err();
    assert_eq!(kind_of(err), CompileErrorKind::NotAnLvalue);
}

#[test]
fn test_two_registers_three_live_values() {
    let reg = |i| VirtualRegister::new(i, Width::W4, false);
    let mut code: Vec<IrInstruction> = vec![
        IrOp::mov(reg(0), Operand::imm(1, Width::W4)),
        IrOp::mov(reg(1), Operand::imm(2, Width::W4)),
        IrOp::mov(reg(2), Operand::imm(3, Width::W4)),
        IrOp::binary(BinaryOp::Add, reg(2), reg(1)),
        IrOp::binary(BinaryOp::Add, reg(0), reg(2)),
    ]
    .into_iter()
    .map(IrInstruction::new)
    .collect();
    mark_last_uses(&mut code);

    let budget = RegisterBudget::new(2, []).unwrap();
    let allocation = allocate(&budget, &mut code).unwrap();

    let spills: Vec<(usize, SpillOp)> = code
        .iter()
        .enumerate()
        .flat_map(|(i, instr)| instr.pre.iter().map(move |op| (i, *op)))
        .collect();
    assert_eq!(
        spills,
        vec![
            (2, SpillOp::Spill { physical: 0, slot: 0 }),
            (4, SpillOp::Load { physical: 1, slot: 0 }),
        ]
    );
    assert_eq!(allocation.spill_slots, 1);
}

#[test]
fn test_small_register_file_spills_through_the_frame() {
    let program = Program::new(vec![
        Item::var("g", Some(Type::uint(Width::W2)), Some(Expr::int(7))),
        Item::function(
            "f",
            vec![("x", Type::uint(Width::W2))],
            Type::uint(Width::W2),
            vec![Stmt::ret(Some(Expr::binary(
                BinaryOperator::Add,
                Expr::name("x"),
                Expr::name("g"),
            )))],
        ),
    ]);
    let options = CompileOptions {
        register_count: 6,
        ..CompileOptions::default()
    };
    let result = Compiler::new(options).compile(&program).unwrap();
    let f = result.unit("f").unwrap();
    assert!(f.frame.spill_slots >= 1);
    assert!(f.allocation.spills >= 1);
    for instr in &f.ir {
        for reg in instr.touched_registers() {
            let physical = reg.physical.unwrap();
            assert!((4..6).contains(&physical), "register {} escaped the budget", physical);
        }
    }
    // the spill sequence pops into the frame slot
    assert!(f.records.iter().any(|item| matches!(
        item,
        EncodedItem::Instruction(instr) if instr.opcode == Opcode::Pop && instr.width == Width::W8
    )));
}

#[test]
fn test_single_register_budget_fails_loudly() {
    let program = Program::new(vec![Item::function(
        "f",
        vec![("x", Type::uint(Width::W2)), ("y", Type::uint(Width::W2))],
        Type::uint(Width::W2),
        vec![Stmt::ret(Some(Expr::binary(
            BinaryOperator::Add,
            Expr::name("x"),
            Expr::name("y"),
        )))],
    )]);
    let options = CompileOptions {
        register_count: 5,
        ..CompileOptions::default()
    };
    assert!(options.budget().unwrap().is_degraded());
    let err = Compiler::new(options).compile(&program).unwrap_err();
    assert!(err.is_internal());
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn test_large_frame_packs() {
    let program = Program::new(vec![
        Item::var("g", Some(Type::uint(Width::W2)), Some(Expr::int(7))),
        Item::function(
            "f",
            vec![("x", Type::uint(Width::W2))],
            Type::uint(Width::W2),
            vec![
                Stmt::var("buf", Some(Type::array(Type::uint(Width::W1), Some(20_000))), None),
                Stmt::ret(Some(Expr::binary(
                    BinaryOperator::Add,
                    Expr::name("x"),
                    Expr::name("g"),
                ))),
            ],
        ),
    ]);
    // two allocatable registers force a spill past the buffer
    let options = CompileOptions {
        register_count: 6,
        ..CompileOptions::default()
    };
    let result = Compiler::new(options).compile(&program).unwrap();
    let f = result.unit("f").unwrap();
    assert!(f.frame.size() > 0x3FFF);
    assert!(f.allocation.spills >= 1);
    assert!(result.data.contains("f.frame"));
    assert!(result.data.contains("f.spill_offset.0"));

    let addresses = result.data.layout(0x100);
    for unit in &result.units {
        let mut table = SymbolTable::with_data(addresses.clone());
        table.place_labels(&unit.records, 0x1000);
        let bytes = pack_unit(&unit.records, &table).unwrap();
        assert_eq!(bytes.len(), unit.word_count() * 2);
    }
}

#[test]
fn test_records_pack_after_layout() {
    let program = Program::new(vec![
        Item::var("big", Some(Type::uint(Width::W4)), Some(Expr::int(100_000))),
        Item::function(
            "main",
            vec![],
            Type::Void,
            vec![Stmt::while_loop(
                Expr::binary(BinaryOperator::Lt, Expr::name("big"), Expr::int(3)),
                vec![Stmt::expr(Expr::assign(Expr::name("big"), Expr::int(3)))],
            )],
        ),
    ]);
    let result = compiler().compile(&program).unwrap();
    // 100_000 does not fit a 14-bit payload
    assert!(result.data.contains("big#init0.const.0"));

    let addresses = result.data.layout(0x100);
    let mut base = 0x1000;
    for unit in &result.units {
        let mut table = SymbolTable::with_data(addresses.clone());
        table.place_labels(&unit.records, base);
        let bytes = pack_unit(&unit.records, &table).unwrap();
        assert_eq!(bytes.len(), unit.word_count() * 2);
        base += bytes.len() as u32;
    }

    let main = result.unit("main").unwrap();
    let first = main
        .records
        .iter()
        .find_map(|item| match item {
            EncodedItem::Instruction(instr) => Some(instr.clone()),
            EncodedItem::Label(_) => None,
        })
        .unwrap();
    let bytes = first.pack(&SymbolTable::new()).unwrap();
    let (head, operands) = unpack_record(&bytes).unwrap();
    assert_eq!(head.opcode(), Some(first.opcode));
    assert_eq!(operands.len(), first.operands.len());
}
