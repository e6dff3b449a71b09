//! # vregc Compiler - Typed Syntax to Register VM Records
//!
//! Lowers a typed program into virtual-register IR, allocates a fixed
//! register file with spilling and encodes the result into 16-bit word
//! instruction records for the assembler.
//!
//! ## Architecture
//!
//! ```text
//! Program → resolve (per-unit lowering, forward references)
//!         → desugar (variables, calls) → regalloc → prelude → immediates
//!         → encoder (hardware records) → assembler
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use vregc::compiler::{Compiler, CompileOptions};
//!
//! let compiler = Compiler::new(CompileOptions::default()).with_source(text);
//! let result = compiler.compile(&program)?;
//! for unit in &result.units {
//!     println!("{}: {} words", unit.name, unit.word_count());
//! }
//! ```

pub mod debug;
pub mod desugar;
pub mod encoder;
pub mod ir;
pub mod regalloc;
pub mod resolve;
pub mod scope;

pub use debug::{dump_ir, dump_ir_json, format_ir, hex_listing};
pub use encoder::{
    encode_op, encode_unit, pack_unit, AddressResolver, EncodedItem, HardwareInstruction,
    HwOperand, InstructionWord, Opcode, OpcodeGroup, OperandWord, SymbolTable,
};
pub use ir::{ControlFlowGraph, DataTable, FrameLayout, IrInstruction, LoweredUnit, UnitKind};
pub use regalloc::{allocate, mark_last_uses, Allocation, RegisterBudget};
pub use resolve::{lower_program, Lowering};
pub use scope::ScopeTree;

use crate::diagnostics;
use crate::error::{Error, InternalError, Result};
use crate::syntax::{Program, Span};
use ir::DataEntry;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Compilation options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Size of the register file
    pub register_count: u8,
    /// Hardware registers allocation must never hand out
    /// (stack, base, instruction pointer and return register)
    pub reserved_registers: Vec<u8>,
    /// Run per-unit backend work on the rayon pool
    pub parallel: bool,
    /// Move immediates that do not fit an operand word into data
    pub lift_wide_immediates: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            register_count: 14,
            reserved_registers: vec![0, 1, 2, 3],
            parallel: false,
            lift_wide_immediates: true,
        }
    }
}

impl CompileOptions {
    /// Parse options from JSON; missing fields keep their defaults
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn budget(&self) -> std::result::Result<RegisterBudget, InternalError> {
        RegisterBudget::new(self.register_count, self.reserved_registers.iter().copied())
    }
}

/// One unit after allocation and encoding
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: String,
    pub kind: UnitKind,
    pub span: Option<Span>,
    pub frame: FrameLayout,
    /// Allocated IR, spill traffic attached
    pub ir: Vec<IrInstruction>,
    pub cfg: ControlFlowGraph,
    /// Hardware records ready for the assembler
    pub records: Vec<EncodedItem>,
    pub allocation: Allocation,
}

impl CompiledUnit {
    /// Words the unit occupies once packed
    pub fn word_count(&self) -> usize {
        self.records.iter().map(EncodedItem::word_count).sum()
    }
}

/// Compilation result
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Units in declaration order
    pub units: Vec<CompiledUnit>,
    /// Globals, array storage, top-level spill slots and lifted constants
    pub data: DataTable,
    pub scopes: ScopeTree,
}

impl CompileResult {
    pub fn unit(&self, name: &str) -> Option<&CompiledUnit> {
        self.units.iter().find(|unit| unit.name == name)
    }
}

/// Typed program to hardware records
pub struct Compiler {
    options: CompileOptions,
    /// Source text used to render error excerpts
    source: Option<String>,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            source: None,
        }
    }

    /// Attach the program text so compile errors carry a source excerpt
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Lower every unit to virtual-register IR
    pub fn lower(&self, program: &Program) -> Result<Lowering> {
        lower_program(program).map_err(|err| self.attach_trace(err))
    }

    /// Lower, allocate and encode `program`
    pub fn compile(&self, program: &Program) -> Result<CompileResult> {
        // Budget problems surface before any lowering happens
        let budget = self.options.budget()?;
        if budget.is_degraded() {
            tracing::warn!(
                "register budget of {} with {} reserved leaves one allocatable slot; \
                 instructions reading two registers will share it",
                budget.registers(),
                budget.reserved().len()
            );
        }
        let Lowering { units, registry } = self.lower(program)?;
        tracing::debug!("lowered {} units", units.len());

        let compiled: Vec<(CompiledUnit, DataTable)> = if self.options.parallel {
            units
                .into_par_iter()
                .map(|unit| self.backend(unit, &budget))
                .collect::<Result<Vec<_>>>()?
        } else {
            units
                .into_iter()
                .map(|unit| self.backend(unit, &budget))
                .collect::<Result<Vec<_>>>()?
        };

        let mut data = registry.data;
        let mut units = Vec::with_capacity(compiled.len());
        for (unit, unit_data) in compiled {
            data.merge(unit_data);
            units.push(unit);
        }
        Ok(CompileResult {
            units,
            data,
            scopes: registry.scopes,
        })
    }

    /// Allocation and encoding of one unit. Touches nothing outside the
    /// unit; new data entries are returned for the caller to merge.
    fn backend(&self, mut unit: LoweredUnit, budget: &RegisterBudget) -> Result<(CompiledUnit, DataTable)> {
        desugar::expand_variables(&mut unit)?;
        mark_last_uses(&mut unit.code);
        let allocation = allocate(budget, &mut unit.code)?;

        let mut frame = FrameLayout::new(unit.kind, unit.name.as_str(), unit.locals);
        frame.spill_slots = allocation.spill_slots;
        if unit.kind == UnitKind::Function {
            frame.saved_registers = allocation.used_registers.iter().copied().collect();
        }
        desugar::expand_prelude(&mut unit.code, &frame);

        let mut data = DataTable::new();
        if unit.kind == UnitKind::TopLevel {
            for slot in 0..frame.spill_slots {
                data.insert(frame.spill_data(slot).name(), DataEntry::Zeroed(ir::SPILL_SLOT_SIZE));
            }
        }
        if self.options.lift_wide_immediates {
            let lifted = desugar::lift_wide_immediates(&mut unit.code, &unit.name, &mut data);
            if lifted > 0 {
                tracing::debug!("{}: lifted {} wide immediates", unit.name, lifted);
            }
        }
        // the epilogue and spill addressing are built by the encoder, after
        // lifting, and read these entries when they do not fit inline
        let frame_constants = desugar::lift_frame_constants(&frame, &mut data);
        if frame_constants > 0 {
            tracing::debug!("{}: {} frame constants moved to data", unit.name, frame_constants);
        }

        let records = encode_unit(&unit.code, &frame)?;
        let cfg = ControlFlowGraph::build(&unit.code);
        Ok((
            CompiledUnit {
                name: unit.name,
                kind: unit.kind,
                span: unit.span,
                frame,
                ir: unit.code,
                cfg,
                records,
                allocation,
            },
            data,
        ))
    }

    fn attach_trace(&self, err: Error) -> Error {
        match (err, &self.source) {
            (Error::Compile(mut err), Some(source)) => {
                if let Some(span) = &err.span {
                    err.trace = Some(diagnostics::render(source, span));
                }
                Error::Compile(err)
            }
            (err, _) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{Expr, Item, Stmt, Type, Width};

    fn program() -> Program {
        Program::new(vec![
            Item::var("g", Some(Type::uint(Width::W2)), Some(Expr::int(300))),
            Item::function(
                "main",
                vec![("x", Type::uint(Width::W2))],
                Type::uint(Width::W2),
                vec![Stmt::ret(Some(Expr::binary(
                    crate::syntax::BinaryOperator::Add,
                    Expr::name("x"),
                    Expr::name("g"),
                )))],
            ),
        ])
    }

    #[test]
    fn test_options_from_json_keep_defaults() {
        let options = CompileOptions::from_json(r#"{"register_count": 6}"#).unwrap();
        assert_eq!(options.register_count, 6);
        assert_eq!(options.reserved_registers, vec![0, 1, 2, 3]);
        assert!(options.lift_wide_immediates);
    }

    #[test]
    fn test_bad_budget_is_internal() {
        let options = CompileOptions {
            register_count: 4,
            ..CompileOptions::default()
        };
        let err = Compiler::new(options).compile(&program()).unwrap_err();
        assert!(err.is_internal());
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn test_compile_pipeline() {
        let result = Compiler::new(CompileOptions::default()).compile(&program()).unwrap();
        let names: Vec<_> = result.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["g#init0", "main"]);

        let main = result.unit("main").unwrap();
        assert!(main.word_count() > 0);
        assert!(!main.frame.saved_registers.is_empty());
        assert!(main
            .ir
            .iter()
            .all(|instr| instr.touched_registers().iter().all(|r| r.physical.is_some())));
        assert!(result.data.contains("g"));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let sequential = Compiler::new(CompileOptions::default()).compile(&program()).unwrap();
        let parallel = Compiler::new(CompileOptions {
            parallel: true,
            ..CompileOptions::default()
        })
        .compile(&program())
        .unwrap();
        let records = |r: &CompileResult| r.units.iter().map(|u| u.records.clone()).collect::<Vec<_>>();
        assert_eq!(records(&sequential), records(&parallel));
    }

    #[test]
    fn test_errors_carry_source_excerpt() {
        let source = "fn main() {\n  return y\n}";
        let program = Program::new(vec![Item::function(
            "main",
            vec![],
            Type::uint(Width::W1),
            vec![Stmt::ret(Some(Expr::name("y").at(Span::line(2, 10, 10))))],
        )]);
        let err = Compiler::new(CompileOptions::default())
            .with_source(source)
            .compile(&program)
            .unwrap_err();
        let report = err.report();
        assert!(report.contains("On line 2:"));
        assert!(report.contains("  2|   return y"));
    }
}
