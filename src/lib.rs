#![allow(clippy::new_without_default)]
#![allow(clippy::large_enum_variant)]
//! # vregc - Register VM Compiler Core
//!
//! The middle and back end of a compiler for a small typed systems language.
//! It takes an already parsed, typed program and produces, per function and
//! per top-level initialiser, a list of hardware instruction records for a
//! register virtual machine.
//!
//! ## Pipeline
//!
//! 1. **Resolution** ([`compiler::resolve`]): every unit is lowered to
//!    virtual-register IR. A unit that needs a name nobody declared yet is
//!    parked and retried once the name exists, so functions and globals may
//!    be used before their declaration.
//! 2. **Allocation** ([`compiler::regalloc`]): a single linear pass maps
//!    virtual registers onto a fixed register file, spilling to memory under
//!    pressure.
//! 3. **Encoding** ([`compiler::encoder`]): allocated IR becomes records of
//!    16-bit little-endian words.
//!
//! ## Quick Start
//!
//! ```rust
//! use vregc::compiler::{CompileOptions, Compiler};
//! use vregc::syntax::{Expr, Item, Program, Stmt, Type, Width};
//!
//! # fn main() -> vregc::Result<()> {
//! let program = Program::new(vec![
//!     Item::function("main", vec![], Type::uint(Width::W1), vec![
//!         Stmt::ret(Some(Expr::name("answer"))),
//!     ]),
//!     Item::var("answer", None, Some(Expr::int(42))),
//! ]);
//!
//! let result = Compiler::new(CompileOptions::default()).compile(&program)?;
//! assert_eq!(result.units.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! [`Error::Compile`] means the program is wrong and carries the offending
//! source span; [`Error::Internal`] means the compiler is wrong. Drivers can
//! tell them apart with [`Error::exit_code`].

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod syntax;

pub use compiler::{CompileOptions, CompileResult, Compiler};
pub use error::{CompileError, CompileErrorKind, Error, InternalError, Result};
