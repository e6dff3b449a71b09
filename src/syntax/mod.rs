//! Input syntax tree
//!
//! The compiler consumes an already parsed program. Nodes are plain data with
//! optional source spans, built by a front end or directly by tests.

pub mod ast;
pub mod span;
pub mod types;

pub use ast::*;
pub use span::Span;
pub use types::{FunctionType, IntType, Type, Width, POINTER_WIDTH};
