//! Error types for the vregc compiler
//!
//! Two families exist. [`CompileError`] is a problem in the input program and is
//! reported to the user with its source location. [`InternalError`] is a bug in
//! the compiler itself (an instruction without an encoder, an operand that was
//! never allocated, ...) and aborts with a distinct exit status.

use crate::syntax::Span;
use std::fmt;
use thiserror::Error;

/// Category of a user-facing compile error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileErrorKind {
    /// Reference to a name that is never declared
    ///
    /// **Triggered by:** a lookup still pending once every unit has been given
    /// the chance to declare it
    /// **Example:** `return y;` where no `y` exists in any enclosing scope
    UndefinedName,

    /// Redeclaration of a name with a different type
    ///
    /// **Example:** `var a: u4; var a: s1;` at the same level
    ConflictingDeclaration,

    /// Assignment to something that has no storage location
    ///
    /// **Example:** `1 = 2`, or writing to an element of an array literal
    NotAnLvalue,

    /// Operands or values whose types are incompatible
    ///
    /// **Example:** negating an unsigned value, calling a non-function
    TypeMismatch,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompileErrorKind::UndefinedName => "undefined name",
            CompileErrorKind::ConflictingDeclaration => "conflicting declaration",
            CompileErrorKind::NotAnLvalue => "not an lvalue",
            CompileErrorKind::TypeMismatch => "type mismatch",
        };
        f.write_str(name)
    }
}

/// Error in the program being compiled
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {reason}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Human readable explanation
    pub reason: String,
    /// Location of the offending node, if it has one
    pub span: Option<Span>,
    /// Rendered source excerpt with carets under `span`
    pub trace: Option<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, reason: impl Into<String>, span: Option<Span>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            span,
            trace: None,
        }
    }

    /// Full report: the message followed by the source excerpt when available
    pub fn report(&self) -> String {
        match &self.trace {
            Some(trace) => format!("{}\n{}", self, trace),
            None => self.to_string(),
        }
    }
}

/// Compiler bug. Never caused by a well-formed or malformed input alone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InternalError {
    /// An IR instruction reached the encoder without an encoding rule
    ///
    /// **Triggered by:** a pseudo-instruction surviving the desugar passes
    #[error("missing encoder for instruction {name}")]
    UnmappedInstruction {
        /// Instruction kind
        name: String,
    },

    /// A mnemonic that is not in the opcode table
    #[error("could not find instruction by name: {name}")]
    UnknownOpcode {
        /// Requested mnemonic
        name: String,
    },

    /// Register budget leaves nothing to allocate
    #[error("register budget of {registers} leaves no allocatable register beside {reserved} reserved")]
    RegisterBudget {
        /// Size of the register file
        registers: u8,
        /// Number of reserved slots
        reserved: usize,
    },

    /// One instruction touches more distinct registers than the budget can
    /// hold at once
    #[error("instruction {instruction} needs more registers than the {allocatable} allocatable")]
    RegisterPressure {
        /// Index of the instruction in its unit
        instruction: usize,
        /// Allocatable slots in the budget
        allocatable: usize,
    },

    /// An operand had no concrete encoding (unallocated register, unknown symbol)
    #[error("unresolved operand: {0}")]
    UnresolvedOperand(String),

    /// Immediate outside the 14-bit operand payload
    #[error("immediate {value} does not fit in a 14-bit operand")]
    ImmediateOutOfRange {
        /// Offending value
        value: i64,
    },

    /// Any other broken invariant
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

/// Crate-wide error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Problem in the input program
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Compiler bug
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The input must be fixed
    User,
    /// The compiler must be fixed
    Fatal,
}

impl Error {
    /// Shorthand for a compile error without location
    pub fn compile(kind: CompileErrorKind, reason: impl Into<String>) -> Self {
        Error::Compile(CompileError::new(kind, reason, None))
    }

    /// Shorthand for an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Internal(InternalError::Invariant(msg.into()))
    }

    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::Compile(_) => ErrorSeverity::User,
            Error::Internal(_) => ErrorSeverity::Fatal,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.classify() == ErrorSeverity::Fatal
    }

    /// Process exit status for a driver: 1 for user errors, 70 (`EX_SOFTWARE`)
    /// for compiler bugs.
    pub fn exit_code(&self) -> i32 {
        match self.classify() {
            ErrorSeverity::User => 1,
            ErrorSeverity::Fatal => 70,
        }
    }

    /// Kind of a user error, `None` for internal ones
    pub fn compile_kind(&self) -> Option<CompileErrorKind> {
        match self {
            Error::Compile(err) => Some(err.kind),
            Error::Internal(_) => None,
        }
    }

    /// Message including the rendered source excerpt when available
    pub fn report(&self) -> String {
        match self {
            Error::Compile(err) => err.report(),
            Error::Internal(err) => format!("internal compiler error: {}", err),
        }
    }
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let user = Error::compile(CompileErrorKind::NotAnLvalue, "nope");
        assert_eq!(user.exit_code(), 1);
        assert!(!user.is_internal());

        let bug: Error = InternalError::UnknownOpcode {
            name: "frob".into(),
        }
        .into();
        assert_eq!(bug.exit_code(), 70);
        assert!(bug.is_internal());
        assert_eq!(bug.compile_kind(), None);
    }

    #[test]
    fn test_report_includes_trace() {
        let mut err = CompileError::new(
            CompileErrorKind::UndefinedName,
            "y is not declared",
            Some(Span::line(1, 1, 1)),
        );
        assert_eq!(err.report(), "undefined name: y is not declared");
        err.trace = Some("On line 1:\n  1| y".into());
        assert!(err.report().ends_with("  1| y"));
    }
}
