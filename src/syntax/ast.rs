//! Syntax tree handed to the compiler by the front end
//!
//! Every node carries an optional [`Span`]; diagnostics fall back to the
//! nearest enclosing node that has one.

use super::span::Span;
use super::types::{Type, Width};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dotted name such as `x` or `math.pi`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    pub segments: Vec<String>,
}

impl Path {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `a.b.c` into its segments
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.'))
    }

    pub fn is_qualified(&self) -> bool {
        self.segments.len() > 1
    }

    /// Last segment: the variable name itself
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    /// `~`
    BitNot,
    /// `!`
    Not,
    /// `-`
    Neg,
    /// `+`
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncrementOperator {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOperator {
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinaryOperator::Lt
                | BinaryOperator::Le
                | BinaryOperator::Gt
                | BinaryOperator::Ge
                | BinaryOperator::Eq
                | BinaryOperator::Ne
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Shl => "<<",
            BinaryOperator::Shr => ">>",
            BinaryOperator::BitAnd => "&",
            BinaryOperator::BitOr => "|",
            BinaryOperator::BitXor => "^",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    /// Value conversion: resizes with sign or zero extension
    Convert,
    /// Reinterpret the bits at the target width without extension
    Reinterpret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer literal, optionally with an explicit type annotation
    Int { value: i64, ty: Option<Type> },
    Name(Path),
    /// `{a, b, c}`
    Array(Vec<Expr>),
    Unary {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    AddressOf(Box<Expr>),
    Deref(Box<Expr>),
    Increment {
        op: IncrementOperator,
        prefix: bool,
        expr: Box<Expr>,
    },
    Cast {
        kind: CastKind,
        ty: Type,
        expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Binary {
        op: BinaryOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOperator,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self { kind, span: None }
    }

    /// Attach a source span
    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn int(value: i64) -> Self {
        Self::new(ExprKind::Int { value, ty: None })
    }

    pub fn typed_int(value: i64, ty: Type) -> Self {
        Self::new(ExprKind::Int {
            value,
            ty: Some(ty),
        })
    }

    pub fn name(dotted: &str) -> Self {
        Self::new(ExprKind::Name(Path::parse(dotted)))
    }

    pub fn array(elems: Vec<Expr>) -> Self {
        Self::new(ExprKind::Array(elems))
    }

    pub fn unary(op: UnaryOperator, expr: Expr) -> Self {
        Self::new(ExprKind::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    pub fn address_of(expr: Expr) -> Self {
        Self::new(ExprKind::AddressOf(Box::new(expr)))
    }

    pub fn deref(expr: Expr) -> Self {
        Self::new(ExprKind::Deref(Box::new(expr)))
    }

    pub fn increment(op: IncrementOperator, prefix: bool, expr: Expr) -> Self {
        Self::new(ExprKind::Increment {
            op,
            prefix,
            expr: Box::new(expr),
        })
    }

    pub fn cast(kind: CastKind, ty: Type, expr: Expr) -> Self {
        Self::new(ExprKind::Cast {
            kind,
            ty,
            expr: Box::new(expr),
        })
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Self::new(ExprKind::Call {
            callee: Box::new(callee),
            args,
        })
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        Self::new(ExprKind::Index {
            base: Box::new(base),
            index: Box::new(index),
        })
    }

    pub fn binary(op: BinaryOperator, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn logical(op: LogicalOperator, lhs: Expr, rhs: Expr) -> Self {
        Self::new(ExprKind::Logical {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::new(ExprKind::Assign {
            target: Box::new(target),
            value: Box::new(value),
        })
    }
}

/// `var name: ty := init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: Option<Type>,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Option<Span>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts, span: None }
    }
}

/// Where an inline assembly operand comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsmSource {
    /// A physical register named directly
    Register(u8),
    Immediate(i64),
    /// The value of the n-th expression listed in the asm block header
    Expr(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsmParam {
    pub source: AsmSource,
    pub width: Width,
    /// Access memory at the operand rather than the operand itself
    pub deref: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsmLine {
    pub mnemonic: String,
    pub width: Width,
    pub params: Vec<AsmParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsmBlock {
    pub exprs: Vec<Expr>,
    pub lines: Vec<AsmLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    Var(VarDecl),
    Expr(Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then: Block,
        otherwise: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    Block(Block),
    Asm(AsmBlock),
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self { kind, span: None }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn var(name: &str, ty: Option<Type>, init: Option<Expr>) -> Self {
        Self::new(StmtKind::Var(VarDecl {
            name: name.to_string(),
            ty,
            init,
        }))
    }

    pub fn expr(expr: Expr) -> Self {
        Self::new(StmtKind::Expr(expr))
    }

    pub fn ret(expr: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(expr))
    }

    pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Option<Vec<Stmt>>) -> Self {
        Self::new(StmtKind::If {
            cond,
            then: Block::new(then),
            otherwise: otherwise.map(Block::new),
        })
    }

    pub fn while_loop(cond: Expr, body: Vec<Stmt>) -> Self {
        Self::new(StmtKind::While {
            cond,
            body: Block::new(body),
        })
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::new(StmtKind::Block(Block::new(stmts)))
    }

    pub fn asm(exprs: Vec<Expr>, lines: Vec<AsmLine>) -> Self {
        Self::new(StmtKind::Asm(AsmBlock { exprs, lines }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub returns: Type,
    pub varargs: bool,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    pub span: Option<Span>,
}

/// Top-level declaration. Each function and each variable becomes its own
/// compilation unit; modules only introduce a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemKind {
    Function(FunctionDecl),
    Var(VarDecl),
    Module { name: String, items: Vec<Item> },
}

impl Item {
    pub fn new(kind: ItemKind) -> Self {
        Self { kind, span: None }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn var(name: &str, ty: Option<Type>, init: Option<Expr>) -> Self {
        Self::new(ItemKind::Var(VarDecl {
            name: name.to_string(),
            ty,
            init,
        }))
    }

    pub fn function(name: &str, params: Vec<(&str, Type)>, returns: Type, body: Vec<Stmt>) -> Self {
        Self::new(ItemKind::Function(FunctionDecl {
            name: name.to_string(),
            params: params
                .into_iter()
                .map(|(name, ty)| Param {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
            returns,
            varargs: false,
            body: Block::new(body),
        }))
    }

    pub fn module(name: &str, items: Vec<Item>) -> Self {
        Self::new(ItemKind::Module {
            name: name.to_string(),
            items,
        })
    }

    /// Mark a function item as accepting extra arguments through `var_args`
    pub fn with_varargs(mut self) -> Self {
        if let ItemKind::Function(decl) = &mut self.kind {
            decl.varargs = true;
        }
        self
    }
}

/// A whole input file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn new(items: Vec<Item>) -> Self {
        Self { items }
    }
}
