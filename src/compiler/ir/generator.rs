//! Lowering of declarations, statements and expressions to IR
//!
//! Every `lower_*` method appends instructions to the context and returns the
//! register holding the result. `type_of` computes the static type of an
//! expression without emitting anything; both may suspend on a missing name.

use super::context::{CompileContext, LowerResult, Registry};
use super::instruction::{BinaryOp, CompareKind, IrOp, UnaryOp};
use super::operand::{
    AllocatedRegister, DerefTarget, Dereference, Immediate, Operand, VirtualRegister,
};
use super::program::{LoweredUnit, UnitKind};
use crate::compiler::scope::{ScopeId, Variable};
use crate::error::CompileErrorKind::{NotAnLvalue, TypeMismatch};
use crate::error::InternalError;
use crate::syntax::{
    AsmBlock, AsmParam, AsmSource, BinaryOperator, Block, CastKind, Expr, ExprKind,
    FunctionDecl, FunctionType, IncrementOperator, IntType, LogicalOperator, Span, Stmt,
    StmtKind, Type, UnaryOperator, VarDecl, Width, POINTER_WIDTH,
};

/// Narrowest integer type holding `value`: unsigned for non-negative values,
/// signed otherwise.
pub fn literal_type(value: i64) -> Type {
    let width = if value >= 0 {
        Width::ALL
            .into_iter()
            .find(|w| w.bits() >= 64 || value < (1i64 << w.bits()))
            .unwrap_or(Width::W8)
    } else {
        Width::ALL
            .into_iter()
            .find(|w| w.bits() >= 64 || value >= -(1i64 << (w.bits() - 1)))
            .unwrap_or(Width::W8)
    };
    if value < 0 {
        Type::sint(width)
    } else {
        Type::uint(width)
    }
}

/// Result type of `lhs op rhs`, `None` if the operand types do not combine
pub fn binary_result_type(op: BinaryOperator, lhs: &Type, rhs: &Type) -> Option<Type> {
    use BinaryOperator::*;

    let ints = match (lhs, rhs) {
        (Type::Int(a), Type::Int(b)) => Some((a.width.max(b.width), a.signed, b.signed)),
        _ => None,
    };
    let int = |width: Width, signed: bool| {
        Type::Int(IntType {
            signed,
            width,
            constant: false,
        })
    };

    match op {
        Add | Sub => match ints {
            Some((width, ls, rs)) => Some(int(width, ls || rs)),
            None if lhs.is_pointer_like() && rhs.is_int() => Some(lhs.decayed()),
            None if op == Add && lhs.is_int() && rhs.is_pointer_like() => Some(rhs.decayed()),
            None if op == Sub && lhs.is_pointer_like() && rhs.is_pointer_like() => {
                Some(Type::uint(POINTER_WIDTH))
            }
            None => None,
        },
        Mul | Div | Mod | BitAnd | BitOr | BitXor => {
            ints.map(|(width, ls, rs)| int(width, ls || rs))
        }
        Shl => ints.map(|(width, _, _)| int(width, false)),
        Shr => ints.map(|(width, ls, _)| int(width, ls)),
        Lt | Le | Gt | Ge | Eq | Ne => {
            let comparable =
                ints.is_some() || (lhs.is_pointer_like() && rhs.is_pointer_like());
            comparable.then(|| Type::uint(Width::W1))
        }
    }
}

fn compare_kind(op: BinaryOperator, signed: bool) -> CompareKind {
    match (op, signed) {
        (BinaryOperator::Lt, false) => CompareKind::Lt,
        (BinaryOperator::Lt, true) => CompareKind::LtSigned,
        (BinaryOperator::Le, false) => CompareKind::Le,
        (BinaryOperator::Le, true) => CompareKind::LeSigned,
        (BinaryOperator::Gt, false) => CompareKind::Gt,
        (BinaryOperator::Gt, true) => CompareKind::GtSigned,
        (BinaryOperator::Ge, false) => CompareKind::Ge,
        (BinaryOperator::Ge, true) => CompareKind::GeSigned,
        (BinaryOperator::Ne, _) => CompareKind::Ne,
        _ => CompareKind::Eq,
    }
}

/// Walk the left spine of a binary chain: returns the leftmost leaf and the
/// `(op, rhs, span)` steps in evaluation order.
fn binary_spine(expr: &Expr) -> (&Expr, Vec<(BinaryOperator, &Expr, Option<Span>)>) {
    let mut steps = Vec::new();
    let mut leaf = expr;
    while let ExprKind::Binary { op, lhs, rhs } = &leaf.kind {
        steps.push((*op, rhs.as_ref(), leaf.span));
        leaf = lhs;
    }
    steps.reverse();
    (leaf, steps)
}

/// Lower a function declaration into its own unit named `unit`
pub fn lower_function(
    registry: &mut Registry,
    module: ScopeId,
    unit: &str,
    decl: &FunctionDecl,
    span: Option<Span>,
) -> LowerResult<LoweredUnit> {
    let mut ctx = CompileContext::new(registry, module, unit, UnitKind::Function);
    let previous = ctx.enter_origin(span);

    for param in &decl.params {
        if param.ty.width().is_none() {
            return Err(ctx.error(
                TypeMismatch,
                format!("parameter {} cannot have type {}", param.name, param.ty),
                span,
            ));
        }
    }
    if matches!(decl.returns, Type::Array { .. }) {
        return Err(ctx.error(TypeMismatch, "functions cannot return arrays", span));
    }

    let signature = FunctionType {
        returns: decl.returns.clone(),
        params: decl.params.iter().map(|p| p.ty.clone()).collect(),
        varargs: decl.varargs,
    };
    // the function is visible to others (and itself) before its body compiles
    ctx.declare(&decl.name, &Type::Function(Box::new(signature.clone())), true, span)?;

    // arguments sit below the saved frame base and return address
    let mut offset = -2 * POINTER_WIDTH.bytes() as i32;
    for param in &decl.params {
        offset -= param.ty.size() as i32;
        ctx.declare_param(&param.name, &param.ty, offset, false)?;
    }
    if decl.varargs {
        ctx.declare_param("var_args", &Type::pointer(Type::Void), offset, true)?;
    }

    ctx.function = Some(signature);
    ctx.emit(IrOp::Prelude);
    ctx.lower_block(&decl.body)?;
    if decl.returns == Type::Void {
        ctx.emit(IrOp::Return { arg: None });
    }
    ctx.restore_origin(previous);
    Ok(ctx.finish(unit.to_string(), span))
}

/// Lower a top-level variable declaration and its initialiser
pub fn lower_global(
    registry: &mut Registry,
    module: ScopeId,
    unit: &str,
    decl: &VarDecl,
    span: Option<Span>,
) -> LowerResult<LoweredUnit> {
    let mut ctx = CompileContext::new(registry, module, unit, UnitKind::TopLevel);
    let previous = ctx.enter_origin(span);
    ctx.lower_var_decl(decl, span)?;
    ctx.restore_origin(previous);
    Ok(ctx.finish(unit.to_string(), span))
}

impl CompileContext<'_> {
    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    pub fn lower_block(&mut self, block: &Block) -> LowerResult<()> {
        let previous = self.enter_origin(block.span);
        self.push_scope();
        for stmt in &block.stmts {
            self.lower_stmt(stmt)?;
        }
        self.pop_scope();
        self.restore_origin(previous);
        Ok(())
    }

    pub fn lower_stmt(&mut self, stmt: &Stmt) -> LowerResult<()> {
        let previous = self.enter_origin(stmt.span);
        match &stmt.kind {
            StmtKind::Var(decl) => self.lower_var_decl(decl, stmt.span)?,
            StmtKind::Expr(expr) => match &expr.kind {
                ExprKind::Call { callee, args } => {
                    let outer = self.enter_origin(expr.span);
                    self.lower_call(callee, args)?;
                    self.restore_origin(outer);
                }
                _ => {
                    self.lower_expr(expr)?;
                }
            },
            StmtKind::Return(expr) => self.lower_return(expr.as_ref(), stmt.span)?,
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.lower_expr(cond)?;
                let then_target = self.new_target();
                let end_target = self.new_target();
                self.emit(IrOp::Jump {
                    target: then_target,
                    condition: Some(cond.into()),
                });
                if let Some(otherwise) = otherwise {
                    self.lower_block(otherwise)?;
                }
                self.emit(IrOp::Jump {
                    target: end_target,
                    condition: None,
                });
                self.emit(IrOp::Target(then_target));
                self.lower_block(then)?;
                self.emit(IrOp::Target(end_target));
            }
            StmtKind::While { cond, body } => {
                let test = self.new_target();
                let cont = self.new_target();
                let end = self.new_target();
                self.emit(IrOp::Target(test));
                let cond = self.lower_expr(cond)?;
                self.emit(IrOp::Jump {
                    target: cont,
                    condition: Some(cond.into()),
                });
                self.emit(IrOp::Jump {
                    target: end,
                    condition: None,
                });
                self.emit(IrOp::Target(cont));
                self.lower_block(body)?;
                self.emit(IrOp::Jump {
                    target: test,
                    condition: None,
                });
                self.emit(IrOp::Target(end));
            }
            StmtKind::Block(block) => self.lower_block(block)?,
            StmtKind::Asm(asm) => self.lower_asm(asm)?,
        }
        self.restore_origin(previous);
        Ok(())
    }

    pub fn lower_var_decl(&mut self, decl: &VarDecl, span: Option<Span>) -> LowerResult<()> {
        let declared = match (&decl.ty, &decl.init) {
            (Some(ty), _) => ty.clone(),
            (None, Some(init)) => self.type_of(init)?,
            (None, None) => {
                return Err(self.error(
                    TypeMismatch,
                    format!("variable {} has neither a type nor an initialiser", decl.name),
                    span,
                ))
            }
        };

        let Some(init) = &decl.init else {
            self.declare(&decl.name, &declared, false, span)?;
            return Ok(());
        };

        if let (ExprKind::Array(elems), Type::Array { .. }) = (&init.kind, &declared) {
            let ty = self.array_literal_type(elems, init.span, Some(&declared))?;
            let var = self.declare(&decl.name, &ty, true, span)?;
            self.lower_array(elems, &ty, Some(var), init.span)?;
            return Ok(());
        }

        let value_ty = self.type_of(init)?;
        if !value_ty.implicitly_casts_to(&declared) {
            return Err(self.error(
                TypeMismatch,
                format!(
                    "variable {} is declared as {} but initialised with {}",
                    decl.name, declared, value_ty
                ),
                init.span,
            ));
        }
        let Some(width) = declared.width() else {
            return Err(self.error(
                TypeMismatch,
                format!("cannot initialise a value of type {}", declared),
                span,
            ));
        };

        let (var, value) = match (&init.kind, &declared) {
            (ExprKind::Array(elems), Type::Pointer { constant, .. }) => {
                let ty = self.array_literal_type(elems, init.span, Some(&declared))?;
                // the pointer keeps the literal's read-only element type
                let pointer = Type::Pointer {
                    to: Box::new(ty.element().unwrap_or(Type::Void)),
                    constant: *constant,
                };
                let var = self.declare(&decl.name, &pointer, false, span)?;
                (var, self.lower_array(elems, &ty, None, init.span)?)
            }
            _ => {
                let var = self.declare(&decl.name, &declared, false, span)?;
                (var, self.lower_expr(init)?)
            }
        };
        let value = self.resize(value, width, declared.signed());
        self.emit(IrOp::SaveVar {
            variable: var,
            from: value.into(),
        });
        Ok(())
    }

    fn lower_return(&mut self, expr: Option<&Expr>, span: Option<Span>) -> LowerResult<()> {
        let Some(returns) = self.function.as_ref().map(|f| f.returns.clone()) else {
            return Err(self.error(TypeMismatch, "return outside of a function", span));
        };
        match (expr, &returns) {
            (None, Type::Void) => self.emit(IrOp::Return { arg: None }),
            (None, _) => {
                return Err(self.error(
                    TypeMismatch,
                    format!("function returning {} must return a value", returns),
                    span,
                ))
            }
            (Some(_), Type::Void) => {
                return Err(self.error(TypeMismatch, "void function cannot return a value", span))
            }
            (Some(expr), _) => {
                let ty = self.type_of(expr)?;
                if !ty.implicitly_casts_to(&returns) {
                    return Err(self.error(
                        TypeMismatch,
                        format!("returned value of type {} does not match {}", ty, returns),
                        expr.span,
                    ));
                }
                let width = returns.width().unwrap_or(POINTER_WIDTH);
                let value = self.lower_expr(expr)?;
                let value = self.resize(value, width, returns.signed());
                self.emit(IrOp::Return {
                    arg: Some(value.into()),
                });
            }
        }
        Ok(())
    }

    fn lower_asm(&mut self, asm: &AsmBlock) -> LowerResult<()> {
        let mut registers = Vec::with_capacity(asm.exprs.len());
        for expr in &asm.exprs {
            registers.push(self.lower_expr(expr)?);
        }
        for line in &asm.lines {
            let args = line
                .params
                .iter()
                .map(|param| self.asm_operand(param, &registers))
                .collect::<LowerResult<Vec<_>>>()?;
            self.emit(IrOp::Machine {
                mnemonic: line.mnemonic.clone(),
                width: line.width,
                args,
            });
        }
        Ok(())
    }

    fn asm_operand(&self, param: &AsmParam, registers: &[VirtualRegister]) -> LowerResult<Operand> {
        let target = match param.source {
            AsmSource::Register(index) => {
                DerefTarget::Allocated(AllocatedRegister::new(index, param.width))
            }
            AsmSource::Immediate(value) => {
                DerefTarget::Immediate(Immediate::new(value, param.width))
            }
            AsmSource::Expr(index) => match registers.get(index) {
                Some(reg) => DerefTarget::Register(*reg),
                None => {
                    return Err(self.error(
                        TypeMismatch,
                        format!(
                            "asm operand refers to expression {} but only {} were given",
                            index,
                            registers.len()
                        ),
                        None,
                    ))
                }
            },
        };
        if param.deref {
            return Ok(Operand::Dereference(Dereference {
                target,
                width: param.width,
            }));
        }
        Ok(match target {
            DerefTarget::Register(reg) => Operand::Register(reg),
            DerefTarget::Allocated(reg) => Operand::Allocated(reg),
            DerefTarget::Immediate(imm) => Operand::Immediate(imm),
            DerefTarget::Data(data) => Operand::Data(data),
        })
    }

    // ---------------------------------------------------------------
    // Types
    // ---------------------------------------------------------------

    /// Static type of `expr`
    pub fn type_of(&self, expr: &Expr) -> LowerResult<Type> {
        match &expr.kind {
            ExprKind::Int { value, ty } => Ok(ty.clone().unwrap_or_else(|| literal_type(*value))),
            ExprKind::Name(path) => Ok(self.lookup(path, expr.span)?.ty),
            ExprKind::Array(elems) => self.array_literal_type(elems, expr.span, None),
            ExprKind::Unary { expr: inner, .. } | ExprKind::Increment { expr: inner, .. } => {
                self.type_of(inner)
            }
            ExprKind::AddressOf(inner) => Ok(Type::pointer(self.type_of(inner)?)),
            ExprKind::Deref(inner) | ExprKind::Index { base: inner, .. } => {
                let ty = self.type_of(inner)?;
                match ty.element() {
                    Some(to) => Ok(to),
                    None => Err(self.error(
                        TypeMismatch,
                        format!("value of type {} is not a pointer or array", ty),
                        expr.span,
                    )),
                }
            }
            ExprKind::Cast { ty, expr: inner, .. } => {
                // a cast never strips const from the storage it points at
                let source = self.type_of(inner)?;
                let read_only = source.element().is_some_and(|elem| elem.is_const());
                Ok(match ty {
                    Type::Pointer { to, constant } if read_only => Type::Pointer {
                        to: Box::new(to.as_const()),
                        constant: *constant,
                    },
                    _ => ty.clone(),
                })
            }
            ExprKind::Call { callee, .. } => match self.type_of(callee)? {
                Type::Function(func) => Ok(func.returns),
                other => Err(self.error(
                    TypeMismatch,
                    format!("called object of type {} is not a function", other),
                    expr.span,
                )),
            },
            ExprKind::Binary { .. } => {
                let (leaf, steps) = binary_spine(expr);
                let mut ty = self.type_of(leaf)?;
                for (op, rhs, span) in steps {
                    let rhs_ty = self.type_of(rhs)?;
                    ty = self.combine(op, &ty, &rhs_ty, span)?;
                }
                Ok(ty)
            }
            ExprKind::Logical { .. } => Ok(Type::uint(Width::W1)),
            ExprKind::Assign { target, .. } => self.type_of(target),
        }
    }

    fn combine(&self, op: BinaryOperator, lhs: &Type, rhs: &Type, span: Option<Span>) -> LowerResult<Type> {
        binary_result_type(op, lhs, rhs).ok_or_else(|| {
            self.error(
                TypeMismatch,
                format!("incompatible types for binary {}: {} and {}", op.symbol(), lhs, rhs),
                span,
            )
        })
    }

    /// Type of an array literal, completed by the declared type if any.
    ///
    /// The result is always a const array with a known length: literal
    /// storage is immutable.
    pub fn array_literal_type(&self, elems: &[Expr], span: Option<Span>, declared: Option<&Type>) -> LowerResult<Type> {
        let Some(first) = elems.first() else {
            return Err(self.error(TypeMismatch, "empty array literal has no type", span));
        };
        let first = self.type_of(first)?;
        let count = elems.len() as u32;
        let literal = match declared {
            None => Type::Array {
                elem: Box::new(first),
                len: Some(count),
                constant: true,
            },
            Some(Type::Array { elem, len, .. }) => {
                let len = len.unwrap_or(count);
                if count > len {
                    return Err(self.error(
                        TypeMismatch,
                        format!("array literal has {} elements but its type allows {}", count, len),
                        span,
                    ));
                }
                let elem = match (elem.as_ref(), &first) {
                    (
                        Type::Array {
                            elem: inner,
                            len: None,
                            constant,
                        },
                        Type::Array { len: Some(n), .. },
                    ) => Type::Array {
                        elem: inner.clone(),
                        len: Some(*n),
                        constant: *constant,
                    },
                    (elem, _) => elem.clone(),
                };
                Type::Array {
                    elem: Box::new(elem),
                    len: Some(len),
                    constant: true,
                }
            }
            Some(Type::Pointer { to, .. }) => Type::Array {
                elem: to.clone(),
                len: Some(count),
                constant: true,
            },
            Some(other) => {
                return Err(self.error(
                    TypeMismatch,
                    format!("array literal cannot initialise a value of type {}", other),
                    span,
                ))
            }
        };
        Ok(literal.deep_const())
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    /// Lower `expr` to a register holding its value
    pub fn lower_expr(&mut self, expr: &Expr) -> LowerResult<VirtualRegister> {
        let previous = self.enter_origin(expr.span);
        let reg = match &expr.kind {
            ExprKind::Int { value, ty } => {
                let (width, signed) = match ty {
                    None => {
                        let ty = literal_type(*value);
                        (ty.width().unwrap_or(Width::W8), ty.signed())
                    }
                    Some(ty @ Type::Int(int)) => (int.width, ty.signed()),
                    Some(other) => {
                        return Err(self.error(
                            TypeMismatch,
                            format!("integer literal cannot have type {}", other),
                            expr.span,
                        ))
                    }
                };
                let reg = self.new_register(width, signed);
                self.emit(IrOp::mov(reg, Operand::imm(*value, width)));
                reg
            }
            ExprKind::Name(path) => {
                let var = self.lookup(path, expr.span)?;
                self.load_variable(var, expr.span)?
            }
            ExprKind::Array(elems) => {
                let ty = self.array_literal_type(elems, expr.span, None)?;
                self.lower_array(elems, &ty, None, expr.span)?
            }
            ExprKind::Unary { op, expr: inner } => {
                let ty = self.type_of(inner)?;
                let reg = self.lower_expr(inner)?;
                if !ty.signed() {
                    match op {
                        UnaryOperator::Plus => {
                            self.restore_origin(previous);
                            return Ok(reg);
                        }
                        UnaryOperator::Neg => {
                            return Err(self.error(
                                TypeMismatch,
                                format!("unary negate has no meaning on unsigned type {}", ty),
                                expr.span,
                            ))
                        }
                        _ => {}
                    }
                }
                let op = match op {
                    UnaryOperator::BitNot => UnaryOp::BitInvert,
                    UnaryOperator::Not => UnaryOp::LogicalInvert,
                    UnaryOperator::Neg => UnaryOp::Negate,
                    UnaryOperator::Plus => UnaryOp::Positive,
                };
                self.emit(IrOp::unary(op, reg));
                reg
            }
            ExprKind::AddressOf(inner) => self.lower_lvalue(inner)?,
            ExprKind::Deref(inner) => {
                let ty = self.type_of(expr)?;
                let ptr = self.lower_pointer(inner)?;
                self.load_through(ptr, &ty, expr.span)?
            }
            ExprKind::Increment {
                op,
                prefix,
                expr: inner,
            } => self.lower_increment(*op, *prefix, inner)?,
            ExprKind::Cast {
                kind,
                ty,
                expr: inner,
            } => {
                let source = self.type_of(inner)?;
                if !source.casts_to(ty) {
                    return Err(self.error(
                        TypeMismatch,
                        format!("cannot cast {} to {}", source, ty),
                        expr.span,
                    ));
                }
                let Some(width) = ty.width() else {
                    return Err(self.error(
                        TypeMismatch,
                        format!("cannot cast to non-scalar type {}", ty),
                        expr.span,
                    ));
                };
                let reg = self.lower_expr(inner)?;
                match kind {
                    CastKind::Convert => self.resize(reg, width, ty.signed()),
                    CastKind::Reinterpret => reg.reinterpret(width).with_sign(ty.signed()),
                }
            }
            ExprKind::Call { callee, args } => match self.lower_call(callee, args)? {
                Some(reg) => reg,
                None => {
                    return Err(self.error(
                        TypeMismatch,
                        "call to a void function used as a value",
                        expr.span,
                    ))
                }
            },
            ExprKind::Index { base, index } => {
                let ty = self.type_of(expr)?;
                let ptr = self.element_address(base, index, expr.span)?;
                self.load_through(ptr, &ty, expr.span)?
            }
            ExprKind::Binary { .. } => self.lower_binary(expr)?,
            ExprKind::Logical { op, lhs, rhs } => self.lower_logical(*op, lhs, rhs)?,
            ExprKind::Assign { target, value } => self.lower_assign(target, value)?,
        };
        self.restore_origin(previous);
        Ok(reg)
    }

    /// Address of the storage `expr` denotes
    pub fn lower_lvalue(&mut self, expr: &Expr) -> LowerResult<VirtualRegister> {
        let previous = self.enter_origin(expr.span);
        let reg = match &expr.kind {
            ExprKind::Name(path) => {
                let var = self.lookup(path, expr.span)?;
                if var.decays() {
                    return Err(self.error(
                        NotAnLvalue,
                        format!("{} has no lvalue: its address is its value", var.name),
                        expr.span,
                    ));
                }
                let reg = self.new_register(POINTER_WIDTH, false);
                self.emit(IrOp::LoadVar {
                    variable: var,
                    to: reg.into(),
                    lvalue: true,
                });
                reg
            }
            ExprKind::Deref(inner) => {
                if self.type_of(expr)?.is_const() {
                    return Err(self.error(
                        NotAnLvalue,
                        "pointer refers to immutable storage",
                        expr.span,
                    ));
                }
                self.lower_pointer(inner)?
            }
            ExprKind::Index { base, index } => {
                let base_ty = self.type_of(base)?;
                let literal = matches!(base_ty, Type::Array { constant: true, .. });
                if literal || self.type_of(expr)?.is_const() {
                    return Err(self.error(
                        NotAnLvalue,
                        "elements of an array literal are immutable",
                        expr.span,
                    ));
                }
                self.element_address(base, index, expr.span)?
            }
            ExprKind::Increment {
                prefix: true,
                expr: inner,
                ..
            }
            | ExprKind::Cast { expr: inner, .. } => self.lower_lvalue(inner)?,
            _ => {
                return Err(self.error(
                    NotAnLvalue,
                    "expression has no storage location",
                    expr.span,
                ))
            }
        };
        self.restore_origin(previous);
        Ok(reg)
    }

    /// Same register when the width already matches, otherwise a fresh one
    /// filled by a `Resize`
    pub fn resize(&mut self, reg: VirtualRegister, width: Width, signed: bool) -> VirtualRegister {
        if reg.width == width {
            return reg.with_sign(signed);
        }
        let resized = self.new_register(width, signed);
        self.emit(IrOp::Resize {
            from: reg.into(),
            to: resized.into(),
        });
        resized
    }

    fn lower_pointer(&mut self, expr: &Expr) -> LowerResult<VirtualRegister> {
        let reg = self.lower_expr(expr)?;
        Ok(self.resize(reg, POINTER_WIDTH, false))
    }

    fn load_variable(&mut self, var: Variable, span: Option<Span>) -> LowerResult<VirtualRegister> {
        let reg = if var.decays() {
            self.new_register(POINTER_WIDTH, false)
        } else {
            match var.ty.width() {
                Some(width) => self.new_register(width, var.ty.signed()),
                None => {
                    return Err(self.error(
                        TypeMismatch,
                        format!("{} of type {} has no value", var.name, var.ty),
                        span,
                    ))
                }
            }
        };
        self.emit(IrOp::LoadVar {
            variable: var,
            to: reg.into(),
            lvalue: false,
        });
        Ok(reg)
    }

    /// Read a value of type `ty` at `ptr`. Nested arrays are not read: their
    /// address is the value.
    fn load_through(&mut self, ptr: VirtualRegister, ty: &Type, span: Option<Span>) -> LowerResult<VirtualRegister> {
        if let Type::Array { .. } = ty {
            return Ok(ptr);
        }
        let Some(width) = ty.width() else {
            return Err(self.error(
                TypeMismatch,
                format!("cannot read a value of type {}", ty),
                span,
            ));
        };
        let reg = self.new_register(width, ty.signed());
        self.emit(IrOp::mov(reg, Operand::deref(ptr, width)));
        Ok(reg)
    }

    /// `base + index * sizeof(element)`
    fn element_address(&mut self, base: &Expr, index: &Expr, span: Option<Span>) -> LowerResult<VirtualRegister> {
        let base_ty = self.type_of(base)?;
        let Some(elem_size) = base_ty.pointee().map(Type::size) else {
            return Err(self.error(
                TypeMismatch,
                format!("cannot index a value of type {}", base_ty),
                span,
            ));
        };
        let index_ty = self.type_of(index)?;
        if !index_ty.is_int() {
            return Err(self.error(
                TypeMismatch,
                format!("array index must be an integer, not {}", index_ty),
                index.span,
            ));
        }

        let base = self.lower_pointer(base)?;
        let offset = self.lower_expr(index)?;
        let offset = self.resize(offset, POINTER_WIDTH, index_ty.signed());
        let result = self.new_register(POINTER_WIDTH, false);
        self.emit(IrOp::binary(
            BinaryOp::Mul,
            offset,
            Operand::imm(i64::from(elem_size), POINTER_WIDTH),
        ));
        self.emit(IrOp::Binary {
            op: BinaryOp::Add,
            left: base.into(),
            right: offset.into(),
            to: result.into(),
        });
        Ok(result)
    }

    fn lower_increment(&mut self, op: IncrementOperator, prefix: bool, inner: &Expr) -> LowerResult<VirtualRegister> {
        let ty = self.type_of(inner)?;
        if ty.is_const() {
            return Err(self.error(
                NotAnLvalue,
                format!("cannot modify a value of constant type {}", ty),
                inner.span,
            ));
        }
        let Some(width) = ty.width() else {
            return Err(self.error(
                TypeMismatch,
                format!("cannot increment a value of type {}", ty),
                inner.span,
            ));
        };
        let step = ty.pointee().map(Type::size).unwrap_or(1);
        let op = match op {
            IncrementOperator::Increment => BinaryOp::Add,
            IncrementOperator::Decrement => BinaryOp::Sub,
        };

        let ptr = self.lower_lvalue(inner)?;
        let value = self.new_register(width, ty.signed());
        self.emit(IrOp::mov(value, Operand::deref(ptr, width)));
        if prefix {
            self.emit(IrOp::binary(op, value, Operand::imm(i64::from(step), width)));
            self.emit(IrOp::mov(Operand::deref(ptr, width), value));
        } else {
            let updated = self.new_register(width, ty.signed());
            self.emit(IrOp::Binary {
                op,
                left: value.into(),
                right: Operand::imm(i64::from(step), width),
                to: updated.into(),
            });
            self.emit(IrOp::mov(Operand::deref(ptr, width), updated));
        }
        Ok(value)
    }

    /// Lower a call. Returns `None` for void functions.
    pub fn lower_call(&mut self, callee: &Expr, args: &[Expr]) -> LowerResult<Option<VirtualRegister>> {
        let signature = match self.type_of(callee)? {
            Type::Function(func) => *func,
            other => {
                return Err(self.error(
                    TypeMismatch,
                    format!("called object of type {} is not a function", other),
                    callee.span,
                ))
            }
        };

        let count_ok = if signature.varargs {
            args.len() >= signature.params.len()
        } else {
            args.len() == signature.params.len()
        };
        if !count_ok {
            return Err(self.error(
                TypeMismatch,
                format!(
                    "incorrect number of arguments: expected {} got {}",
                    signature.params.len(),
                    args.len()
                ),
                None,
            ));
        }
        for (n, (arg, expected)) in args.iter().zip(&signature.params).enumerate() {
            let ty = self.type_of(arg)?;
            if !ty.implicitly_casts_to(expected) {
                return Err(self.error(
                    TypeMismatch,
                    format!("argument {} is of type {} instead of {}", n, ty, expected),
                    arg.span,
                ));
            }
        }

        let mut operands = Vec::with_capacity(args.len());
        for (n, arg) in args.iter().enumerate() {
            let reg = self.lower_expr(arg)?;
            // extra varargs keep their own width
            let reg = match signature.params.get(n) {
                Some(param) => {
                    let width = param.width().unwrap_or(POINTER_WIDTH);
                    self.resize(reg, width, param.signed())
                }
                None => reg,
            };
            operands.push(reg.into());
        }

        let jump = self.lower_expr(callee)?;
        let result = signature
            .returns
            .width()
            .map(|width| self.new_register(width, signature.returns.signed()));
        self.emit(IrOp::Call {
            args: operands,
            jump: jump.into(),
            result: result.map(Operand::from),
        });
        Ok(result)
    }

    fn lower_binary(&mut self, expr: &Expr) -> LowerResult<VirtualRegister> {
        let (leaf, steps) = binary_spine(expr);
        let mut lhs_ty = self.type_of(leaf)?;
        let mut lhs = self.lower_expr(leaf)?;

        for (op, rhs_expr, span) in steps {
            let previous = self.enter_origin(span);
            let rhs_ty = self.type_of(rhs_expr)?;
            let result_ty = self.combine(op, &lhs_ty, &rhs_ty, span)?;
            let rhs = self.lower_expr(rhs_expr)?;
            let (left, right) = self.equalize(lhs, rhs);

            lhs = if op.is_relational() {
                self.emit(IrOp::Compare {
                    left: left.into(),
                    right: right.into(),
                });
                let result = self.new_register(Width::W1, false);
                self.emit(IrOp::SetCmp {
                    dest: result.into(),
                    kind: compare_kind(op, left.signed || right.signed),
                });
                result
            } else {
                let binop = match op {
                    BinaryOperator::Add => BinaryOp::Add,
                    BinaryOperator::Sub => BinaryOp::Sub,
                    BinaryOperator::Mul => BinaryOp::Mul,
                    BinaryOperator::Div if result_ty.signed() => BinaryOp::IDiv,
                    BinaryOperator::Div => BinaryOp::UDiv,
                    BinaryOperator::Mod if result_ty.signed() => BinaryOp::IMod,
                    BinaryOperator::Mod => BinaryOp::UMod,
                    BinaryOperator::Shl | BinaryOperator::Shr if rhs_ty.signed() => {
                        return Err(self.error(
                            TypeMismatch,
                            "shift amount must be unsigned",
                            rhs_expr.span,
                        ))
                    }
                    BinaryOperator::Shl => BinaryOp::Shl,
                    BinaryOperator::Shr if lhs_ty.signed() => BinaryOp::Sar,
                    BinaryOperator::Shr => BinaryOp::Shr,
                    BinaryOperator::BitAnd => BinaryOp::And,
                    BinaryOperator::BitOr => BinaryOp::Or,
                    BinaryOperator::BitXor => BinaryOp::Xor,
                    _ => return Err(InternalError::Invariant(format!("unhandled operator {}", op.symbol())).into()),
                };

                // pointer arithmetic scales the integer side by the element size
                if result_ty.is_pointer_like() {
                    let (ptr_ty, scaled) = if lhs_ty.is_pointer_like() {
                        (&lhs_ty, right)
                    } else {
                        (&rhs_ty, left)
                    };
                    let elem_size = ptr_ty.pointee().map(Type::size).unwrap_or(1);
                    self.emit(IrOp::binary(
                        BinaryOp::Mul,
                        scaled,
                        Operand::imm(i64::from(elem_size), scaled.width),
                    ));
                }
                self.emit(IrOp::binary(binop, left, right));
                left.with_sign(result_ty.signed())
            };
            lhs_ty = result_ty;
            self.restore_origin(previous);
        }
        Ok(lhs)
    }

    /// Resize the narrower operand to the wider one's width
    fn equalize(&mut self, lhs: VirtualRegister, rhs: VirtualRegister) -> (VirtualRegister, VirtualRegister) {
        if lhs.width < rhs.width {
            (self.resize(lhs, rhs.width, rhs.signed), rhs)
        } else if rhs.width < lhs.width {
            let rhs = self.resize(rhs, lhs.width, lhs.signed);
            (lhs, rhs)
        } else {
            (lhs, rhs)
        }
    }

    /// Short-circuit `and`/`or`. The result register holds the left value
    /// when the right side is skipped, the right value otherwise.
    fn lower_logical(&mut self, op: LogicalOperator, lhs: &Expr, rhs: &Expr) -> LowerResult<VirtualRegister> {
        let lhs_ty = self.type_of(lhs)?;
        let rhs_ty = self.type_of(rhs)?;
        if lhs_ty == Type::Void || rhs_ty == Type::Void {
            return Err(self.error(TypeMismatch, "void argument to boolean operator", None));
        }
        if !rhs_ty.implicitly_casts_to(&lhs_ty) {
            return Err(self.error(
                TypeMismatch,
                format!(
                    "right argument of type {} to boolean operator cannot be cast to {}",
                    rhs_ty, lhs_ty
                ),
                rhs.span,
            ));
        }

        let result = self.lower_expr(lhs)?;
        self.emit(IrOp::Compare {
            left: result.into(),
            right: Operand::imm(0, result.width),
        });
        let end = self.new_target();
        let cond = self.new_register(Width::W1, false);
        self.emit(IrOp::SetCmp {
            dest: cond.into(),
            kind: match op {
                LogicalOperator::Or => CompareKind::Ne,
                LogicalOperator::And => CompareKind::Eq,
            },
        });
        self.emit(IrOp::Jump {
            target: end,
            condition: Some(cond.into()),
        });
        let right = self.lower_expr(rhs)?;
        let right = self.resize(right, result.width, result.signed);
        self.emit(IrOp::mov(result, right));
        self.emit(IrOp::Target(end));
        Ok(result)
    }

    fn lower_assign(&mut self, target: &Expr, value: &Expr) -> LowerResult<VirtualRegister> {
        let target_ty = self.type_of(target)?;
        let value_ty = self.type_of(value)?;

        let rhs = self.lower_expr(value)?;
        if target_ty.is_const() {
            return Err(self.error(
                NotAnLvalue,
                format!("cannot assign to a value of constant type {}", target_ty),
                target.span,
            ));
        }
        let lhs = self.lower_lvalue(target)?;

        if !value_ty.implicitly_casts_to(&target_ty) {
            return Err(self.error(
                TypeMismatch,
                format!("cannot assign {} to {}", value_ty, target_ty),
                value.span,
            ));
        }
        let Some(width) = target_ty.width() else {
            return Err(self.error(
                TypeMismatch,
                format!("cannot assign to a value of type {}", target_ty),
                target.span,
            ));
        };
        let rhs = self.resize(rhs, width, target_ty.signed());
        self.emit(IrOp::mov(Operand::deref(lhs, width), rhs));
        Ok(rhs)
    }

    /// Materialise an array literal of (completed) type `ty` into `dest`, or
    /// into hidden storage. Returns the address of the first element.
    pub fn lower_array(
        &mut self,
        elems: &[Expr],
        ty: &Type,
        dest: Option<Variable>,
        span: Option<Span>,
    ) -> LowerResult<VirtualRegister> {
        let backing = match dest {
            Some(var) => var,
            None => self.declare_hidden(ty, span)?,
        };
        let base = self.new_register(POINTER_WIDTH, false);
        self.emit(IrOp::LoadVar {
            variable: backing,
            to: base.into(),
            lvalue: false,
        });
        let cursor = self.new_register(POINTER_WIDTH, false);
        self.emit(IrOp::mov(cursor, base));
        self.write_array(cursor, elems, ty, span)?;
        Ok(base)
    }

    fn write_array(&mut self, cursor: VirtualRegister, elems: &[Expr], ty: &Type, span: Option<Span>) -> LowerResult<()> {
        let Type::Array {
            elem,
            len: Some(len),
            ..
        } = ty
        else {
            return Err(InternalError::Invariant(format!("array literal completed to {}", ty)).into());
        };
        let count = elems.len() as u32;
        if count > *len {
            return Err(self.error(
                TypeMismatch,
                format!("array literal has {} elements but its type allows {}", count, len),
                span,
            ));
        }

        if let Type::Array { .. } = elem.as_ref() {
            // nested literals are laid out inline
            for e in elems {
                let ExprKind::Array(children) = &e.kind else {
                    return Err(self.error(
                        TypeMismatch,
                        "elements of a nested array must be array literals",
                        e.span,
                    ));
                };
                self.write_array(cursor, children, elem, e.span)?;
            }
        } else {
            let Some(width) = elem.width() else {
                return Err(self.error(
                    TypeMismatch,
                    format!("array elements cannot have type {}", elem),
                    span,
                ));
            };
            for e in elems {
                let elem_ty = self.type_of(e)?;
                if !elem_ty.implicitly_casts_to(elem) {
                    return Err(self.error(
                        TypeMismatch,
                        format!("array element of type {} does not fit {}", elem_ty, elem),
                        e.span,
                    ));
                }
                let value = self.lower_expr(e)?;
                let value = self.resize(value, width, elem.signed());
                self.emit(IrOp::mov(Operand::deref(cursor, width), value));
                self.emit(IrOp::binary(
                    BinaryOp::Add,
                    cursor,
                    Operand::imm(i64::from(width.bytes()), POINTER_WIDTH),
                ));
            }
        }

        let missing = len - count;
        if missing > 0 {
            self.emit(IrOp::binary(
                BinaryOp::Add,
                cursor,
                Operand::imm(i64::from(missing * elem.size()), POINTER_WIDTH),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::context::Halt;
    use crate::compiler::ir::instruction::IrInstruction;
    use crate::error::{CompileErrorKind, Error};

    fn with_function<T>(f: impl FnOnce(&mut CompileContext<'_>) -> T) -> T {
        let mut registry = Registry::new();
        let root = registry.scopes.root();
        let mut ctx = CompileContext::new(&mut registry, root, "test", UnitKind::Function);
        ctx.push_scope();
        f(&mut ctx)
    }

    fn kind_of(result: LowerResult<VirtualRegister>) -> CompileErrorKind {
        match result {
            Err(Halt::Failed(Error::Compile(err))) => err.kind,
            Err(Halt::Failed(other)) => panic!("unexpected error {}", other),
            Err(Halt::Pending(request)) => panic!("unexpected suspension on {}", request.path),
            Ok(reg) => panic!("expected an error, got {}", reg),
        }
    }

    fn ops(code: &[IrInstruction]) -> Vec<&'static str> {
        code.iter().map(|i| i.op.name()).collect()
    }

    #[test]
    fn test_literal_widths() {
        assert_eq!(literal_type(4), Type::uint(Width::W1));
        assert_eq!(literal_type(255), Type::uint(Width::W1));
        assert_eq!(literal_type(256), Type::uint(Width::W2));
        assert_eq!(literal_type(-1), Type::sint(Width::W1));
        assert_eq!(literal_type(-129), Type::sint(Width::W2));
        assert_eq!(literal_type(1 << 40), Type::uint(Width::W8));
        assert_eq!(literal_type(i64::MIN), Type::sint(Width::W8));
    }

    #[test]
    fn test_binary_result_types() {
        let u1 = Type::uint(Width::W1);
        let s4 = Type::sint(Width::W4);
        let ptr = Type::pointer(Type::uint(Width::W2));
        assert_eq!(
            binary_result_type(BinaryOperator::Add, &u1, &s4),
            Some(Type::sint(Width::W4))
        );
        assert_eq!(binary_result_type(BinaryOperator::Add, &u1, &ptr), Some(ptr.clone()));
        assert_eq!(
            binary_result_type(BinaryOperator::Sub, &ptr, &ptr),
            Some(Type::uint(POINTER_WIDTH))
        );
        assert_eq!(binary_result_type(BinaryOperator::Mul, &ptr, &u1), None);
        assert_eq!(binary_result_type(BinaryOperator::Lt, &ptr, &ptr), Some(u1.clone()));
        assert_eq!(
            binary_result_type(BinaryOperator::Shr, &s4, &u1),
            Some(Type::sint(Width::W4))
        );
    }

    #[test]
    fn test_literal_lowers_to_mov() {
        with_function(|ctx| {
            let reg = ctx.lower_expr(&Expr::int(300)).unwrap();
            assert_eq!(reg.width, Width::W2);
            assert_eq!(
                ctx.instructions()[0].op,
                IrOp::mov(reg, Operand::imm(300, Width::W2))
            );
        });
    }

    #[test]
    fn test_arithmetic_is_in_place_after_resize() {
        with_function(|ctx| {
            let expr = Expr::binary(BinaryOperator::Add, Expr::int(1), Expr::int(1000));
            let reg = ctx.lower_expr(&expr).unwrap();
            // mov, mov, resize lhs to 2 bytes, add in place
            assert_eq!(ops(ctx.instructions()), vec!["Mov", "Mov", "Resize", "Binary"]);
            assert_eq!(reg.index, 2);
            assert_eq!(reg.width, Width::W2);
            match &ctx.instructions()[3].op {
                IrOp::Binary { left, to, .. } => assert_eq!(left, to),
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_long_chain_lowers_without_recursion_depth() {
        with_function(|ctx| {
            let mut expr = Expr::int(1);
            for _ in 0..2_000 {
                expr = Expr::binary(BinaryOperator::Add, expr, Expr::int(1));
            }
            ctx.lower_expr(&expr).unwrap();
            assert_eq!(ctx.instructions().len(), 1 + 2 * 2_000);
        });
    }

    #[test]
    fn test_relational_produces_byte() {
        with_function(|ctx| {
            let expr = Expr::binary(
                BinaryOperator::Lt,
                Expr::int(-1),
                Expr::int(2),
            );
            let reg = ctx.lower_expr(&expr).unwrap();
            assert_eq!(reg.width, Width::W1);
            match &ctx.instructions().last().unwrap().op {
                IrOp::SetCmp { kind, .. } => assert_eq!(*kind, CompareKind::LtSigned),
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_unsigned_negate_is_rejected() {
        with_function(|ctx| {
            let result = ctx.lower_expr(&Expr::unary(UnaryOperator::Neg, Expr::int(3)));
            assert_eq!(kind_of(result), CompileErrorKind::TypeMismatch);
            // unsigned plus is a no-op
            let before = ctx.instructions().len();
            ctx.lower_expr(&Expr::unary(UnaryOperator::Plus, Expr::int(3))).unwrap();
            assert_eq!(ctx.instructions().len(), before + 1);
        });
    }

    #[test]
    fn test_literal_is_not_an_lvalue() {
        with_function(|ctx| {
            let result = ctx.lower_expr(&Expr::assign(Expr::int(1), Expr::int(2)));
            assert_eq!(kind_of(result), CompileErrorKind::NotAnLvalue);
        });
    }

    #[test]
    fn test_array_literal_elements_are_immutable() {
        with_function(|ctx| {
            ctx.lower_stmt(&Stmt::var(
                "a",
                None,
                Some(Expr::array(vec![Expr::int(1), Expr::int(2)])),
            ))
            .unwrap();
            let store = Expr::assign(Expr::index(Expr::name("a"), Expr::int(0)), Expr::int(5));
            assert_eq!(kind_of(ctx.lower_expr(&store)), CompileErrorKind::NotAnLvalue);
        });
    }

    #[test]
    fn test_literal_storage_rejects_pointer_writes() {
        with_function(|ctx| {
            let literal = Expr::array(vec![Expr::int(1), Expr::int(2)]);
            ctx.lower_stmt(&Stmt::var("a", None, Some(literal.clone()))).unwrap();
            let u1_ptr = Type::pointer(Type::uint(Width::W1));
            ctx.lower_stmt(&Stmt::var("p", Some(u1_ptr.clone()), Some(literal))).unwrap();

            let second = Expr::binary(BinaryOperator::Add, Expr::name("a"), Expr::int(1));
            let targets = vec![
                Expr::deref(Expr::name("a")),
                Expr::deref(second.clone()),
                Expr::deref(Expr::name("p")),
                Expr::deref(Expr::cast(CastKind::Reinterpret, u1_ptr, Expr::name("a"))),
            ];
            for target in targets {
                let store = Expr::assign(target, Expr::int(5));
                assert_eq!(kind_of(ctx.lower_expr(&store)), CompileErrorKind::NotAnLvalue);
            }
            // reading stays fine
            assert!(ctx.lower_expr(&Expr::deref(second)).is_ok());
        });
    }

    #[test]
    fn test_nested_literal_rows_are_immutable() {
        with_function(|ctx| {
            let grid = Type::array(Type::array(Type::uint(Width::W1), Some(2)), Some(2));
            let literal = Expr::array(vec![
                Expr::array(vec![Expr::int(1), Expr::int(2)]),
                Expr::array(vec![Expr::int(3), Expr::int(4)]),
            ]);
            ctx.lower_stmt(&Stmt::var("g", Some(grid), Some(literal))).unwrap();

            let row = Expr::index(Expr::name("g"), Expr::int(0));
            let cell = Expr::assign(Expr::index(row.clone(), Expr::int(1)), Expr::int(9));
            assert_eq!(kind_of(ctx.lower_expr(&cell)), CompileErrorKind::NotAnLvalue);
            let head = Expr::assign(Expr::deref(row), Expr::int(9));
            assert_eq!(kind_of(ctx.lower_expr(&head)), CompileErrorKind::NotAnLvalue);
        });
    }

    #[test]
    fn test_declared_array_without_literal_is_writable() {
        with_function(|ctx| {
            let ty = Type::array(Type::uint(Width::W1), Some(2));
            ctx.lower_stmt(&Stmt::var("b", Some(ty), None)).unwrap();
            let store = Expr::assign(Expr::index(Expr::name("b"), Expr::int(1)), Expr::int(5));
            assert!(ctx.lower_expr(&store).is_ok());
            let store = Expr::assign(Expr::deref(Expr::name("b")), Expr::int(5));
            assert!(ctx.lower_expr(&store).is_ok());
        });
    }

    #[test]
    fn test_pointer_elements_use_hidden_storage() {
        with_function(|ctx| {
            let ty = Type::array(Type::pointer(Type::uint(Width::W1)), Some(2));
            let literal = Expr::array(vec![
                Expr::array(vec![Expr::int(1), Expr::int(2)]),
                Expr::array(vec![Expr::int(3)]),
            ]);
            ctx.lower_stmt(&Stmt::var("p", Some(ty), Some(literal))).unwrap();
            let code = ctx.instructions();

            // one hidden backing variable per element
            let hidden: Vec<&str> = code
                .iter()
                .filter_map(|i| match &i.op {
                    IrOp::LoadVar { variable, .. } if variable.name.starts_with("test#") => {
                        Some(variable.name.as_str())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(hidden, vec!["test#0", "test#1"]);

            let IrOp::Mov {
                to: Operand::Register(cursor),
                ..
            } = &code[1].op
            else {
                panic!("expected the cursor copy, got {}", code[1].op.name());
            };
            let slot_writes = code
                .iter()
                .filter(|i| match &i.op {
                    IrOp::Mov {
                        to:
                            Operand::Dereference(Dereference {
                                target: DerefTarget::Register(reg),
                                width,
                            }),
                        ..
                    } => reg == cursor && *width == POINTER_WIDTH,
                    _ => false,
                })
                .count();
            assert_eq!(slot_writes, 2);

            let advances = code
                .iter()
                .filter(|i| match &i.op {
                    IrOp::Binary {
                        op: BinaryOp::Add,
                        left: Operand::Register(reg),
                        right: Operand::Immediate(step),
                        ..
                    } => reg == cursor && step.value == i64::from(POINTER_WIDTH.bytes()),
                    _ => false,
                })
                .count();
            assert_eq!(advances, 2);
        });
    }

    #[test]
    fn test_declared_array_is_padded() {
        with_function(|ctx| {
            let ty = Type::array(Type::uint(Width::W2), Some(4));
            ctx.lower_stmt(&Stmt::var(
                "a",
                Some(ty),
                Some(Expr::array(vec![Expr::int(1)])),
            ))
            .unwrap();
            // one element written, then the cursor skips 3 * 2 bytes
            let last = &ctx.instructions().last().unwrap().op;
            assert_eq!(
                last,
                &IrOp::Binary {
                    op: BinaryOp::Add,
                    left: Operand::from(VirtualRegister::new(1, POINTER_WIDTH, false)),
                    right: Operand::imm(6, POINTER_WIDTH),
                    to: Operand::from(VirtualRegister::new(1, POINTER_WIDTH, false)),
                }
            );
        });
    }

    #[test]
    fn test_nested_array_is_inlined() {
        with_function(|ctx| {
            let literal = Expr::array(vec![
                Expr::array(vec![Expr::int(1), Expr::int(2)]),
                Expr::array(vec![Expr::int(3)]),
            ]);
            ctx.lower_stmt(&Stmt::var("grid", None, Some(literal))).unwrap();
            let stores = ctx
                .instructions()
                .iter()
                .filter(|i| matches!(&i.op, IrOp::Mov { to: Operand::Dereference(_), .. }))
                .count();
            assert_eq!(stores, 3);
            // a single backing variable: no hidden storage was declared
            let loads = ctx
                .instructions()
                .iter()
                .filter(|i| matches!(i.op, IrOp::LoadVar { .. }))
                .count();
            assert_eq!(loads, 1);
        });
    }

    #[test]
    fn test_logical_or_short_circuits() {
        with_function(|ctx| {
            let expr = Expr::logical(LogicalOperator::Or, Expr::int(0), Expr::int(1));
            ctx.lower_expr(&expr).unwrap();
            assert_eq!(
                ops(ctx.instructions()),
                vec!["Mov", "Compare", "SetCmp", "Jump", "Mov", "Mov", "Target"]
            );
        });
    }

    #[test]
    fn test_if_else_layout() {
        with_function(|ctx| {
            let stmt = Stmt::if_else(
                Expr::int(1),
                vec![Stmt::expr(Expr::int(2))],
                Some(vec![Stmt::expr(Expr::int(3))]),
            );
            ctx.lower_stmt(&stmt).unwrap();
            assert_eq!(
                ops(ctx.instructions()),
                vec!["Mov", "Jump", "Mov", "Jump", "Target", "Mov", "Target"]
            );
        });
    }

    #[test]
    fn test_while_layout() {
        with_function(|ctx| {
            let stmt = Stmt::while_loop(Expr::int(1), vec![Stmt::expr(Expr::int(2))]);
            ctx.lower_stmt(&stmt).unwrap();
            assert_eq!(
                ops(ctx.instructions()),
                vec!["Target", "Mov", "Jump", "Jump", "Target", "Mov", "Jump", "Target"]
            );
        });
    }

    #[test]
    fn test_pointer_arithmetic_scales() {
        with_function(|ctx| {
            let ptr = Type::pointer(Type::uint(Width::W4));
            ctx.lower_stmt(&Stmt::var("p", Some(ptr), None)).unwrap();
            let expr = Expr::binary(BinaryOperator::Add, Expr::name("p"), Expr::int(3));
            ctx.lower_expr(&expr).unwrap();
            let scaled = ctx.instructions().iter().any(|i| {
                matches!(
                    &i.op,
                    IrOp::Binary { op: BinaryOp::Mul, right: Operand::Immediate(imm), .. } if imm.value == 4
                )
            });
            assert!(scaled);
        });
    }

    #[test]
    fn test_asm_operands() {
        with_function(|ctx| {
            let line = crate::syntax::AsmLine {
                mnemonic: "add".into(),
                width: Width::W8,
                params: vec![
                    AsmParam {
                        source: AsmSource::Expr(0),
                        width: Width::W8,
                        deref: true,
                    },
                    AsmParam {
                        source: AsmSource::Register(5),
                        width: Width::W8,
                        deref: false,
                    },
                ],
            };
            ctx.lower_stmt(&Stmt::asm(vec![Expr::int(7)], vec![line])).unwrap();
            match &ctx.instructions().last().unwrap().op {
                IrOp::Machine { args, .. } => {
                    assert!(matches!(args[0], Operand::Dereference(_)));
                    assert_eq!(args[1], Operand::Allocated(AllocatedRegister::new(5, Width::W8)));
                }
                other => panic!("unexpected {:?}", other),
            }
        });
    }
}
