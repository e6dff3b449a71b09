//! Per-unit compile context
//!
//! A context owns the instruction buffer and counters of one unit while it is
//! lowered, and borrows the shared [`Registry`] for global declarations.
//! Name lookups that cannot be satisfied yet stop lowering with
//! [`Halt::Pending`]; the driver retries the unit from the start once the name
//! exists.

use super::instruction::{IrInstruction, IrOp, JumpTargetId};
use super::operand::VirtualRegister;
use super::program::{DataEntry, DataTable, LoweredUnit, UnitKind};
use crate::compiler::scope::{Bindings, Conflict, ScopeId, ScopeTree, Storage, Variable};
use crate::error::{CompileError, CompileErrorKind, Error, InternalError};
use crate::syntax::{FunctionType, Path, Span, Type, Width};

/// State shared by every unit: the scope tree and global data
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub scopes: ScopeTree,
    pub data: DataTable,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a global in `scope`. Data storage is reserved unless the
    /// variable is address-only (a function handle).
    pub fn declare_global(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: &Type,
        address_only: bool,
    ) -> Result<Variable, Conflict> {
        let var = self.scopes.declare(scope, name, ty, address_only)?;
        if let Storage::Global(reference) = var.storage() {
            if !address_only || matches!(ty, Type::Array { .. }) {
                self.data
                    .insert(reference.name(), DataEntry::Zeroed(ty.size()));
            }
        }
        Ok(var)
    }
}

/// A name a unit needs before it can continue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub path: Path,
    /// Where the name was used
    pub span: Option<Span>,
}

/// Why lowering of a unit stopped
#[derive(Debug)]
pub enum Halt {
    /// Waiting for a declaration
    Pending(ResolutionRequest),
    Failed(Error),
}

impl From<Error> for Halt {
    fn from(err: Error) -> Self {
        Halt::Failed(err)
    }
}

impl From<CompileError> for Halt {
    fn from(err: CompileError) -> Self {
        Halt::Failed(err.into())
    }
}

impl From<InternalError> for Halt {
    fn from(err: InternalError) -> Self {
        Halt::Failed(err.into())
    }
}

pub type LowerResult<T> = std::result::Result<T, Halt>;

pub struct CompileContext<'r> {
    registry: &'r mut Registry,
    /// Module scope the unit was declared in
    module: ScopeId,
    unit: String,
    kind: UnitKind,
    /// Block scopes, innermost last. Empty for top-level initialisers.
    blocks: Vec<Bindings>,
    params: Bindings,
    pub(crate) function: Option<FunctionType>,
    /// Bytes of locals declared so far
    locals: u32,
    next_reg: u32,
    label_counter: u32,
    hidden_counter: u32,
    instructions: Vec<IrInstruction>,
    /// Span of the innermost node being lowered
    origin: Option<Span>,
}

impl<'r> CompileContext<'r> {
    pub fn new(registry: &'r mut Registry, module: ScopeId, unit: &str, kind: UnitKind) -> Self {
        Self {
            registry,
            module,
            unit: unit.to_string(),
            kind,
            blocks: Vec::new(),
            params: Bindings::new(),
            function: None,
            locals: 0,
            next_reg: 0,
            label_counter: 0,
            hidden_counter: 0,
            instructions: Vec::new(),
            origin: None,
        }
    }

    pub fn registry(&mut self) -> &mut Registry {
        self.registry
    }

    pub fn module(&self) -> ScopeId {
        self.module
    }

    pub fn new_register(&mut self, width: Width, signed: bool) -> VirtualRegister {
        let reg = VirtualRegister::new(self.next_reg, width, signed);
        self.next_reg += 1;
        reg
    }

    pub fn new_target(&mut self) -> JumpTargetId {
        let id = JumpTargetId(self.label_counter);
        self.label_counter += 1;
        id
    }

    pub fn emit(&mut self, op: IrOp) {
        self.instructions
            .push(IrInstruction::new(op).with_origin(self.origin));
    }

    /// Set the span new instructions are attributed to, returning the
    /// previous one for [`CompileContext::restore_origin`]
    pub fn enter_origin(&mut self, span: Option<Span>) -> Option<Span> {
        let previous = self.origin;
        if span.is_some() {
            self.origin = span;
        }
        previous
    }

    pub fn restore_origin(&mut self, previous: Option<Span>) {
        self.origin = previous;
    }

    pub fn origin(&self) -> Option<Span> {
        self.origin
    }

    /// User error at `span`, falling back to the node being lowered
    pub fn error(&self, kind: CompileErrorKind, reason: impl Into<String>, span: Option<Span>) -> Halt {
        Halt::Failed(CompileError::new(kind, reason, span.or(self.origin)).into())
    }

    pub fn push_scope(&mut self) {
        self.blocks.push(Bindings::new());
    }

    pub fn pop_scope(&mut self) {
        self.blocks.pop();
    }

    pub fn in_function(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Bind a parameter at a fixed (negative) frame offset
    pub fn declare_param(&mut self, name: &str, ty: &Type, offset: i32, address_only: bool) -> LowerResult<Variable> {
        self.params
            .bind(name, ty, || {
                Variable::new(name, ty.clone(), Storage::Stack(offset), address_only)
            })
            .map_err(|conflict| self.conflict(name, ty, conflict, None))
    }

    /// Declare a variable in the innermost scope: a frame slot inside a
    /// function, a global otherwise.
    pub fn declare(&mut self, name: &str, ty: &Type, address_only: bool, span: Option<Span>) -> LowerResult<Variable> {
        if let Type::Array { len: None, .. } = ty {
            return Err(self.error(
                CompileErrorKind::TypeMismatch,
                format!("array variable {} has no length", name),
                span,
            ));
        }
        if ty == &Type::Void {
            return Err(self.error(
                CompileErrorKind::TypeMismatch,
                format!("variable {} cannot have void type", name),
                span,
            ));
        }
        let result = match self.blocks.last_mut() {
            Some(scope) => {
                let offset = self.locals;
                let declared = scope.bind(name, ty, || {
                    Variable::new(name, ty.clone(), Storage::Stack(offset as i32), address_only)
                });
                if let Ok(var) = &declared {
                    if var.storage() == &Storage::Stack(offset as i32) {
                        self.locals += ty.size();
                    }
                }
                declared
            }
            None => self
                .registry
                .declare_global(self.module, name, ty, address_only),
        };
        result.map_err(|conflict| self.conflict(name, ty, conflict, span))
    }

    /// Declare compiler-generated storage that user code cannot name
    pub fn declare_hidden(&mut self, ty: &Type, span: Option<Span>) -> LowerResult<Variable> {
        let name = format!("{}#{}", self.unit, self.hidden_counter);
        self.hidden_counter += 1;
        self.declare(&name, ty, true, span)
    }

    fn conflict(&self, name: &str, ty: &Type, conflict: Conflict, span: Option<Span>) -> Halt {
        self.error(
            CompileErrorKind::ConflictingDeclaration,
            format!(
                "variable {} redeclared as {} but was previously {}",
                name, ty, conflict.existing
            ),
            span,
        )
    }

    /// Look a name up: block scopes innermost first, then parameters, then
    /// the module chain. Suspends when the name does not exist yet.
    pub fn lookup(&self, path: &Path, span: Option<Span>) -> LowerResult<Variable> {
        if !path.is_qualified() {
            let name = path.name();
            for scope in self.blocks.iter().rev() {
                if let Some(var) = scope.get(name) {
                    return Ok(var.clone());
                }
            }
            if let Some(var) = self.params.get(name) {
                return Ok(var.clone());
            }
        }
        match self.registry.scopes.resolve(self.module, path) {
            Some(var) => Ok(var.clone()),
            None => Err(Halt::Pending(ResolutionRequest {
                path: path.clone(),
                span: span.or(self.origin),
            })),
        }
    }

    pub fn finish(self, name: String, span: Option<Span>) -> LoweredUnit {
        LoweredUnit {
            name,
            kind: self.kind,
            code: self.instructions,
            locals: self.locals,
            span,
            next_register: self.next_reg,
        }
    }

    #[cfg(test)]
    pub(crate) fn instructions(&self) -> &[IrInstruction] {
        &self.instructions
    }
}
