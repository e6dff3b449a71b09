//! Variables and the persistent scope tree
//!
//! The tree holds the root scope and one child per module. It lives for the
//! whole compilation and is shared by every unit; function bodies keep their
//! block scopes locally and fall back to the tree when a name is not local.

use super::ir::operand::DataReference;
use crate::syntax::{Path, Type};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Where a variable lives. Fixed when the variable is declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Storage {
    /// Byte offset from the frame base. Parameters sit at negative offsets.
    Stack(i32),
    /// Entry in the global data table (or the code address of a function)
    Global(DataReference),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    storage: Storage,
    /// The variable's address is its value (functions, array backing storage).
    /// Loading it yields the address and it has no separate lvalue.
    pub address_only: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: Type, storage: Storage, address_only: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            storage,
            address_only,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_global(&self) -> bool {
        matches!(self.storage, Storage::Global(_))
    }

    /// Whether a value load produces the address rather than the contents
    pub fn decays(&self) -> bool {
        self.address_only || matches!(self.ty, Type::Array { .. })
    }
}

/// A name already bound with a different type
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub existing: Type,
}

/// One level of name bindings
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    variables: HashMap<String, Variable>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Bind `name`, creating the variable with `make` if it is new.
    ///
    /// Redeclaring with an identical type returns the existing variable, so
    /// replaying a declaration is harmless.
    pub fn bind(
        &mut self,
        name: &str,
        ty: &Type,
        make: impl FnOnce() -> Variable,
    ) -> Result<Variable, Conflict> {
        if let Some(existing) = self.variables.get(name) {
            if existing.ty == *ty {
                return Ok(existing.clone());
            }
            return Err(Conflict {
                existing: existing.ty.clone(),
            });
        }
        let variable = make();
        self.variables.insert(name.to_string(), variable.clone());
        Ok(variable)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// Handle to a scope in a [`ScopeTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(usize);

#[derive(Debug, Clone)]
struct Scope {
    parent: Option<ScopeId>,
    /// Namespace prefix for global names declared here: `""`, `"m."`, `"m.n."`
    prefix: String,
    bindings: Bindings,
    modules: BTreeMap<String, ScopeId>,
}

/// Root scope plus module scopes
#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                parent: None,
                prefix: String::new(),
                bindings: Bindings::new(),
                modules: BTreeMap::new(),
            }],
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// Module scope `name` under `parent`, created on first use
    pub fn module(&mut self, parent: ScopeId, name: &str) -> ScopeId {
        if let Some(id) = self.scopes[parent.0].modules.get(name) {
            return *id;
        }
        let id = ScopeId(self.scopes.len());
        let prefix = format!("{}{}.", self.scopes[parent.0].prefix, name);
        self.scopes.push(Scope {
            parent: Some(parent),
            prefix,
            bindings: Bindings::new(),
            modules: BTreeMap::new(),
        });
        self.scopes[parent.0].modules.insert(name.to_string(), id);
        id
    }

    pub fn prefix(&self, scope: ScopeId) -> &str {
        &self.scopes[scope.0].prefix
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope.0].parent
    }

    /// Declare a global variable named `prefix + name` in `scope`
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: &Type,
        address_only: bool,
    ) -> Result<Variable, Conflict> {
        let qualified = format!("{}{}", self.scopes[scope.0].prefix, name);
        self.scopes[scope.0].bindings.bind(name, ty, || {
            Variable::new(
                qualified.clone(),
                ty.clone(),
                Storage::Global(DataReference::new(qualified)),
                address_only,
            )
        })
    }

    /// Variable declared directly in `scope`, ignoring parents
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<&Variable> {
        self.scopes[scope.0].bindings.get(name)
    }

    /// Unqualified lookup walking from `scope` out to the root
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Variable> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let Some(var) = self.lookup_local(id, name) {
                return Some(var);
            }
            current = self.parent(id);
        }
        None
    }

    /// Resolve a possibly qualified path.
    ///
    /// `m.n.x` finds module `m` walking outward from `scope`, descends into
    /// `n`, then looks for `x` in that module only.
    pub fn resolve(&self, scope: ScopeId, path: &Path) -> Option<&Variable> {
        let (name, modules) = path.segments.split_last()?;
        let Some((first, rest)) = modules.split_first() else {
            return self.lookup(scope, name);
        };
        let mut module = self.find_module(scope, first)?;
        for segment in rest {
            module = *self.scopes[module.0].modules.get(segment)?;
        }
        self.lookup_local(module, name)
    }

    fn find_module(&self, scope: ScopeId, name: &str) -> Option<ScopeId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            if let Some(module) = self.scopes[id.0].modules.get(name) {
                return Some(*module);
            }
            current = self.parent(id);
        }
        None
    }
}
