//! Name resolution driver
//!
//! Every function and top-level variable is lowered as its own unit, in
//! declaration order. A unit that uses a name nobody has declared yet is
//! parked with the name it waits for. Whenever any unit makes progress the
//! parked units whose name now resolves are retried immediately, in the order
//! they were parked. A retry lowers the unit again from the start against the
//! larger scope tree; redeclaring a name with an identical type is accepted,
//! so the declarations it made on the first attempt are harmless.
//!
//! When the queue drains, anything still parked refers to a name that will
//! never exist and fails with `UndefinedName` at the use site.

use super::ir::{lower_function, lower_global, Halt, LoweredUnit, Registry, ResolutionRequest};
use super::scope::ScopeId;
use crate::error::{CompileError, CompileErrorKind, Result};
use crate::syntax::{FunctionDecl, Item, ItemKind, Program, Span, VarDecl};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
enum TaskItem<'p> {
    Function(&'p FunctionDecl),
    Global(&'p VarDecl),
}

#[derive(Debug, Clone)]
struct Task<'p> {
    /// Position in declaration order
    order: usize,
    scope: ScopeId,
    unit: String,
    item: TaskItem<'p>,
    span: Option<Span>,
}

/// Result of lowering a whole program
#[derive(Debug, Clone)]
pub struct Lowering {
    /// Units with code, in declaration order
    pub units: Vec<LoweredUnit>,
    /// Scope tree and data table after every declaration
    pub registry: Registry,
}

/// Lower every unit of `program`, resolving forward references
pub fn lower_program(program: &Program) -> Result<Lowering> {
    let mut registry = Registry::new();
    let mut queue = VecDeque::new();
    let root = registry.scopes.root();
    collect(&program.items, root, &mut registry, &mut queue);

    let mut parked: Vec<(Task<'_>, ResolutionRequest)> = Vec::new();
    let mut finished: Vec<(usize, LoweredUnit)> = Vec::new();

    while let Some(task) = queue.pop_front() {
        match lower_task(&mut registry, &task) {
            Ok(unit) => {
                tracing::debug!(
                    "lowered unit {} ({} instructions)",
                    unit.name,
                    unit.code.len()
                );
                finished.push((task.order, unit));
            }
            Err(Halt::Pending(request)) => {
                tracing::trace!("unit {} waits for {}", task.unit, request.path);
                parked.push((task, request));
            }
            Err(Halt::Failed(err)) => return Err(err),
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut parked)
            .into_iter()
            .partition(|(task, request)| {
                registry.scopes.resolve(task.scope, &request.path).is_some()
            });
        parked = waiting;
        for (task, _) in ready.into_iter().rev() {
            tracing::trace!("resuming unit {}", task.unit);
            queue.push_front(task);
        }
    }

    if let Some((_, request)) = parked.into_iter().min_by_key(|(task, _)| task.order) {
        return Err(CompileError::new(
            CompileErrorKind::UndefinedName,
            format!("{} is not declared", request.path),
            request.span,
        )
        .into());
    }

    finished.sort_by_key(|(order, _)| *order);
    let units = finished
        .into_iter()
        .map(|(_, unit)| unit)
        .filter(|unit| !unit.code.is_empty())
        .collect();
    Ok(Lowering { units, registry })
}

/// Queue every unit under `items`, creating module scopes on the way
fn collect<'p>(
    items: &'p [Item],
    scope: ScopeId,
    registry: &mut Registry,
    queue: &mut VecDeque<Task<'p>>,
) {
    for item in items {
        let order = queue.len();
        let prefix = registry.scopes.prefix(scope).to_string();
        match &item.kind {
            ItemKind::Module { name, items } => {
                let module = registry.scopes.module(scope, name);
                collect(items, module, registry, queue);
            }
            ItemKind::Function(decl) => queue.push_back(Task {
                order,
                scope,
                unit: format!("{}{}", prefix, decl.name),
                item: TaskItem::Function(decl),
                span: item.span,
            }),
            ItemKind::Var(decl) => queue.push_back(Task {
                order,
                scope,
                unit: format!("{}{}#init{}", prefix, decl.name, order),
                item: TaskItem::Global(decl),
                span: item.span,
            }),
        }
    }
}

fn lower_task(registry: &mut Registry, task: &Task<'_>) -> std::result::Result<LoweredUnit, Halt> {
    match task.item {
        TaskItem::Function(decl) => lower_function(registry, task.scope, &task.unit, decl, task.span),
        TaskItem::Global(decl) => lower_global(registry, task.scope, &task.unit, decl, task.span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::scope::Storage;
    use crate::syntax::{Expr, Stmt, Type, Width};

    #[test]
    fn test_forward_reference_resolves() {
        let program = Program::new(vec![
            Item::function(
                "f",
                vec![],
                Type::uint(Width::W1),
                vec![Stmt::ret(Some(Expr::name("later")))],
            ),
            Item::var("later", Some(Type::uint(Width::W1)), None),
        ]);
        let lowering = lower_program(&program).unwrap();
        assert_eq!(lowering.units.len(), 1);
        assert_eq!(lowering.units[0].name, "f");
    }

    #[test]
    fn test_functions_can_call_each_other() {
        let program = Program::new(vec![
            Item::function("a", vec![], Type::Void, vec![Stmt::expr(Expr::call(Expr::name("b"), vec![]))]),
            Item::function("b", vec![], Type::Void, vec![Stmt::expr(Expr::call(Expr::name("a"), vec![]))]),
        ]);
        let lowering = lower_program(&program).unwrap();
        let names: Vec<_> = lowering.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_undefined_name_reports_use_site() {
        let span = Span::line(3, 12, 12);
        let program = Program::new(vec![Item::function(
            "f",
            vec![],
            Type::uint(Width::W1),
            vec![Stmt::ret(Some(Expr::name("y").at(span)))],
        )]);
        let err = lower_program(&program).unwrap_err();
        match err {
            crate::error::Error::Compile(err) => {
                assert_eq!(err.kind, CompileErrorKind::UndefinedName);
                assert_eq!(err.span, Some(span));
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_module_members_are_namespaced() {
        let program = Program::new(vec![Item::module(
            "m",
            vec![Item::var("x", None, Some(Expr::int(7)))],
        )]);
        let lowering = lower_program(&program).unwrap();
        let scopes = &lowering.registry.scopes;
        let x = scopes
            .resolve(scopes.root(), &crate::syntax::Path::parse("m.x"))
            .unwrap();
        assert_eq!(x.name, "m.x");
        assert!(matches!(x.storage(), Storage::Global(_)));
        assert!(lowering.registry.data.contains("m.x"));
    }
}
