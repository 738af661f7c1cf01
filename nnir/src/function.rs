//! Functions and modules over the expression arena.

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::expr::{Expr, ExprArena, ExprId};

/// Name of a module's entry function, by convention.
pub const MAIN: &str = "main";

/// A named function: parameter vars plus a body expression.
///
/// Parameters must be [`Expr::Var`] nodes with pairwise distinct names; the
/// body refers to them by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<ExprId>,
    pub body: ExprId,
}

impl Function {
    pub fn new(
        arena: &ExprArena,
        name: impl Into<String>,
        params: Vec<ExprId>,
        body: ExprId,
    ) -> Result<Self> {
        let name = name.into();
        for &param in &params {
            ensure!(
                matches!(arena.get(param), Expr::Var { .. }),
                "function {}: parameter {} is a {}, expected a var",
                name,
                param,
                arena.get(param).kind_name()
            );
        }
        ensure!(
            params.iter().map(|&p| var_name(arena, p)).all_unique(),
            "function {}: duplicate parameter names",
            name
        );
        Ok(Self { name, params, body })
    }

    /// Parameter names in declaration order.
    pub fn param_names<'a>(&self, arena: &'a ExprArena) -> Vec<&'a str> {
        self.params.iter().map(|&p| var_name(arena, p)).collect()
    }
}

fn var_name(arena: &ExprArena, id: ExprId) -> &str {
    match arena.get(id) {
        Expr::Var { name } => name,
        other => unreachable!("parameter {} is a {}", id, other.kind_name()),
    }
}

/// One arena plus the functions defined over it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub arena: ExprArena,
    functions: BTreeMap<String, Function>,
}

impl Module {
    pub fn new(arena: ExprArena) -> Self {
        Self {
            arena,
            functions: BTreeMap::new(),
        }
    }

    /// Convenience for the common single-function case.
    pub fn with_function(arena: ExprArena, function: Function) -> Self {
        let mut module = Self::new(arena);
        module
            .add_function(function)
            .expect("empty module cannot hold a duplicate");
        module
    }

    pub fn add_function(&mut self, function: Function) -> Result<()> {
        if self.functions.contains_key(&function.name) {
            bail!("module already defines a function named {}", function.name);
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Functions in name order.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(|name| name.as_str())
    }

    /// Swaps in a rewritten body for `name`, keeping the parameters.
    pub fn set_function_body(&mut self, name: &str, body: ExprId) -> Result<()> {
        let function = self
            .functions
            .get_mut(name)
            .with_context(|| format!("module has no function named {name}"))?;
        function.body = body;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_params_must_be_vars() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let c = arena.call_plain("relu", vec![x]);
        let err = Function::new(&arena, "f", vec![x, c], c).unwrap_err();
        assert!(err.to_string().contains("expected a var"), "{err}");
    }

    #[test]
    fn test_duplicate_param_names_rejected() {
        let mut arena = ExprArena::new();
        let a = arena.var("x");
        let b = arena.var("x");
        let body = arena.call_plain("add", vec![a, b]);
        let err = Function::new(&arena, "f", vec![a, b], body).unwrap_err();
        assert!(err.to_string().contains("duplicate parameter"), "{err}");
    }

    #[test]
    fn test_module_rejects_duplicate_function() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let body = arena.call_plain("relu", vec![x]);
        let f = Function::new(&arena, "main", vec![x], body).unwrap();
        let mut module = Module::new(arena);
        module.add_function(f.clone()).unwrap();
        assert!(module.add_function(f).is_err());
    }

    #[test]
    fn test_set_function_body() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let body = arena.call_plain("relu", vec![x]);
        let f = Function::new(&arena, "main", vec![x], body).unwrap();
        let mut module = Module::with_function(arena, f);
        let new_body = module.arena.call_plain("tanh", vec![x]);
        module.set_function_body("main", new_body).unwrap();
        assert_eq!(module.function("main").unwrap().body, new_body);
        assert!(module.set_function_body("nope", new_body).is_err());
    }
}
