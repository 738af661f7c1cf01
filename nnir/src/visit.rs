//! Traversals over arena expressions.

use std::collections::{BTreeMap, HashSet};

use crate::expr::{Expr, ExprArena, ExprId};

/// Direct operands of `expr`, in evaluation order.
pub fn children(expr: &Expr) -> Vec<ExprId> {
    match expr {
        Expr::Var { .. } | Expr::Constant { .. } => vec![],
        Expr::Call { args, .. } => args.clone(),
        Expr::Tuple { fields } => fields.clone(),
        Expr::TupleGetItem { tuple, .. } => vec![*tuple],
        Expr::If {
            cond,
            then_branch,
            else_branch,
        } => vec![*cond, *then_branch, *else_branch],
        Expr::RegionBegin { body, .. } | Expr::RegionEnd { body, .. } => vec![*body],
    }
}

/// Iterator yielding every node reachable from a root exactly once, operands
/// before their users.
///
/// Shared subexpressions are emitted on first encounter only, so the yield
/// order is a valid evaluation order for the DAG.
pub struct Postorder<'a> {
    arena: &'a ExprArena,
    stack: Vec<(ExprId, bool)>,
    visited: HashSet<ExprId>,
}

impl<'a> Postorder<'a> {
    pub fn new(arena: &'a ExprArena, root: ExprId) -> Self {
        Self {
            arena,
            stack: vec![(root, false)],
            visited: HashSet::new(),
        }
    }
}

impl Iterator for Postorder<'_> {
    type Item = ExprId;

    fn next(&mut self) -> Option<ExprId> {
        while let Some((id, expanded)) = self.stack.pop() {
            if expanded {
                return Some(id);
            }
            if !self.visited.insert(id) {
                continue;
            }
            self.stack.push((id, true));
            let operands = children(self.arena.get(id));
            for &child in operands.iter().rev() {
                if !self.visited.contains(&child) {
                    self.stack.push((child, false));
                }
            }
        }
        None
    }
}

/// All nodes reachable from `root`, operands before users.
pub fn postorder(arena: &ExprArena, root: ExprId) -> Postorder<'_> {
    Postorder::new(arena, root)
}

/// Var nodes reachable from `root`, deduplicated, in postorder.
pub fn free_vars(arena: &ExprArena, root: ExprId) -> Vec<ExprId> {
    postorder(arena, root)
        .filter(|&id| matches!(arena.get(id), Expr::Var { .. }))
        .collect()
}

/// Marker tallies over the subtree of one root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarkerCounts {
    pub begins: usize,
    pub ends: usize,
}

/// Counts region markers reachable from `root`, keyed by target tag.
pub fn marker_counts(arena: &ExprArena, root: ExprId) -> BTreeMap<String, MarkerCounts> {
    let mut counts: BTreeMap<String, MarkerCounts> = BTreeMap::new();
    for id in postorder(arena, root) {
        match arena.get(id) {
            Expr::RegionBegin { target, .. } => {
                counts.entry(target.clone()).or_default().begins += 1;
            }
            Expr::RegionEnd { target, .. } => {
                counts.entry(target.clone()).or_default().ends += 1;
            }
            _ => {}
        }
    }
    counts
}
