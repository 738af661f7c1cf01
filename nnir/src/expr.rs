//! Arena-allocated expression nodes.
//!
//! Every node lives in an [`ExprArena`] and is referred to by its [`ExprId`],
//! the index it was allocated at. The id is the node's identity: two ids are
//! the same node if and only if they are equal, which is what rewrite passes
//! key their caches and eligibility sets on. The arena is append-only, so ids
//! handed out earlier stay valid while a pass grows the tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity of an expression node within one [`ExprArena`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("{_0}")]
pub struct ExprId(pub(crate) usize);

impl ExprId {
    /// The raw arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// An attribute value attached to a call node.
///
/// Attributes are opaque to rewrites: they are carried over verbatim when a
/// call is rebuilt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
}

/// Ordered attribute map of a call node.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Constant tensor payload embedded in the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorValue {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "tensor data length does not match shape {:?}",
            shape
        );
        Self { shape, data }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }
}

/// An expression node.
///
/// The set of kinds is closed on purpose: passes match exhaustively, so a new
/// kind cannot be handled silently. `If` is the representative "other" kind
/// with substructure; traversals recurse through it but no region markers
/// ever attach to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Named input of a function.
    Var { name: String },
    /// Embedded constant (weights, biases).
    Constant { value: TensorValue },
    /// Operator application.
    Call {
        op: String,
        args: Vec<ExprId>,
        attrs: Attributes,
    },
    /// Fixed-arity aggregation of several values.
    Tuple { fields: Vec<ExprId> },
    /// Projection of one field out of a tuple-valued expression.
    TupleGetItem { tuple: ExprId, index: usize },
    /// Conditional; never carries region markers.
    If {
        cond: ExprId,
        then_branch: ExprId,
        else_branch: ExprId,
    },
    /// Marks `body` as flowing INTO the region offloaded to `target`.
    RegionBegin { body: ExprId, target: String },
    /// Marks `body` as the value produced BY the region offloaded to `target`.
    RegionEnd { body: ExprId, target: String },
}

impl Expr {
    /// Kind of this node, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Var { .. } => "var",
            Expr::Constant { .. } => "constant",
            Expr::Call { .. } => "call",
            Expr::Tuple { .. } => "tuple",
            Expr::TupleGetItem { .. } => "tuple_get_item",
            Expr::If { .. } => "if",
            Expr::RegionBegin { .. } => "region_begin",
            Expr::RegionEnd { .. } => "region_end",
        }
    }

    /// True for the two region marker kinds.
    pub fn is_marker(&self) -> bool {
        matches!(self, Expr::RegionBegin { .. } | Expr::RegionEnd { .. })
    }
}

/// Append-only storage for expression nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExprArena {
    nodes: Vec<Expr>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes allocated so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocates `expr` and returns its identity.
    pub fn alloc(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.nodes.len());
        self.nodes.push(expr);
        id
    }

    /// The node behind `id`.
    ///
    /// # Panics
    /// Panics if `id` was issued by a different arena and is out of range.
    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0]
    }

    pub fn var(&mut self, name: impl Into<String>) -> ExprId {
        self.alloc(Expr::Var { name: name.into() })
    }

    pub fn constant(&mut self, value: TensorValue) -> ExprId {
        self.alloc(Expr::Constant { value })
    }

    pub fn call(&mut self, op: impl Into<String>, args: Vec<ExprId>, attrs: Attributes) -> ExprId {
        self.alloc(Expr::Call {
            op: op.into(),
            args,
            attrs,
        })
    }

    /// Call with no attributes.
    pub fn call_plain(&mut self, op: impl Into<String>, args: Vec<ExprId>) -> ExprId {
        self.call(op, args, Attributes::new())
    }

    pub fn tuple(&mut self, fields: Vec<ExprId>) -> ExprId {
        self.alloc(Expr::Tuple { fields })
    }

    pub fn tuple_get_item(&mut self, tuple: ExprId, index: usize) -> ExprId {
        self.alloc(Expr::TupleGetItem { tuple, index })
    }

    pub fn if_node(&mut self, cond: ExprId, then_branch: ExprId, else_branch: ExprId) -> ExprId {
        self.alloc(Expr::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    /// Region marker constructor: `expr` flows into the `target` region.
    pub fn region_begin(&mut self, body: ExprId, target: impl Into<String>) -> ExprId {
        self.alloc(Expr::RegionBegin {
            body,
            target: target.into(),
        })
    }

    /// Region marker constructor: `expr` is produced by the `target` region.
    pub fn region_end(&mut self, body: ExprId, target: impl Into<String>) -> ExprId {
        self.alloc(Expr::RegionEnd {
            body,
            target: target.into(),
        })
    }

    /// Iterates over `(id, node)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (ExprId, &Expr)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (ExprId(i), node))
    }
}

impl std::ops::Index<ExprId> for ExprArena {
    type Output = Expr;

    fn index(&self, id: ExprId) -> &Expr {
        self.get(id)
    }
}
