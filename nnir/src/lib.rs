//! Arena-based expression IR for neural network graphs.
//!
//! A graph is an [`ExprArena`] of immutable nodes addressed by [`ExprId`],
//! with [`Function`]s naming a parameter list and a body over that arena.
//! Rewrite passes allocate new nodes instead of mutating old ones, so an id
//! observed before a pass still names the same node after it.

pub use expr::{AttrValue, Attributes, Expr, ExprArena, ExprId, TensorValue};
pub use function::{Function, Module, MAIN};

pub mod expr;
pub mod function;
pub mod visit;
