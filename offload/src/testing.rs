//! Test doubles and graph builders shared by the test suites.

use std::{cell::Cell, collections::BTreeSet};

use anyhow::{bail, Result};
use itertools::Itertools;
use nnir::{
    expr::{Expr, ExprArena, ExprId, TensorValue},
    function::{Function, MAIN},
    visit::postorder,
};
use tracing_subscriber::EnvFilter;

use crate::partition::{ParamMap, Partitioner, SubgraphLayer, SubgraphReport};

pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Flattened view of a function, the "native format" of the mock partitioner.
pub struct OpGraph {
    nodes: Vec<OpNode>,
}

struct OpNode {
    id: ExprId,
    label: String,
    is_input: bool,
}

/// Partitioner double that claims every call whose operator name is in a
/// fixed set.
///
/// Layers are named `<label>_<id>` in traversal order. Vars and constants
/// become internal host layers; in fused mode all claimed nodes collapse
/// into a single layer carrying every claimed id, which is how a real
/// backend reports operator fusion.
pub struct OpSetPartitioner {
    supported: BTreeSet<String>,
    internal_ops: BTreeSet<String>,
    fused: bool,
    partition_calls: Cell<usize>,
}

impl OpSetPartitioner {
    pub fn new<'a>(supported: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            supported: supported.into_iter().map(str::to_string).collect(),
            internal_ops: BTreeSet::new(),
            fused: false,
            partition_calls: Cell::new(0),
        }
    }

    /// Reports all claimed nodes as one fused layer.
    pub fn fused(mut self) -> Self {
        self.fused = true;
        self
    }

    /// Marks layers of this operator as internal bookkeeping.
    pub fn mark_internal(mut self, op: &str) -> Self {
        self.internal_ops.insert(op.to_string());
        self
    }

    /// How many times `partition` has been invoked.
    pub fn partition_count(&self) -> usize {
        self.partition_calls.get()
    }

    fn claims(&self, node: &OpNode) -> bool {
        !node.is_input && self.supported.contains(&node.label)
    }
}

impl Partitioner for OpSetPartitioner {
    type Graph = OpGraph;

    fn to_graph(
        &self,
        arena: &ExprArena,
        function: &Function,
        _params: &ParamMap,
    ) -> Result<OpGraph> {
        let nodes = postorder(arena, function.body)
            .map(|id| {
                let (label, is_input) = match arena.get(id) {
                    Expr::Var { name } => (name.clone(), true),
                    Expr::Constant { .. } => ("constant".to_string(), true),
                    Expr::Call { op, .. } => (op.clone(), false),
                    Expr::Tuple { .. } => ("tuple".to_string(), false),
                    Expr::TupleGetItem { .. } => ("tuple_get_item".to_string(), false),
                    Expr::If { .. } => ("if".to_string(), false),
                    marker => bail!("cannot convert a {} node", marker.kind_name()),
                };
                Ok(OpNode {
                    id,
                    label,
                    is_input,
                })
            })
            .try_collect()?;
        Ok(OpGraph { nodes })
    }

    fn partition(&self, graph: OpGraph, target: &str) -> Result<SubgraphReport> {
        self.partition_calls.set(self.partition_calls.get() + 1);
        let mut layers = Vec::new();
        let mut fused_ids = Vec::new();
        for node in &graph.nodes {
            let claimed = self.claims(node);
            if claimed && self.fused {
                fused_ids.push(node.id);
                continue;
            }
            layers.push(SubgraphLayer {
                name: format!("{}_{}", node.label, node.id.index()),
                target: if claimed { target.to_string() } else { "cpu".to_string() },
                internal: node.is_input || self.internal_ops.contains(&node.label),
                source_ids: vec![node.id],
            });
        }
        if !fused_ids.is_empty() {
            layers.push(SubgraphLayer {
                name: format!("fused_{}_{}", target, fused_ids[0].index()),
                target: target.to_string(),
                internal: false,
                source_ids: fused_ids,
            });
        }
        Ok(SubgraphReport::new(layers))
    }
}

/// Partitioner double that always fails, for error-path tests.
pub struct FailingPartitioner;

impl Partitioner for FailingPartitioner {
    type Graph = ();

    fn to_graph(&self, _: &ExprArena, _: &Function, _: &ParamMap) -> Result<()> {
        Ok(())
    }

    fn partition(&self, _: (), _: &str) -> Result<SubgraphReport> {
        bail!("partitioner backend unavailable")
    }
}

/// `relu(bias_add(conv2d(data, weight), bias))`, the classic single-output
/// chain.
pub fn conv_bias_relu(arena: &mut ExprArena) -> Function {
    let data = arena.var("data");
    let weight = arena.var("weight");
    let bias = arena.var("bias");
    let conv = arena.call_plain("conv2d", vec![data, weight]);
    let biased = arena.call_plain("bias_add", vec![conv, bias]);
    let relu = arena.call_plain("relu", vec![biased]);
    Function::new(arena, MAIN, vec![data, weight, bias], relu)
        .expect("vars are valid parameters")
}

/// Function returning `(relu(conv2d(data, weight)), tanh(data))`, one field
/// claimable and one not.
pub fn two_output_function(arena: &mut ExprArena) -> Function {
    let data = arena.var("data");
    let weight = arena.var("weight");
    let conv = arena.call_plain("conv2d", vec![data, weight]);
    let relu = arena.call_plain("relu", vec![conv]);
    let tanh = arena.call_plain("tanh", vec![data]);
    let tup = arena.tuple(vec![relu, tanh]);
    Function::new(arena, MAIN, vec![data, weight], tup).expect("vars are valid parameters")
}

/// Sample weights for [`conv_bias_relu`].
pub fn conv_params() -> ParamMap {
    let mut params = ParamMap::new();
    params.insert("weight".to_string(), TensorValue::new(vec![2, 2], vec![0.5; 4]));
    params.insert("bias".to_string(), TensorValue::new(vec![2], vec![0.1, -0.1]));
    params
}
