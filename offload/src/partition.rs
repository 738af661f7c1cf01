//! Partitioner interface and the report it hands back.
//!
//! The partitioner is the external authority on what an accelerator can run.
//! It consumes a function in its own graph format and answers with a flat
//! list of [`SubgraphLayer`]s; everything downstream (annotation eligibility,
//! output naming) is read off that report.

use std::collections::{BTreeMap, HashSet};

use nnir::{ExprArena, ExprId, Function, TensorValue};
use serde::{Deserialize, Serialize};

/// Bound constants of a function, keyed by parameter name.
pub type ParamMap = BTreeMap<String, TensorValue>;

/// One layer of a partitioned graph, as reported by the partitioner.
///
/// `source_ids` traces the layer back to the expression nodes it was built
/// from. Fused layers carry several ids; the first one is the layer's
/// primary node and is the id used when resolving output names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphLayer {
    pub name: String,
    /// Device this layer was assigned to, accelerator target or `cpu`.
    pub target: String,
    /// Internal layers are bookkeeping (inputs, transposes inserted by the
    /// partitioner) and never name an externally visible tensor.
    pub internal: bool,
    pub source_ids: Vec<ExprId>,
}

/// Everything the partitioner says about one function.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgraphReport {
    pub layers: Vec<SubgraphLayer>,
}

impl SubgraphReport {
    pub fn new(layers: Vec<SubgraphLayer>) -> Self {
        Self { layers }
    }

    /// Layers assigned to `target`, in report order.
    pub fn layers_for_target<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = &'a SubgraphLayer> {
        self.layers.iter().filter(move |layer| layer.target == target)
    }

    /// Layers that name externally visible tensors, in report order.
    pub fn visible_layers(&self) -> impl Iterator<Item = &SubgraphLayer> {
        self.layers.iter().filter(|layer| !layer.internal)
    }
}

/// Ids of every node the partitioner assigned to one target.
///
/// All source ids of a matching layer count, so a node swallowed into a
/// fused layer is still eligible on its own.
#[derive(Clone, Debug, Default, PartialEq, Eq, derive_more::From)]
pub struct EligibleSet(#[from] HashSet<ExprId>);

impl EligibleSet {
    /// Flattens the source ids of every layer of `report` assigned to
    /// `target`.
    pub fn for_target(report: &SubgraphReport, target: &str) -> Self {
        report
            .layers_for_target(target)
            .flat_map(|layer| layer.source_ids.iter().copied())
            .collect()
    }

    pub fn contains(&self, id: ExprId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ExprId> for EligibleSet {
    fn from_iter<I: IntoIterator<Item = ExprId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Backend that decides which nodes an accelerator target can run.
///
/// Implementors own the conversion into their native graph format; the rest
/// of the pipeline only ever sees the [`SubgraphReport`].
pub trait Partitioner {
    /// The partitioner's native graph representation.
    type Graph;

    /// Converts `function` (with its bound constants) into the native format.
    fn to_graph(
        &self,
        arena: &ExprArena,
        function: &Function,
        params: &ParamMap,
    ) -> anyhow::Result<Self::Graph>;

    /// Splits `graph` between `target` and the host.
    fn partition(&self, graph: Self::Graph, target: &str) -> anyhow::Result<SubgraphReport>;
}

#[cfg(test)]
mod test {
    use super::*;
    use nnir::expr::ExprArena;

    fn id(arena: &mut ExprArena, name: &str) -> ExprId {
        arena.var(name)
    }

    #[test]
    fn test_eligible_set_flattens_all_source_ids() {
        let mut arena = ExprArena::new();
        let a = id(&mut arena, "a");
        let b = id(&mut arena, "b");
        let c = id(&mut arena, "c");
        let report = SubgraphReport::new(vec![
            SubgraphLayer {
                name: "conv2d_0".into(),
                target: "dpu".into(),
                internal: false,
                source_ids: vec![a, b],
            },
            SubgraphLayer {
                name: "softmax_2".into(),
                target: "cpu".into(),
                internal: false,
                source_ids: vec![c],
            },
        ]);
        let eligible = EligibleSet::for_target(&report, "dpu");
        assert_eq!(eligible.len(), 2);
        assert!(eligible.contains(a));
        assert!(eligible.contains(b));
        assert!(!eligible.contains(c));
    }

    #[test]
    fn test_eligible_set_ignores_internal_flag() {
        let mut arena = ExprArena::new();
        let a = id(&mut arena, "a");
        let report = SubgraphReport::new(vec![SubgraphLayer {
            name: "input_0".into(),
            target: "dpu".into(),
            internal: true,
            source_ids: vec![a],
        }]);
        // Internal only matters for naming, not for eligibility.
        assert!(EligibleSet::for_target(&report, "dpu").contains(a));
    }

    #[test]
    fn test_visible_layers_filter() {
        let report = SubgraphReport::new(vec![
            SubgraphLayer {
                name: "input_0".into(),
                target: "dpu".into(),
                internal: true,
                source_ids: vec![],
            },
            SubgraphLayer {
                name: "conv2d_1".into(),
                target: "dpu".into(),
                internal: false,
                source_ids: vec![],
            },
        ]);
        let visible: Vec<_> = report.visible_layers().map(|l| l.name.as_str()).collect();
        assert_eq!(visible, vec!["conv2d_1"]);
    }
}
