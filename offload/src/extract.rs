//! Subgraph extraction.
//!
//! After partitioning has isolated an offloaded region into its own
//! function, this pass re-partitions that function for its single target,
//! derives the output identities from the body shape, resolves the
//! externally visible tensor names against the partitioner's layer list and
//! persists the description for the device toolchain.
//!
//! The re-partition is deliberate: the isolated function is a different
//! graph than the whole program the annotator saw, so the extractor never
//! reuses the earlier report.

use std::path::PathBuf;

use anyhow::Context;
use nnir::{
    expr::{Expr, ExprArena, ExprId},
    function::Function,
};
use tracing::{debug, warn};

use crate::{
    error::OffloadError,
    partition::{ParamMap, Partitioner, SubgraphReport},
    runtime::{RuntimeBuilder, RuntimeBundle},
    store::{SubgraphDescription, SubgraphStore},
};

/// Converts one isolated function into a partitioner's native format.
pub struct SubgraphCodegen<'a> {
    arena: &'a ExprArena,
    function: &'a Function,
    params: ParamMap,
}

impl<'a> SubgraphCodegen<'a> {
    pub fn new(arena: &'a ExprArena, function: &'a Function) -> Self {
        Self {
            arena,
            function,
            params: ParamMap::new(),
        }
    }

    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    /// Re-partitions the function for `target`.
    pub fn convert<P: Partitioner>(
        &self,
        partitioner: &P,
        target: &str,
    ) -> Result<SubgraphReport, OffloadError> {
        let graph = partitioner
            .to_graph(self.arena, self.function, &self.params)
            .map_err(OffloadError::Partitioner)?;
        partitioner
            .partition(graph, target)
            .map_err(OffloadError::Partitioner)
    }

    /// Identities of the function's results: one per field for a tuple body,
    /// the body itself for a call body. Any other shape has no defined
    /// output slots.
    pub fn output_ids(&self) -> Result<Vec<ExprId>, OffloadError> {
        match self.arena.get(self.function.body) {
            Expr::Tuple { fields } => Ok(fields.clone()),
            Expr::Call { .. } => Ok(vec![self.function.body]),
            other => Err(OffloadError::unsupported_shape(other.kind_name())),
        }
    }
}

/// Resolves output tensor names against the layer list.
///
/// A non-internal layer names an output when its primary source id (the
/// first one) is among `output_ids`; names accumulate in layer order. An
/// output id no layer answers for is dropped from the result, so the caller
/// may receive fewer names than ids.
pub fn resolve_output_names(report: &SubgraphReport, output_ids: &[ExprId]) -> Vec<String> {
    let mut names = Vec::new();
    for layer in report.visible_layers() {
        if let Some(&primary) = layer.source_ids.first() {
            if output_ids.contains(&primary) {
                names.push(layer.name.clone());
            }
        }
    }
    if names.len() < output_ids.len() {
        warn!(
            "resolved {} output names for {} output ids; partitioner layers do not cover the body outputs",
            names.len(),
            output_ids.len()
        );
    }
    names
}

/// Product of one extraction.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedSubgraph {
    pub description: SubgraphDescription,
    /// Identities of the function's top-level results, in result order.
    pub output_ids: Vec<ExprId>,
    /// Where the description was persisted.
    pub artifact_dir: PathBuf,
}

/// Extracts the subgraph of `function` for `target` and persists its
/// description through `store`.
pub fn extract<P: Partitioner, S: SubgraphStore>(
    arena: &ExprArena,
    function: &Function,
    params: &ParamMap,
    partitioner: &P,
    store: &mut S,
    target: &str,
) -> Result<ExtractedSubgraph, OffloadError> {
    let codegen = SubgraphCodegen::new(arena, function).with_params(params.clone());
    let report = codegen.convert(partitioner, target)?;
    let output_ids = codegen.output_ids()?;
    let output_names = resolve_output_names(&report, &output_ids);
    debug!(
        "extracted {} for {}: {} output ids resolved to {:?}",
        function.name,
        target,
        output_ids.len(),
        output_names
    );
    let description = SubgraphDescription {
        name: function.name.clone(),
        target: target.to_string(),
        input_names: function
            .param_names(arena)
            .into_iter()
            .map(str::to_string)
            .collect(),
        output_names,
        report,
    };
    let artifact_dir = store
        .save(&description)
        .context("Persisting subgraph description")?;
    Ok(ExtractedSubgraph {
        description,
        output_ids,
        artifact_dir,
    })
}

/// Full codegen entry point for one offloaded function: extract, persist,
/// and hand the bundle to the runtime builder.
pub fn compile_subgraph<P, S, R>(
    arena: &ExprArena,
    function: &Function,
    params: &ParamMap,
    partitioner: &P,
    store: &mut S,
    runtime: &R,
    target: &str,
) -> Result<R::Module, OffloadError>
where
    P: Partitioner,
    S: SubgraphStore,
    R: RuntimeBuilder,
{
    let extracted = extract(arena, function, params, partitioner, store, target)?;
    let bundle = RuntimeBundle::new(&extracted.description, extracted.artifact_dir);
    let module = runtime.build(bundle).context("Building runtime module")?;
    Ok(module)
}
