//! Hand-off from extraction to an accelerator runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::store::SubgraphDescription;

/// The tuple a runtime constructor is owed after extraction: which symbol to
/// serve, where its artifacts live, which device runs it and which tensor
/// names its outputs answer to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeBundle {
    /// Global symbol of the offloaded function.
    pub symbol: String,
    /// Directory the subgraph description was persisted in.
    pub artifact_dir: PathBuf,
    pub target: String,
    /// Externally visible output tensor names, in layer order.
    pub output_names: Vec<String>,
}

impl RuntimeBundle {
    pub fn new(description: &SubgraphDescription, artifact_dir: PathBuf) -> Self {
        Self {
            symbol: description.name.clone(),
            artifact_dir,
            target: description.target.clone(),
            output_names: description.output_names.clone(),
        }
    }
}

/// Backend that turns a bundle into an executable module.
pub trait RuntimeBuilder {
    type Module;

    fn build(&self, bundle: RuntimeBundle) -> anyhow::Result<Self::Module>;
}
