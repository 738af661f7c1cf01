//! Persistence of extracted subgraph descriptions.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::partition::SubgraphReport;

// Get the build root from environment variable or use the working directory
pub static BUILD_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    env::var("OFFLOAD_BUILD_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".")) // Default if env var is not set
});

/// Name of the description file inside an artifact directory.
pub const DESCRIPTION_FILE: &str = "subgraph.json";

/// Directory holding the build artifacts of one target, under the build root.
pub fn artifact_dir(target: &str) -> PathBuf {
    BUILD_ROOT.join(format!("{target}_build"))
}

/// Everything a runtime needs to instantiate one offloaded subgraph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphDescription {
    /// Name of the isolated function this subgraph was extracted from.
    pub name: String,
    pub target: String,
    /// Input tensor names, in parameter order.
    pub input_names: Vec<String>,
    /// Externally visible output tensor names, in output order.
    pub output_names: Vec<String>,
    /// The partition report the names were resolved against.
    pub report: SubgraphReport,
}

/// Sink for extracted subgraph descriptions.
pub trait SubgraphStore {
    /// Persists `description` and returns the artifact directory it landed
    /// in, the directory a runtime is later pointed at.
    fn save(&mut self, description: &SubgraphDescription) -> anyhow::Result<PathBuf>;
}

/// Filesystem store writing one `<target>_build` directory per target.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Artifact directory of `target` under this store's root.
    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.root.join(format!("{target}_build"))
    }

    /// Reads a previously saved description back.
    pub fn load(&self, target: &str) -> anyhow::Result<SubgraphDescription> {
        let path = self.target_dir(target).join(DESCRIPTION_FILE);
        let bytes = fs::read(&path)
            .with_context(|| format!("Reading subgraph description from {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Decoding subgraph description from {}", path.display()))
    }
}

impl Default for DirStore {
    fn default() -> Self {
        Self::new(BUILD_ROOT.clone())
    }
}

impl SubgraphStore for DirStore {
    fn save(&mut self, description: &SubgraphDescription) -> anyhow::Result<PathBuf> {
        let dir = self.target_dir(&description.target);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Creating artifact directory {}", dir.display()))?;
        let path = dir.join(DESCRIPTION_FILE);
        let bytes = serde_json::to_vec_pretty(description)
            .context("Encoding subgraph description to store")?;
        fs::write(&path, bytes)
            .with_context(|| format!("Writing subgraph description to {}", path.display()))?;
        debug!("saved subgraph {} to {}", description.name, path.display());
        Ok(dir)
    }
}

/// In-memory store for testing.
#[derive(Debug, Default)]
pub struct MemStore {
    descriptions: HashMap<String, SubgraphDescription>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SubgraphDescription> {
        self.descriptions.get(name)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }
}

impl SubgraphStore for MemStore {
    fn save(&mut self, description: &SubgraphDescription) -> anyhow::Result<PathBuf> {
        self.descriptions
            .insert(description.name.clone(), description.clone());
        Ok(Path::new("mem").join(&description.name))
    }
}
