//! Error type shared by the offload passes.

/// Failures raised while annotating, extracting or packaging a subgraph.
#[derive(thiserror::Error, Debug)]
pub enum OffloadError {
    /// The annotator met a node kind it must not rewrite, e.g. a region
    /// marker already present in its input.
    #[error("Cannot annotate {kind} node for target {target}")]
    UnsupportedNodeKind { kind: String, target: String },
    /// The extractor cannot derive output slots from this body kind.
    #[error("Cannot derive subgraph outputs from a {kind} body")]
    UnsupportedResultShape { kind: String },
    /// The partitioner backend rejected the graph.
    #[error("Partitioner failed: {0}")]
    Partitioner(anyhow::Error),
    #[error("Generic error during offload: {0}")]
    Generic(anyhow::Error),
}

impl From<anyhow::Error> for OffloadError {
    fn from(error: anyhow::Error) -> Self {
        OffloadError::Generic(error)
    }
}

impl OffloadError {
    pub(crate) fn unsupported_node(kind: &str, target: &str) -> Self {
        OffloadError::UnsupportedNodeKind {
            kind: kind.to_string(),
            target: target.to_string(),
        }
    }

    pub(crate) fn unsupported_shape(kind: &str) -> Self {
        OffloadError::UnsupportedResultShape {
            kind: kind.to_string(),
        }
    }
}
