//! Accelerator offload passes over the [`nnir`] expression IR.
//!
//! The pipeline follows the usual bring-your-own-codegen shape. An external
//! [`Partitioner`] decides which nodes a device can run; [`annotate`] fences
//! those nodes with region markers; once the host compiler has isolated the
//! fenced regions into their own functions, [`extract`] re-partitions each
//! one, resolves its externally visible output names and packages it for a
//! [`RuntimeBuilder`].

pub use annotate::{annotate, annotate_body, annotate_module, verify_regions, RegionStats};
pub use error::OffloadError;
pub use extract::{
    compile_subgraph, extract, resolve_output_names, ExtractedSubgraph, SubgraphCodegen,
};
pub use partition::{EligibleSet, ParamMap, Partitioner, SubgraphLayer, SubgraphReport};
pub use runtime::{RuntimeBuilder, RuntimeBundle};
pub use store::{artifact_dir, DirStore, MemStore, SubgraphDescription, SubgraphStore};

pub mod annotate;
pub mod error;
pub mod extract;
pub mod partition;
pub mod runtime;
pub mod store;
pub mod testing;
