//! Model merging toolkit.
//!
//! Merges pretrained transformer checkpoints of one architecture family into a
//! new checkpoint. A merge is described by a [`MergeConfig`]: a merge method,
//! the source models (whole, or as layer slices that are stacked in order)
//! and scoped parameters. The configuration is planned into a task graph
//! where every output weight is gathered, merged and saved by its own tasks,
//! and the graph is executed on a bounded worker pool that streams weights
//! into size-limited safetensors shards.
//!
//! # Supported Merge Methods
//!
//! - **Linear**: weighted averaging of parameters
//! - **SLERP**: spherical interpolation from the base model
//! - **Task Arithmetic**: weighted sum of task vectors added to the base
//! - **TIES**: task arithmetic with sparsification and sign consensus
//! - **DARE**: random pruning with rescaling (TIES or linear combination)
//! - **Passthrough**: copies a single source, for stacking layer ranges
//!
//! # Example
//!
//! ```ignore
//! use strata_merge::{run_merge, MergeConfig, MergeOptions};
//!
//! let config = MergeConfig::from_yaml_file("merge.yaml")?;
//! let report = run_merge(&config, "merged_model", &MergeOptions::default()).await?;
//! println!("{} weights written", report.manifest.weight_count());
//! ```

#![warn(missing_docs)]

mod adapter;
mod arch;
mod config;
mod consensus;
mod error;
mod executor;
mod graph;
mod loader;
mod merge;
pub mod methods;
mod model;
mod parameters;
mod plan;
mod sparsify;
mod tasks;
mod tensor;
mod tokenizer;
mod writer;

pub use adapter::*;
pub use arch::*;
pub use config::*;
pub use consensus::*;
pub use error::*;
pub use executor::*;
pub use graph::*;
pub use loader::*;
pub use merge::*;
pub use model::*;
pub use parameters::*;
pub use plan::*;
pub use sparsify::*;
pub use tasks::*;
pub use tensor::*;
pub use tokenizer::*;
pub use writer::*;

/// Re-export merge methods for convenience
pub use methods::{
    create_merge_method, DareMerge, LinearMerge, MergeContext, MergeMethod, PassthroughMerge,
    SlerpMerge, TaskArithmeticMerge, TiesMerge,
};
