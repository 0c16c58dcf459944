//! Merge method implementations.
//!
//! Each method declares the parameters it reads, globally and per model, and
//! combines the gathered weights for one output tensor. Methods that need a
//! base model receive the base weight separately from the others.

mod dare;
mod linear;
mod passthrough;
mod slerp;
mod task_arithmetic;
mod ties;

pub use dare::DareMerge;
pub use linear::LinearMerge;
pub use passthrough::PassthroughMerge;
pub use slerp::SlerpMerge;
pub use task_arithmetic::TaskArithmeticMerge;
pub use ties::TiesMerge;

use std::fmt;
use std::sync::Arc;

use crate::{MergeError, MergeMethodConfig, ParameterBag, ParameterDef, Result, Tensor};

/// Per-tensor context handed to a merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Output weight name.
    pub tensor_name: &'a str,
    /// Seed for stochastic methods, already specific to this tensor.
    pub seed: Option<u64>,
}

/// Trait for merge method implementations.
pub trait MergeMethod: Send + Sync + fmt::Debug {
    /// Name of the merge method.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Whether this method requires a base model.
    fn requires_base_model(&self) -> bool;

    /// Parameters resolved once per tensor.
    fn parameters(&self) -> Vec<ParameterDef> {
        Vec::new()
    }

    /// Parameters resolved per tensor and model.
    fn per_model_parameters(&self) -> Vec<ParameterDef> {
        Vec::new()
    }

    /// Merge a set of tensors.
    ///
    /// # Arguments
    /// * `tensors` - Tensors to merge, excluding the base when the method uses one
    /// * `base` - Base model tensor, for methods that require it
    /// * `params` - Per-model parameters, aligned with `tensors`
    /// * `global` - Global parameters
    fn merge(
        &self,
        tensors: Vec<Tensor>,
        base: Option<Tensor>,
        params: &[ParameterBag],
        global: &ParameterBag,
        ctx: &MergeContext<'_>,
    ) -> Result<Tensor>;
}

/// Instantiate the method named in a configuration.
pub fn create_merge_method(config: MergeMethodConfig) -> Arc<dyn MergeMethod> {
    match config {
        MergeMethodConfig::Linear => Arc::new(LinearMerge::new()),
        MergeMethodConfig::Slerp => Arc::new(SlerpMerge::new()),
        MergeMethodConfig::TaskArithmetic => Arc::new(TaskArithmeticMerge::new()),
        MergeMethodConfig::Ties => Arc::new(TiesMerge::new()),
        MergeMethodConfig::DareTies => Arc::new(DareMerge::with_ties()),
        MergeMethodConfig::DareLinear => Arc::new(DareMerge::linear()),
        MergeMethodConfig::Passthrough => Arc::new(PassthroughMerge::new()),
    }
}

/// Fail unless every tensor has the reference shape.
pub(crate) fn check_shapes(name: &str, reference: &Tensor, others: &[Tensor]) -> Result<()> {
    for t in others {
        if t.shape() != reference.shape() {
            return Err(MergeError::ShapeMismatch {
                name: name.to_string(),
                expected: reference.shape().to_vec(),
                actual: t.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Decode `tensors` and their deltas from `base`.
pub(crate) fn task_vectors(base: &[f32], tensors: &[Tensor]) -> Result<Vec<Vec<f32>>> {
    tensors
        .iter()
        .map(|t| {
            Ok(t.to_f32_vec()?
                .iter()
                .zip(base)
                .map(|(v, b)| v - b)
                .collect())
        })
        .collect()
}

/// The per-model value of `name`, or `default` when absent.
pub(crate) fn per_model(params: &[ParameterBag], count: usize, name: &str, default: f32) -> Vec<f32> {
    (0..count)
        .map(|i| params.get(i).and_then(|p| p.f32(name)).unwrap_or(default))
        .collect()
}

pub(crate) fn require_base(method: &dyn MergeMethod, base: Option<Tensor>) -> Result<Tensor> {
    base.ok_or_else(|| MergeError::BaseModelRequired {
        method: method.name().to_string(),
    })
}
