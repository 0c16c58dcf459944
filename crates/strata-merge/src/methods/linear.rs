//! Linear merge method - simple weighted averaging.
//!
//! Formula: merged[i] = Σ(weight[j] * model[j][i]) / Σ(weight[j])
//!
//! The division is skipped when `normalize` is false.
//!
//! Best for:
//! - Model soups (averaging checkpoints from the same training run)
//! - Simple model combinations where interference is minimal

use super::{check_shapes, MergeContext, MergeMethod};
use crate::{MergeError, ParameterBag, ParameterDef, ParameterValue, Result, Tensor};

/// Linear merge implementation.
#[derive(Debug, Clone, Default)]
pub struct LinearMerge;

impl LinearMerge {
    /// Create a new linear merge method.
    pub fn new() -> Self {
        Self
    }

    /// Weighted sum of `values`, optionally divided by the weight total.
    pub fn weighted_average(values: &[Vec<f32>], weights: &[f32], normalize: bool) -> Vec<f32> {
        let len = values.first().map_or(0, Vec::len);
        let mut out = vec![0.0_f32; len];
        for (v, &w) in values.iter().zip(weights) {
            for (o, x) in out.iter_mut().zip(v) {
                *o += w * x;
            }
        }

        let total: f32 = weights.iter().sum();
        if normalize && total != 0.0 {
            out.iter_mut().for_each(|o| *o /= total);
        }
        out
    }
}

impl MergeMethod for LinearMerge {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn description(&self) -> &'static str {
        "Simple weighted averaging of parameters"
    }

    fn requires_base_model(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::optional(
            "normalize",
            Some(ParameterValue::Bool(true)),
        )]
    }

    fn per_model_parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::required("weight")]
    }

    fn merge(
        &self,
        tensors: Vec<Tensor>,
        _base: Option<Tensor>,
        params: &[ParameterBag],
        global: &ParameterBag,
        ctx: &MergeContext<'_>,
    ) -> Result<Tensor> {
        let first = tensors.first().ok_or(MergeError::NotEnoughModels {
            expected: 1,
            actual: 0,
        })?;
        check_shapes(ctx.tensor_name, first, &tensors[1..])?;

        let weights = super::per_model(params, tensors.len(), "weight", 1.0);
        let values = tensors
            .iter()
            .map(Tensor::to_f32_vec)
            .collect::<Result<Vec<_>>>()?;
        let normalize = global.bool("normalize").unwrap_or(true);

        first.with_values(&Self::weighted_average(&values, &weights, normalize))
    }
}
