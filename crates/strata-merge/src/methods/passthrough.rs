use super::{MergeContext, MergeMethod};
use crate::{MergeError, ParameterBag, ParameterDef, Result, Tensor};

/// Passthrough "merge" - copies the single input tensor unchanged.
///
/// Used to assemble models from layer ranges of other models
/// (frankenmerging). An optional per-model `scale` multiplies the weight.
#[derive(Debug, Clone, Default)]
pub struct PassthroughMerge;

impl PassthroughMerge {
    /// Create a new passthrough method.
    pub fn new() -> Self {
        Self
    }
}

impl MergeMethod for PassthroughMerge {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn description(&self) -> &'static str {
        "Copy the tensor of a single source model"
    }

    fn requires_base_model(&self) -> bool {
        false
    }

    fn per_model_parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::optional("scale", None)]
    }

    fn merge(
        &self,
        tensors: Vec<Tensor>,
        _base: Option<Tensor>,
        params: &[ParameterBag],
        _global: &ParameterBag,
        ctx: &MergeContext<'_>,
    ) -> Result<Tensor> {
        let mut tensors = tensors;
        let tensor = match tensors.len() {
            1 => tensors.remove(0),
            0 => {
                return Err(MergeError::NotEnoughModels {
                    expected: 1,
                    actual: 0,
                })
            }
            n => {
                return Err(MergeError::InvalidConfig(format!(
                    "passthrough takes exactly one input for '{}', got {}",
                    ctx.tensor_name, n
                )))
            }
        };

        match params.first().and_then(|p| p.f32("scale")) {
            Some(scale) if scale != 1.0 => {
                let scaled: Vec<f32> = tensor.to_f32_vec()?.iter().map(|v| v * scale).collect();
                tensor.with_values(&scaled)
            }
            _ => Ok(tensor),
        }
    }
}
