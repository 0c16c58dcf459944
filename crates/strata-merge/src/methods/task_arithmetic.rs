use super::{check_shapes, per_model, require_base, task_vectors, MergeContext, MergeMethod};
use crate::{MergeError, ParameterBag, ParameterDef, ParameterValue, Result, Tensor};

/// Task Arithmetic Merging.
///
/// As described in "Editing Models with Task Arithmetic" (Ilharco et al., 2022).
/// Computes task vectors by subtracting the base model from each fine-tuned model,
/// then sums these task vectors (weighted) and adds them back to the base.
///
/// Formula: `W_new = W_base + lambda * sum(w_i * (W_i - W_base))`
///
/// With `normalize`, the sum is divided by the total weight.
#[derive(Debug, Clone, Default)]
pub struct TaskArithmeticMerge;

impl TaskArithmeticMerge {
    /// Create a new Task Arithmetic merge method.
    pub fn new() -> Self {
        Self
    }
}

impl MergeMethod for TaskArithmeticMerge {
    fn name(&self) -> &'static str {
        "task_arithmetic"
    }

    fn description(&self) -> &'static str {
        "Task Arithmetic (Ilharco et al., 2022)"
    }

    fn requires_base_model(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::optional("lambda", Some(ParameterValue::Number(1.0))),
            ParameterDef::optional("normalize", Some(ParameterValue::Bool(false))),
        ]
    }

    fn per_model_parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::required("weight")]
    }

    fn merge(
        &self,
        tensors: Vec<Tensor>,
        base: Option<Tensor>,
        params: &[ParameterBag],
        global: &ParameterBag,
        ctx: &MergeContext<'_>,
    ) -> Result<Tensor> {
        let base = require_base(self, base)?;
        if tensors.is_empty() {
            return Err(MergeError::NotEnoughModels {
                expected: 1,
                actual: 0,
            });
        }
        check_shapes(ctx.tensor_name, &base, &tensors)?;

        let base_values = base.to_f32_vec()?;
        let deltas = task_vectors(&base_values, &tensors)?;
        let weights = per_model(params, tensors.len(), "weight", 1.0);
        let lambda = global.f32("lambda").unwrap_or(1.0);
        let total: f32 = weights.iter().sum();
        let divisor = if global.bool("normalize").unwrap_or(false) && total != 0.0 {
            total
        } else {
            1.0
        };

        let mut merged = base_values;
        for (delta, w) in deltas.iter().zip(&weights) {
            let scale = lambda * w / divisor;
            for (m, d) in merged.iter_mut().zip(delta) {
                *m += scale * d;
            }
        }
        base.with_values(&merged)
    }
}
