//! TIES-Merging - Task arithmetic with sparsification and sign consensus.
//!
//! TIES (TrIm, Elect Sign & merge) improves on basic task arithmetic by:
//! 1. Computing task vectors (delta from base model)
//! 2. Sparsifying by keeping only top `density` parameters by magnitude
//! 3. Electing a sign per parameter and dropping disagreeing contributions
//! 4. Merging the surviving task vectors back into the base
//!
//! Reference: Yadav et al., "TIES-Merging: Resolving Interference When Merging Models" (2023)

use super::{check_shapes, per_model, require_base, task_vectors, MergeContext, MergeMethod};
use crate::{
    sign_consensus, sparsify_by_magnitude, MergeError, ParameterBag, ParameterDef,
    ParameterValue, Result, Tensor,
};

/// TIES merge implementation.
#[derive(Debug, Clone, Default)]
pub struct TiesMerge;

impl TiesMerge {
    /// Create a new TIES merge method.
    pub fn new() -> Self {
        Self
    }

    /// Elect signs over sparse deltas and add the agreeing sum to `base`.
    ///
    /// With `normalize`, each position is divided by the weight that agreed there.
    pub fn merge_task_vectors(
        base: &[f32],
        sparse: &[Vec<f32>],
        weights: &[f32],
        lambda: f32,
        normalize: bool,
    ) -> Result<Vec<f32>> {
        let consensus = sign_consensus(sparse, weights)?;
        Ok(base
            .iter()
            .zip(consensus.mixed.iter().zip(&consensus.weight_sums))
            .map(|(b, (mixed, total))| {
                let delta = if normalize && *total != 0.0 {
                    mixed / total
                } else {
                    *mixed
                };
                b + lambda * delta
            })
            .collect())
    }
}

pub(crate) fn validate_densities(densities: &[f32]) -> Result<()> {
    for (i, &d) in densities.iter().enumerate() {
        if !(0.0..=1.0).contains(&d) {
            return Err(MergeError::InvalidConfig(format!(
                "density[{}] = {} is out of valid range [0.0, 1.0]",
                i, d
            )));
        }
    }
    Ok(())
}

impl MergeMethod for TiesMerge {
    fn name(&self) -> &'static str {
        "ties"
    }

    fn description(&self) -> &'static str {
        "Task arithmetic with sparsification and sign consensus"
    }

    fn requires_base_model(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::optional("lambda", Some(ParameterValue::Number(1.0))),
            ParameterDef::optional("normalize", Some(ParameterValue::Bool(true))),
        ]
    }

    fn per_model_parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::required("weight"),
            ParameterDef::optional("density", Some(ParameterValue::Number(1.0))),
        ]
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

        let densities = per_model(params, tensors.len(), "density", 1.0);
        validate_densities(&densities)?;
        let weights = per_model(params, tensors.len(), "weight", 1.0);

        let base_values = base.to_f32_vec()?;
        let sparse: Vec<Vec<f32>> = task_vectors(&base_values, &tensors)?
            .iter()
            .zip(&densities)
            .map(|(delta, &density)| sparsify_by_magnitude(delta, density))
            .collect();

        let merged = Self::merge_task_vectors(
            &base_values,
            &sparse,
            &weights,
            global.f32("lambda").unwrap_or(1.0),
            global.bool("normalize").unwrap_or(true),
        )?;
        base.with_values(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{bag, close, ctx, t};
    use super::*;

    #[test]
    fn test_ties_drops_disagreeing_sign() {
        // Deltas: [+1, +2], [+3, -1], [-1, +1]; position 0 elects +, position 1 elects +.
        let out = TiesMerge::new()
            .merge(
                vec![t(&[1.0, 2.0]), t(&[3.0, -1.0]), t(&[-1.0, 1.0])],
                Some(t(&[0.0, 0.0])),
                &[
                    bag(&[("weight", 1.0)]),
                    bag(&[("weight", 1.0)]),
                    bag(&[("weight", 1.0)]),
                ],
                &ParameterBag::new(),
                &ctx(),
            )
            .unwrap();
        // Normalized: (1 + 3) / 2 and (2 + 1) / 2.
        assert!(close(&out.to_f32_vec().unwrap(), &[2.0, 1.5]));
    }

    #[test]
    fn test_ties_density_trims_small_deltas() {
        let out = TiesMerge::new()
            .merge(
                vec![t(&[1.0, 0.1, 0.0, -4.0])],
                Some(t(&[0.0; 4])),
                &[bag(&[("weight", 1.0), ("density", 0.5)])],
                &ParameterBag::new(),
                &ctx(),
            )
            .unwrap();
        assert!(close(&out.to_f32_vec().unwrap(), &[1.0, 0.0, 0.0, -4.0]));
    }

    #[test]
    fn test_ties_rejects_bad_density() {
        let err = TiesMerge::new().merge(
            vec![t(&[1.0])],
            Some(t(&[0.0])),
            &[bag(&[("weight", 1.0), ("density", 1.5)])],
            &ParameterBag::new(),
            &ctx(),
        );
        assert!(matches!(err, Err(MergeError::InvalidConfig(_))));
    }
}
