//! DARE merge method - Drop And REscale.
//!
//! DARE is an alternative to TIES that uses random pruning instead of
//! magnitude-based pruning. It randomly drops a fraction of each delta
//! and rescales the survivors to keep the expected value.
//!
//! Formula:
//! ```text
//! mask = random_uniform() < density
//! sparse_delta = mask * delta / density  (if rescale=true)
//! sparse_delta = mask * delta            (if rescale=false)
//! ```
//!
//! Reference: Yu et al., "Language Models are Super Mario: Absorbing Abilities from Homologous Models as a Free Lunch" (2023)

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::ties::validate_densities;
use super::{
    check_shapes, per_model, require_base, task_vectors, LinearMerge, MergeContext, MergeMethod,
    TiesMerge,
};
use crate::{
    sparsify_random, MergeError, ParameterBag, ParameterDef, ParameterValue, Result, Tensor,
};

/// DARE merge implementation.
#[derive(Debug, Clone)]
pub struct DareMerge {
    /// Whether to use TIES-style sign consensus.
    use_ties_consensus: bool,
}

impl Default for DareMerge {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DareMerge {
    /// Create a new DARE merge method.
    ///
    /// # Arguments
    /// * `use_ties_consensus` - If true, apply TIES sign consensus after random pruning
    pub fn new(use_ties_consensus: bool) -> Self {
        Self { use_ties_consensus }
    }

    /// Create DARE with TIES consensus (dare_ties).
    pub fn with_ties() -> Self {
        Self::new(true)
    }

    /// Create DARE with linear combination (dare_linear).
    pub fn linear() -> Self {
        Self::new(false)
    }
}

impl MergeMethod for DareMerge {
    fn name(&self) -> &'static str {
        if self.use_ties_consensus {
            "dare_ties"
        } else {
            "dare_linear"
        }
    }

    fn description(&self) -> &'static str {
        if self.use_ties_consensus {
            "Random pruning with rescaling and TIES sign consensus"
        } else {
            "Random pruning with rescaling and linear combination"
        }
    }

    fn requires_base_model(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef::optional("lambda", Some(ParameterValue::Number(1.0))),
            ParameterDef::optional(
                "normalize",
                Some(ParameterValue::Bool(self.use_ties_consensus)),
            ),
            ParameterDef::optional("rescale", Some(ParameterValue::Bool(true))),
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
        let rescale = global.bool("rescale").unwrap_or(true);
        let lambda = global.f32("lambda").unwrap_or(1.0);
        let normalize = global.bool("normalize").unwrap_or(self.use_ties_consensus);

        let mut rng = match ctx.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let base_values = base.to_f32_vec()?;
        let sparse: Vec<Vec<f32>> = task_vectors(&base_values, &tensors)?
            .iter()
            .zip(&densities)
            .map(|(delta, &density)| sparsify_random(delta, density, rescale, &mut rng))
            .collect();

        let merged = if self.use_ties_consensus {
            TiesMerge::merge_task_vectors(&base_values, &sparse, &weights, lambda, normalize)?
        } else {
            let delta = LinearMerge::weighted_average(&sparse, &weights, normalize);
            base_values
                .iter()
                .zip(&delta)
                .map(|(b, d)| b + lambda * d)
                .collect()
        };
        base.with_values(&merged)
    }
}
