//! SLERP merge method - Spherical Linear Interpolation.
//!
//! Interpolates from the base model toward one other model along the arc
//! between their (normalized) weight directions.
//!
//! Formula:
//! ```text
//! slerp(A, B, t) = sin((1-t)θ)/sin(θ) * A + sin(tθ)/sin(θ) * B
//! where θ = arccos(A·B / |A||B|)
//! ```
//!
//! Nearly parallel inputs fall back to linear interpolation.

use super::{check_shapes, require_base, MergeContext, MergeMethod};
use crate::{MergeError, ParameterBag, ParameterDef, Result, Tensor};

/// Dot products of normalized inputs above this are treated as parallel.
const DOT_THRESHOLD: f32 = 0.9995;

/// SLERP merge implementation.
#[derive(Debug, Clone, Default)]
pub struct SlerpMerge;

impl SlerpMerge {
    /// Create a new SLERP merge method.
    pub fn new() -> Self {
        Self
    }

    /// Compute SLERP between two vectors.
    ///
    /// # Arguments
    /// * `a` - First vector (t=0)
    /// * `b` - Second vector (t=1)
    /// * `t` - Interpolation factor (0.0 to 1.0)
    pub fn slerp(a: &[f32], b: &[f32], t: f32) -> Vec<f32> {
        let lerp = || -> Vec<f32> {
            a.iter().zip(b).map(|(x, y)| (1.0 - t) * x + t * y).collect()
        };

        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
        let (a_norm, b_norm) = (norm(a), norm(b));
        if a_norm < 1e-8 || b_norm < 1e-8 {
            return lerp();
        }

        let dot: f32 = a
            .iter()
            .zip(b)
            .map(|(x, y)| (x / a_norm) * (y / b_norm))
            .sum::<f32>()
            .clamp(-1.0, 1.0);
        if dot.abs() > DOT_THRESHOLD {
            return lerp();
        }

        let theta = dot.acos();
        let sin_theta = theta.sin();
        let s0 = ((1.0 - t) * theta).sin() / sin_theta;
        let s1 = (t * theta).sin() / sin_theta;

        a.iter().zip(b).map(|(x, y)| s0 * x + s1 * y).collect()
    }
}

impl MergeMethod for SlerpMerge {
    fn name(&self) -> &'static str {
        "slerp"
    }

    fn description(&self) -> &'static str {
        "Spherical linear interpolation between the base and one other model"
    }

    fn requires_base_model(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![ParameterDef::required("t")]
    }

    fn merge(
        &self,
        tensors: Vec<Tensor>,
        base: Option<Tensor>,
        _params: &[ParameterBag],
        global: &ParameterBag,
        ctx: &MergeContext<'_>,
    ) -> Result<Tensor> {
        let base = require_base(self, base)?;
        let mut tensors = tensors;
        if tensors.len() != 1 {
            return Err(MergeError::InvalidConfig(format!(
                "SLERP needs the base and exactly one other model for '{}', got {} others",
                ctx.tensor_name,
                tensors.len()
            )));
        }
        let other = tensors.remove(0);
        check_shapes(ctx.tensor_name, &base, std::slice::from_ref(&other))?;

        let t = global.f32("t").ok_or_else(|| MergeError::MissingParameter {
            parameter: "t".to_string(),
            tensor: ctx.tensor_name.to_string(),
            model: "global".to_string(),
        })?;

        // Endpoints are returned untouched.
        if t <= 0.0 {
            return Ok(base);
        }
        if t >= 1.0 {
            return other.cast(base.dtype());
        }

        let merged = Self::slerp(&base.to_f32_vec()?, &other.to_f32_vec()?, t);
        base.with_values(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{close, ctx, t};
    use super::*;
    use crate::ParameterValue;

    fn at(value: f64) -> ParameterBag {
        ParameterBag::from([("t", ParameterValue::Number(value))])
    }

    #[test]
    fn test_slerp_endpoints_exact() {
        let a = t(&[0.3, -0.7, 1.1]);
        let b = t(&[0.9, 0.2, -0.4]);
        let m = SlerpMerge::new();

        let out = m
            .merge(vec![b.clone()], Some(a.clone()), &[], &at(0.0), &ctx())
            .unwrap();
        assert_eq!(out.data(), a.data());

        let out = m
            .merge(vec![b.clone()], Some(a), &[], &at(1.0), &ctx())
            .unwrap();
        assert_eq!(out.data(), b.data());
    }

    #[test]
    fn test_slerp_midpoint() {
        let out = SlerpMerge::slerp(&[1.0, 0.0], &[0.0, 1.0], 0.5);
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!(close(&out, &[expected, expected]));
    }

    #[test]
    fn test_slerp_parallel_vectors() {
        let out = SlerpMerge::slerp(&[1.0, 0.0], &[2.0, 0.0], 0.5);
        assert!(close(&out, &[1.5, 0.0]));
    }

    #[test]
    fn test_slerp_preserves_shape() {
        let a = Tensor::from_f32(&[1.0; 12], vec![3, 4], safetensors::Dtype::F32).unwrap();
        let b = Tensor::from_f32(&[2.0; 12], vec![3, 4], safetensors::Dtype::F32).unwrap();
        let out = SlerpMerge::new()
            .merge(vec![b], Some(a), &[], &at(0.35), &ctx())
            .unwrap();
        assert_eq!(out.shape(), &[3, 4]);
    }

    #[test]
    fn test_slerp_needs_base() {
        let err = SlerpMerge::new().merge(vec![t(&[1.0])], None, &[], &at(0.5), &ctx());
        assert!(matches!(err, Err(MergeError::BaseModelRequired { .. })));
    }
}
