//! Sign consensus for TIES-style merging.
//!
//! At each position the elected sign is the sign of the sum of the weighted
//! deltas. Contributions whose sign disagrees are discarded and the rest are
//! summed.
//!
//! Reference: "TIES-Merging: Resolving Interference When Merging Models"
//! (Yadav et al., NeurIPS 2023, Algorithm 1 step 3).

use crate::{MergeError, Result};

/// Result of a consensus vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    /// Sum of agreeing weighted contributions.
    pub mixed: Vec<f32>,
    /// Sum of the weights that agreed, per position.
    pub weight_sums: Vec<f32>,
}

/// Elected sign per position: +1, -1, or 0 when the sum cancels.
pub fn majority_sign(weighted: &[Vec<f32>]) -> Result<Vec<f32>> {
    let first = weighted.first().ok_or(MergeError::NotEnoughModels {
        expected: 1,
        actual: 0,
    })?;

    let mut sums = vec![0.0_f32; first.len()];
    for delta in weighted {
        for (s, &v) in sums.iter_mut().zip(delta) {
            *s += v;
        }
    }
    Ok(sums.into_iter().map(sign).collect())
}

/// Sum the contributions of `deltas` (scaled by `weights`) that agree with
/// the elected sign.
pub fn sign_consensus(deltas: &[Vec<f32>], weights: &[f32]) -> Result<Consensus> {
    if deltas.len() != weights.len() {
        return Err(MergeError::InvalidConfig(format!(
            "{} deltas but {} weights",
            deltas.len(),
            weights.len()
        )));
    }

    let weighted: Vec<Vec<f32>> = deltas
        .iter()
        .zip(weights)
        .map(|(d, &w)| d.iter().map(|v| v * w).collect())
        .collect();
    let elected = majority_sign(&weighted)?;

    let mut mixed = vec![0.0_f32; elected.len()];
    let mut weight_sums = vec![0.0_f32; elected.len()];
    for (delta, &w) in weighted.iter().zip(weights) {
        for i in 0..elected.len() {
            if sign(delta[i]) == elected[i] && elected[i] != 0.0 {
                mixed[i] += delta[i];
                weight_sums[i] += w;
            }
        }
    }

    Ok(Consensus { mixed, weight_sums })
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
