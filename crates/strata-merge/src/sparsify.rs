//! Sparsification of task vectors.
//!
//! Sparsification reduces interference when merging models by keeping only
//! a `density` fraction of each delta and zeroing the rest. Two criteria are
//! provided: magnitude (TIES) and uniform random dropping with rescaling
//! (DARE).
//!
//! The magnitude threshold is found with Quickselect, O(n) on average.

use rand::Rng;

/// Index of the threshold element for keeping `density` of `n` values.
fn threshold_rank(n: usize, density: f32) -> usize {
    let k = ((1.0 - density) * n as f32).ceil() as usize;
    k.min(n.saturating_sub(1))
}

/// Keep the top `density` fraction of `values` by magnitude.
///
/// Values whose magnitude ties the threshold are kept, so slightly more than
/// `density` may survive.
pub fn sparsify_by_magnitude(values: &[f32], density: f32) -> Vec<f32> {
    if density >= 1.0 || values.is_empty() {
        return values.to_vec();
    }
    if density <= 0.0 {
        return vec![0.0; values.len()];
    }

    let mut magnitudes: Vec<f32> = values.iter().map(|v| v.abs()).collect();
    let threshold = quickselect(&mut magnitudes, threshold_rank(values.len(), density));

    values
        .iter()
        .map(|&v| if v.abs() >= threshold { v } else { 0.0 })
        .collect()
}

/// Randomly keep each value with probability `density`.
///
/// With `rescale`, survivors are divided by `density` so the expected sum is
/// unchanged.
pub fn sparsify_random<R: Rng + ?Sized>(
    values: &[f32],
    density: f32,
    rescale: bool,
    rng: &mut R,
) -> Vec<f32> {
    if density >= 1.0 {
        return values.to_vec();
    }
    if density <= 0.0 {
        return vec![0.0; values.len()];
    }

    let keep_scale = if rescale { 1.0 / density } else { 1.0 };
    values
        .iter()
        .map(|&v| {
            if rng.gen::<f32>() < density {
                v * keep_scale
            } else {
                0.0
            }
        })
        .collect()
}

/// Find the k-th smallest element using Quickselect.
///
/// `data` is partially reordered.
pub fn quickselect(data: &mut [f32], k: usize) -> f32 {
    if data.len() == 1 {
        return data[0];
    }

    let k = k.min(data.len() - 1);
    let (mut left, mut right) = (0, data.len() - 1);
    loop {
        if left == right {
            return data[left];
        }
        let pivot = partition(data, left, right, median_of_three(data, left, right));
        if k == pivot {
            return data[k];
        } else if k < pivot {
            right = pivot.saturating_sub(1).max(left);
        } else {
            left = pivot + 1;
        }
    }
}

fn median_of_three(data: &[f32], left: usize, right: usize) -> usize {
    let mid = left + (right - left) / 2;
    let (a, b, c) = (data[left], data[mid], data[right]);

    if (a <= b && b <= c) || (c <= b && b <= a) {
        mid
    } else if (b <= a && a <= c) || (c <= a && a <= b) {
        left
    } else {
        right
    }
}

fn partition(data: &mut [f32], left: usize, right: usize, pivot_idx: usize) -> usize {
    let pivot_value = data[pivot_idx];
    data.swap(pivot_idx, right);

    let mut store_idx = left;
    for i in left..right {
        if data[i] < pivot_value {
            data.swap(i, store_idx);
            store_idx += 1;
        }
    }

    data.swap(store_idx, right);
    store_idx
}
