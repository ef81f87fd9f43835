//! Pointwise nonlinearities, softmax and dropout.

use ndarray::{Array2, Array3, Axis};
use rand::Rng;

/// Logistic sigmoid. Bounded to (0, 1).
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Row-wise softmax over a `[rows, cols]` matrix.
///
/// Max-subtracted for stability; a degenerate (all `-inf` or zero-sum) row
/// falls back to the uniform distribution so downstream aggregation stays
/// bounded.
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        } else {
            let uniform = 1.0 / row.len() as f32;
            row.fill(uniform);
        }
    }
    out
}

/// Channel-wise inverted dropout on a (C, H, W) map.
///
/// Zeroes whole channels with probability `p` and rescales the survivors by
/// `1 / (1 - p)` so the expected activation is unchanged. Identity when
/// `p == 0`.
pub fn dropout2d(x: &Array3<f32>, p: f32, rng: &mut impl Rng) -> Array3<f32> {
    if p <= 0.0 {
        return x.clone();
    }
    let keep_scale = 1.0 / (1.0 - p);
    let mut out = x.clone();
    for mut channel in out.axis_iter_mut(Axis(0)) {
        if rng.gen::<f32>() < p {
            channel.fill(0.0);
        } else {
            channel.mapv_inplace(|v| v * keep_scale);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sigmoid_bounds() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0) >= 0.0);
    }

    #[test]
    fn test_softmax_rows_normalised() {
        let x = array![[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]];
        let s = softmax_rows(&x);
        for row in s.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        assert!(s[[0, 2]] > s[[0, 1]] && s[[0, 1]] > s[[0, 0]]);
    }

    #[test]
    fn test_softmax_degenerate_row_uniform() {
        let x = array![[f32::NEG_INFINITY, f32::NEG_INFINITY]];
        let s = softmax_rows(&x);
        assert!((s[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((s[[0, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_dropout_identity_at_zero() {
        let x = Array3::from_elem((2, 3, 3), 1.5);
        let mut rng = StdRng::seed_from_u64(7);
        let out = dropout2d(&x, 0.0, &mut rng);
        assert_eq!(out, x);
    }

    #[test]
    fn test_dropout_zeroes_whole_channels() {
        let x = Array3::from_elem((64, 2, 2), 1.0);
        let mut rng = StdRng::seed_from_u64(7);
        let out = dropout2d(&x, 0.5, &mut rng);
        for channel in out.axis_iter(Axis(0)) {
            let sum = channel.sum();
            assert!(sum == 0.0 || (sum - 8.0).abs() < 1e-5, "sum = {}", sum);
        }
        assert!(out.sum() > 0.0);
        assert!(out.iter().any(|&v| v == 0.0));
    }
}
