//! Convolutional gated recurrent unit — the per-node state-update primitive
//! of the graph engine.
//!
//! Given a hidden state `h` and an incoming message `x`, both (C, H, W):
//! 1. one convolution over `[x, h]` yields update gate `z` and reset gate
//!    `r`, each squashed to [0, 1];
//! 2. a second convolution over `[x, r·h]` yields the candidate state
//!    `h_hat` in [−1, 1];
//! 3. `h_new = (1 − z)·h + z·h_hat`.
//!
//! Purely functional and shape-preserving.

use ndarray::{concatenate, s, Array3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::kernels::activation::sigmoid;
use crate::kernels::conv::Conv2d;

#[derive(Clone, Serialize, Deserialize)]
pub struct ConvGru {
    /// Joint gate convolution: [x, h] (2C in) → [z, r] (2C out).
    pub conv_zr: Conv2d,

    /// Candidate convolution: [x, r·h] (2C in) → h_hat (C out).
    pub conv_h: Conv2d,

    hidden_channels: usize,
}

impl ConvGru {
    pub fn zeros(hidden_channels: usize, kernel: usize, padding: usize) -> Self {
        Self {
            conv_zr: Conv2d::zeros(2 * hidden_channels, 2 * hidden_channels, kernel, padding),
            conv_h: Conv2d::zeros(hidden_channels, 2 * hidden_channels, kernel, padding),
            hidden_channels,
        }
    }

    pub fn init(rng: &mut StdRng, hidden_channels: usize, kernel: usize, padding: usize) -> Self {
        Self {
            conv_zr: Conv2d::init(
                rng,
                2 * hidden_channels,
                2 * hidden_channels,
                kernel,
                padding,
                1,
                true,
            ),
            conv_h: Conv2d::init(
                rng,
                hidden_channels,
                2 * hidden_channels,
                kernel,
                padding,
                1,
                true,
            ),
            hidden_channels,
        }
    }

    /// One gated update step. `x` and `h` must both be (C, H, W).
    pub fn forward(&self, x: &Array3<f32>, h: &Array3<f32>) -> Array3<f32> {
        let c = self.hidden_channels;

        let combined = concatenate(Axis(0), &[x.view(), h.view()]).expect("matching (H, W)");
        let zr = self.conv_zr.forward(&combined).mapv(sigmoid);
        let z = zr.slice(s![..c, .., ..]).to_owned();
        let r = zr.slice(s![c.., .., ..]).to_owned();

        let gated_h = &r * h;
        let combined_r = concatenate(Axis(0), &[x.view(), gated_h.view()]).expect("matching (H, W)");
        let h_hat = self.conv_h.forward(&combined_r).mapv(f32::tanh);

        // Convex per-element combination of old state and candidate.
        let retain = z.mapv(|v| 1.0 - v);
        retain * h + z * &h_hat
    }

    /// Gate maps for the given inputs, for inspection: (z, r), both in [0, 1].
    pub fn gates(&self, x: &Array3<f32>, h: &Array3<f32>) -> (Array3<f32>, Array3<f32>) {
        let c = self.hidden_channels;
        let combined = concatenate(Axis(0), &[x.view(), h.view()]).expect("matching (H, W)");
        let zr = self.conv_zr.forward(&combined).mapv(sigmoid);
        (
            zr.slice(s![..c, .., ..]).to_owned(),
            zr.slice(s![c.., .., ..]).to_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_shape_preserving() {
        let mut rng = StdRng::seed_from_u64(11);
        let gru = ConvGru::init(&mut rng, 4, 3, 1);
        let x = Array3::from_elem((4, 5, 7), 0.3);
        let h = Array3::from_elem((4, 5, 7), -0.2);
        let out = gru.forward(&x, &h);
        assert_eq!(out.dim(), (4, 5, 7));
    }

    #[test]
    fn test_gates_bounded() {
        let mut rng = StdRng::seed_from_u64(12);
        let gru = ConvGru::init(&mut rng, 4, 3, 1);
        let x = Array3::from_elem((4, 6, 6), 2.0);
        let h = Array3::from_elem((4, 6, 6), -3.0);
        let (z, r) = gru.gates(&x, &h);
        for &v in z.iter().chain(r.iter()) {
            assert!((0.0..=1.0).contains(&v), "gate out of range: {}", v);
        }
    }

    #[test]
    fn test_zero_weights_halfway_gate() {
        // Zero weights and biases: z = 0.5, h_hat = 0, so h_new = h / 2.
        let gru = ConvGru::zeros(2, 3, 1);
        let x = Array3::zeros((2, 4, 4));
        let h = Array3::from_elem((2, 4, 4), 1.0);
        let out = gru.forward(&x, &h);
        for &v in out.iter() {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_fixed_point() {
        // Zero input and zero state stay zero for any weights with zero bias
        // influence on the candidate path magnitude.
        let mut rng = StdRng::seed_from_u64(13);
        let mut gru = ConvGru::init(&mut rng, 3, 3, 1);
        if let Some(bias) = gru.conv_zr.bias.as_mut() {
            bias.fill(0.0);
        }
        if let Some(bias) = gru.conv_h.bias.as_mut() {
            bias.fill(0.0);
        }
        let x = Array3::zeros((3, 4, 4));
        let h = Array3::zeros((3, 4, 4));
        let out = gru.forward(&x, &h);
        for &v in out.iter() {
            assert!(v.abs() < 1e-7);
        }
    }

    #[test]
    fn test_saturated_update_takes_candidate() {
        // Push z towards 1 with a large positive bias: output approaches
        // tanh(conv_h([x, r·h])) regardless of the old state.
        let mut gru = ConvGru::zeros(1, 1, 0);
        if let Some(bias) = gru.conv_zr.bias.as_mut() {
            bias[0] = 50.0; // z ≈ 1
        }
        if let Some(bias) = gru.conv_h.bias.as_mut() {
            bias[0] = 50.0; // h_hat ≈ 1
        }
        let x = Array3::zeros((1, 2, 2));
        let h = Array3::from_elem((1, 2, 2), -0.9);
        let out = gru.forward(&x, &h);
        for &v in out.iter() {
            assert!((v - 1.0).abs() < 1e-3, "got {}", v);
        }
    }
}
