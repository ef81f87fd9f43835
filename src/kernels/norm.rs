//! Normalisation layers: inference-mode batch norm, group norm with a
//! graceful group-count fallback, and fixed-volume layer norm.

use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};

const NORM_EPS: f32 = 1e-5;

/// Inference-mode batch normalisation: an affine transform driven by
/// externally-trained running statistics.
#[derive(Clone, Serialize, Deserialize)]
pub struct BatchNorm2d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    /// Identity-initialised norm (unit scale, zero shift, unit variance).
    pub fn new(channels: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            eps: NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mut out = x.clone();
        for (c, mut plane) in out.outer_iter_mut().enumerate() {
            let inv_std = 1.0 / (self.running_var[c] + self.eps).sqrt();
            let mean = self.running_mean[c];
            let gamma = self.gamma[c];
            let beta = self.beta[c];
            plane.mapv_inplace(|v| (v - mean) * inv_std * gamma + beta);
        }
        out
    }
}

/// Group normalisation over (C, H, W).
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub num_groups: usize,
    pub eps: f32,
}

impl GroupNorm {
    /// Build with at most `max_groups` groups. A count that does not divide
    /// `channels` degrades to the largest valid divisor rather than
    /// erroring.
    pub fn new(channels: usize, max_groups: usize) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            num_groups: largest_valid_groups(channels, max_groups),
            eps: NORM_EPS,
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (c, _, _) = x.dim();
        let per_group = c / self.num_groups;
        let mut out = x.clone();
        for g in 0..self.num_groups {
            let start = g * per_group;
            let slab = x.slice(ndarray::s![start..start + per_group, .., ..]);
            let mean = slab.mean().unwrap_or(0.0);
            let var = slab.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for cl in 0..per_group {
                let channel = start + cl;
                let gamma = self.gamma[channel];
                let beta = self.beta[channel];
                out.slice_mut(ndarray::s![channel, .., ..])
                    .mapv_inplace(|v| (v - mean) * inv_std * gamma + beta);
            }
        }
        out
    }
}

/// Largest group count `<= max_groups` that evenly divides `channels`.
pub fn largest_valid_groups(channels: usize, max_groups: usize) -> usize {
    let mut groups = max_groups.min(channels).max(1);
    while channels % groups != 0 && groups > 1 {
        groups -= 1;
    }
    groups
}

/// Layer normalisation over a full fixed-shape (C, H, W) volume, with
/// per-element affine parameters.
#[derive(Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    pub gamma: Array3<f32>,
    pub beta: Array3<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            gamma: Array3::ones((channels, height, width)),
            beta: Array3::zeros((channels, height, width)),
            eps: NORM_EPS,
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.gamma.dim()
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let mean = x.mean().unwrap_or(0.0);
        let var = x.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
        let inv_std = 1.0 / (var + self.eps).sqrt();
        let normalised = x.mapv(|v| (v - mean) * inv_std);
        &normalised * &self.gamma + &self.beta
    }
}
