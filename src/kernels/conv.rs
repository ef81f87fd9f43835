//! Dense 2-D convolution primitives on (C, H, W) feature maps.
//!
//! Stride-1 `Conv2d` (with grouped/depthwise support), stride-2
//! `ConvTranspose2d` for the upsampling pathway, and a plain `Linear`
//! projection. All weights are plain ndarray structs with `zeros` and
//! seeded He-normal `init` constructors.

use ndarray::{s, Array1, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Stride-1 2-D convolution.
#[derive(Clone, Serialize, Deserialize)]
pub struct Conv2d {
    /// Kernel: [out_c, in_c / groups, k, k]
    pub weight: Array4<f32>,

    /// Per-output-channel bias, if any.
    pub bias: Option<Array1<f32>>,

    /// Symmetric zero padding.
    pub padding: usize,

    /// Channel groups; `groups == in_c` is depthwise.
    pub groups: usize,
}

impl Conv2d {
    /// Zero-weight convolution. `in_c` must be divisible by `groups`.
    pub fn zeros(out_c: usize, in_c: usize, kernel: usize, padding: usize) -> Self {
        Self::zeros_grouped(out_c, in_c, kernel, padding, 1, true)
    }

    pub fn zeros_grouped(
        out_c: usize,
        in_c: usize,
        kernel: usize,
        padding: usize,
        groups: usize,
        with_bias: bool,
    ) -> Self {
        debug_assert_eq!(in_c % groups, 0);
        debug_assert_eq!(out_c % groups, 0);
        Self {
            weight: Array4::zeros((out_c, in_c / groups, kernel, kernel)),
            bias: with_bias.then(|| Array1::zeros(out_c)),
            padding,
            groups,
        }
    }

    /// He-normal initialised convolution (biases start at zero).
    pub fn init(
        rng: &mut StdRng,
        out_c: usize,
        in_c: usize,
        kernel: usize,
        padding: usize,
        groups: usize,
        with_bias: bool,
    ) -> Self {
        let mut conv = Self::zeros_grouped(out_c, in_c, kernel, padding, groups, with_bias);
        let fan_in = (in_c / groups) * kernel * kernel;
        let normal = he_normal(fan_in);
        conv.weight.mapv_inplace(|_| normal.sample(rng));
        conv
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1 * self.groups
    }

    /// Convolve a (in_c, H, W) map into (out_c, H', W') with
    /// `H' = H + 2·padding − k + 1`. Output channels are computed in
    /// parallel.
    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (in_c, h, w) = x.dim();
        let (out_c, in_per, k, _) = self.weight.dim();
        debug_assert_eq!(in_c, in_per * self.groups, "input channel mismatch");

        let out_h = h + 2 * self.padding - k + 1;
        let out_w = w + 2 * self.padding - k + 1;
        let out_per = out_c / self.groups;
        let pad = self.padding as isize;

        let planes: Vec<Array2<f32>> = (0..out_c)
            .into_par_iter()
            .map(|oc| {
                let group = oc / out_per;
                let in_start = group * in_per;
                let base = self.bias.as_ref().map_or(0.0, |b| b[oc]);
                let mut plane = Array2::zeros((out_h, out_w));
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let mut acc = base;
                        for icl in 0..in_per {
                            for ky in 0..k {
                                let iy = oy as isize + ky as isize - pad;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = ox as isize + kx as isize - pad;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    acc += x[[in_start + icl, iy as usize, ix as usize]]
                                        * self.weight[[oc, icl, ky, kx]];
                                }
                            }
                        }
                        plane[[oy, ox]] = acc;
                    }
                }
                plane
            })
            .collect();

        let mut out = Array3::zeros((out_c, out_h, out_w));
        for (oc, plane) in planes.into_iter().enumerate() {
            out.slice_mut(s![oc, .., ..]).assign(&plane);
        }
        out
    }
}

/// Transposed 2-D convolution (scatter form), for learned upsampling.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConvTranspose2d {
    /// Kernel: [in_c, out_c, k, k]
    pub weight: Array4<f32>,

    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
}

impl ConvTranspose2d {
    pub fn zeros(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        with_bias: bool,
    ) -> Self {
        Self {
            weight: Array4::zeros((in_c, out_c, kernel, kernel)),
            bias: with_bias.then(|| Array1::zeros(out_c)),
            stride,
            padding,
            output_padding,
        }
    }

    pub fn init(
        rng: &mut StdRng,
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        with_bias: bool,
    ) -> Self {
        let mut conv = Self::zeros(in_c, out_c, kernel, stride, padding, output_padding, with_bias);
        let normal = he_normal(in_c * kernel * kernel);
        conv.weight.mapv_inplace(|_| normal.sample(rng));
        conv
    }

    /// Output spatial size for an input of size `n`:
    /// `(n − 1)·stride − 2·padding + k + output_padding`.
    pub fn output_size(&self, n: usize) -> usize {
        let k = self.weight.dim().2;
        (n - 1) * self.stride + k + self.output_padding - 2 * self.padding
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let (in_c, h, w) = x.dim();
        let (w_in, out_c, k, _) = self.weight.dim();
        debug_assert_eq!(in_c, w_in, "input channel mismatch");

        let out_h = self.output_size(h);
        let out_w = self.output_size(w);
        let pad = self.padding as isize;

        let mut out = Array3::zeros((out_c, out_h, out_w));
        for ic in 0..in_c {
            for iy in 0..h {
                for ix in 0..w {
                    let v = x[[ic, iy, ix]];
                    if v == 0.0 {
                        continue;
                    }
                    for oc in 0..out_c {
                        for ky in 0..k {
                            let oy = (iy * self.stride + ky) as isize - pad;
                            if oy < 0 || oy >= out_h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ox = (ix * self.stride + kx) as isize - pad;
                                if ox < 0 || ox >= out_w as isize {
                                    continue;
                                }
                                out[[oc, oy as usize, ox as usize]] +=
                                    v * self.weight[[ic, oc, ky, kx]];
                            }
                        }
                    }
                }
            }
        }

        if let Some(bias) = &self.bias {
            for oc in 0..out_c {
                out.slice_mut(s![oc, .., ..]).mapv_inplace(|v| v + bias[oc]);
            }
        }
        out
    }
}

/// Plain linear projection `y = W·x (+ b)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Linear {
    /// Weight: [out, in]
    pub weight: Array2<f32>,

    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn zeros(out_dim: usize, in_dim: usize, with_bias: bool) -> Self {
        Self {
            weight: Array2::zeros((out_dim, in_dim)),
            bias: with_bias.then(|| Array1::zeros(out_dim)),
        }
    }

    pub fn init(rng: &mut StdRng, out_dim: usize, in_dim: usize, with_bias: bool) -> Self {
        let mut linear = Self::zeros(out_dim, in_dim, with_bias);
        let normal = he_normal(in_dim);
        linear.weight.mapv_inplace(|_| normal.sample(rng));
        linear
    }

    /// Apply to every column of a `[in, n]` matrix at once.
    pub fn forward_cols(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = self.weight.dot(x);
        if let Some(bias) = &self.bias {
            for mut col in out.columns_mut() {
                col += bias;
            }
        }
        out
    }
}

fn he_normal(fan_in: usize) -> Normal<f32> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    // std is finite and positive for any fan_in
    Normal::new(0.0, std).unwrap_or_else(|_| Normal::new(0.0, 1.0).expect("unit normal"))
}
