//! Dense NN compute primitives shared by the projector, graph engine and
//! decoders. Per-sample signatures operate on (C, H, W) maps; batching is
//! done by the callers via [`map_samples`].

pub mod activation;
pub mod conv;
pub mod norm;
pub mod resize;

use ndarray::{s, Array3, Array4};
use rayon::prelude::*;

/// Apply a per-sample (C, H, W) → (C', H', W') op across a batch axis,
/// samples in parallel.
pub fn map_samples<F>(x: &Array4<f32>, f: F) -> Array4<f32>
where
    F: Fn(&Array3<f32>) -> Array3<f32> + Sync,
{
    let n = x.dim().0;
    let outputs: Vec<Array3<f32>> = (0..n)
        .into_par_iter()
        .map(|i| f(&x.slice(s![i, .., .., ..]).to_owned()))
        .collect();

    let (c, h, w) = outputs[0].dim();
    let mut out = Array4::zeros((n, c, h, w));
    for (i, sample) in outputs.into_iter().enumerate() {
        out.slice_mut(s![i, .., .., ..]).assign(&sample);
    }
    out
}
