//! Spatio-temporal mixing: reconciles the per-frame saliency maps with the
//! pooled global pathway into a single sequence-level map.

use ndarray::{concatenate, s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::kernels::activation::{relu, sigmoid};
use crate::kernels::conv::Conv2d;
use crate::kernels::norm::BatchNorm2d;
use crate::kernels::resize::bilinear_resize;

use super::decoder::peak_normalise;

/// Mixes, per sequence: the L temporal maps (as channels), the global
/// decoder's map, and the time-pooled fused encoder features.
#[derive(Clone, Serialize, Deserialize)]
pub struct SpatioTemporalMixer {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    head: Conv2d,
    output_size: usize,
}

impl SpatioTemporalMixer {
    pub fn init(
        rng: &mut StdRng,
        hidden: usize,
        sequence_length: usize,
        output_size: usize,
    ) -> Self {
        let in_channels = sequence_length + 1 + hidden;
        let half = (hidden / 2).max(1);
        Self {
            conv1: Conv2d::init(rng, hidden, in_channels, 3, 1, 1, false),
            bn1: BatchNorm2d::new(hidden),
            conv2: Conv2d::init(rng, half, hidden, 3, 1, 1, false),
            bn2: BatchNorm2d::new(half),
            head: Conv2d::init(rng, 1, half, 3, 1, 1, true),
            output_size,
        }
    }

    /// `temporal_maps` is (L, S, S) for one sequence, `global_map` (S, S),
    /// `pooled_features` the time-mean fused features (C, f, f).
    pub fn forward(
        &self,
        temporal_maps: &Array3<f32>,
        global_map: &Array2<f32>,
        pooled_features: &Array3<f32>,
    ) -> Array2<f32> {
        let s_out = self.output_size;
        let global = global_map
            .view()
            .insert_axis(Axis(0))
            .to_owned();
        let features = bilinear_resize(pooled_features, s_out, s_out);

        let stacked = concatenate(
            Axis(0),
            &[temporal_maps.view(), global.view(), features.view()],
        )
        .expect("uniform map resolution");

        let x = self.bn1.forward(&self.conv1.forward(&stacked)).mapv(relu);
        let x = self.bn2.forward(&self.conv2.forward(&x)).mapv(relu);
        let map = self.head.forward(&x).mapv(sigmoid);
        let mut map = map.slice(s![0, .., ..]).to_owned();
        peak_normalise(&mut map);
        map
    }
}
