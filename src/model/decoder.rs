//! Saliency decoding: per-frame (temporal) and sequence-pooled (global)
//! decoder stacks that fuse skip features while upsampling, a shared final
//! layer, and per-map peak renormalisation.

use ndarray::{concatenate, Array2, Array3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::kernels::activation::{relu, sigmoid};
use crate::kernels::conv::Conv2d;
use crate::kernels::norm::BatchNorm2d;
use crate::kernels::resize::bilinear_resize;

const PEAK_EPS: f32 = 1e-7;

/// One upsample-and-fuse stage: concat with a skip feature, then two
/// 3x3 conv + BN + ReLU blocks.
#[derive(Clone, Serialize, Deserialize)]
pub struct DecoderBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
}

impl DecoderBlock {
    pub fn init(rng: &mut StdRng, hidden: usize) -> Self {
        Self {
            conv1: Conv2d::init(rng, hidden, hidden * 2, 3, 1, 1, false),
            bn1: BatchNorm2d::new(hidden),
            conv2: Conv2d::init(rng, hidden, hidden, 3, 1, 1, false),
            bn2: BatchNorm2d::new(hidden),
        }
    }

    /// `x` already concatenated with its skip feature (2C channels).
    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let x = self.bn1.forward(&self.conv1.forward(x)).mapv(relu);
        self.bn2.forward(&self.conv2.forward(&x)).mapv(relu)
    }
}

/// Head producing a single sigmoid-bounded map.
#[derive(Clone, Serialize, Deserialize)]
pub struct FinalLayer {
    conv1: Conv2d,
    bn: BatchNorm2d,
    conv2: Conv2d,
}

impl FinalLayer {
    pub fn init(rng: &mut StdRng, hidden: usize) -> Self {
        let half = (hidden / 2).max(1);
        Self {
            conv1: Conv2d::init(rng, half, hidden, 3, 1, 1, false),
            bn: BatchNorm2d::new(half),
            conv2: Conv2d::init(rng, 1, half, 3, 1, 1, true),
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array2<f32> {
        let x = self.bn.forward(&self.conv1.forward(x)).mapv(relu);
        let map = self.conv2.forward(&x).mapv(sigmoid);
        map.index_axis(Axis(0), 0).to_owned()
    }
}

/// Divide a map by its peak (plus epsilon) so the maximum is ≈1. A map that
/// is uniformly zero is left untouched.
pub fn peak_normalise(map: &mut Array2<f32>) {
    let max = map.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        let inv = 1.0 / (max + PEAK_EPS);
        map.mapv_inplace(|v| v * inv);
    }
}

/// A decoder stack walking from the fusion resolution up through the skip
/// scales, with optional depth fusion points.
#[derive(Clone, Serialize, Deserialize)]
pub struct SaliencyDecoder {
    blocks: Vec<DecoderBlock>,
    depth_early: Option<Conv2d>,
    depth_late: Option<Conv2d>,
    final_layer: FinalLayer,
    output_size: usize,
}

impl SaliencyDecoder {
    pub fn init(
        rng: &mut StdRng,
        hidden: usize,
        fusion_level: usize,
        output_size: usize,
        fuse_depth_early: bool,
        fuse_depth_late: bool,
    ) -> Self {
        let blocks = (0..fusion_level.saturating_sub(1))
            .map(|_| DecoderBlock::init(rng, hidden))
            .collect();
        Self {
            blocks,
            depth_early: fuse_depth_early
                .then(|| Conv2d::init(rng, hidden, hidden * 2, 1, 0, 1, false)),
            depth_late: fuse_depth_late
                .then(|| Conv2d::init(rng, hidden, hidden * 2, 1, 0, 1, false)),
            final_layer: FinalLayer::init(rng, hidden),
            output_size,
        }
    }

    /// Decode one sample into a peak-normalised saliency map.
    ///
    /// `skips` are the projected skip scales, shallowest first; the walk
    /// consumes them deepest-first. `depth` is the decoded depth feature
    /// map for this frame, if the pathway is enabled.
    pub fn forward(
        &self,
        fused: &Array3<f32>,
        skips: &[Array3<f32>],
        depth: Option<&Array3<f32>>,
    ) -> Array2<f32> {
        let mut x = fused.clone();

        if let (Some(fuser), Some(depth)) = (&self.depth_early, depth) {
            x = fuse_depth(fuser, &x, depth);
        }

        for (stage, block) in self.blocks.iter().enumerate() {
            let skip = &skips[skips.len() - 1 - stage];
            let (_, h, w) = skip.dim();
            let resized = bilinear_resize(&x, h, w);
            let stacked =
                concatenate(Axis(0), &[resized.view(), skip.view()]).expect("matching (H, W)");
            x = block.forward(&stacked);
        }

        if let (Some(fuser), Some(depth)) = (&self.depth_late, depth) {
            x = fuse_depth(fuser, &x, depth);
        }

        let x = bilinear_resize(&x, self.output_size, self.output_size);
        let mut map = self.final_layer.forward(&x);
        peak_normalise(&mut map);
        map
    }
}

fn fuse_depth(fuser: &Conv2d, x: &Array3<f32>, depth: &Array3<f32>) -> Array3<f32> {
    let (_, h, w) = x.dim();
    let resized = bilinear_resize(depth, h, w);
    let stacked = concatenate(Axis(0), &[x.view(), resized.view()]).expect("matching (H, W)");
    fuser.forward(&stacked).mapv(relu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn build(depth_early: bool, depth_late: bool) -> SaliencyDecoder {
        let mut rng = StdRng::seed_from_u64(50);
        SaliencyDecoder::init(&mut rng, 8, 3, 32, depth_early, depth_late)
    }

    fn skips() -> Vec<Array3<f32>> {
        vec![
            Array3::from_elem((8, 16, 16), 0.2),
            Array3::from_elem((8, 8, 8), 0.4),
            Array3::from_elem((8, 4, 4), 0.1),
        ]
    }

    #[test]
    fn test_decode_output_shape_and_bounds() {
        let decoder = build(false, false);
        let fused = Array3::from_elem((8, 4, 4), 0.5);
        let map = decoder.forward(&fused, &skips()[..2], None);
        assert_eq!(map.dim(), (32, 32));
        for &v in map.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_peak_is_one() {
        let decoder = build(false, false);
        let fused = Array3::from_elem((8, 4, 4), 0.5);
        let map = decoder.forward(&fused, &skips()[..2], None);
        let max = map.iter().copied().fold(0.0f32, f32::max);
        assert!((max - 1.0).abs() < 1e-3, "peak = {}", max);
    }

    #[test]
    fn test_peak_normalise_zero_map_untouched() {
        let mut map = Array2::zeros((4, 4));
        peak_normalise(&mut map);
        assert!(map.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_depth_fusion_changes_output() {
        let decoder = build(true, true);
        let fused = Array3::from_elem((8, 4, 4), 0.5);
        let depth_a = Array3::from_elem((8, 31, 31), 0.0);
        let depth_b = Array3::from_elem((8, 31, 31), 2.0);
        let map_a = decoder.forward(&fused, &skips()[..2], Some(&depth_a));
        let map_b = decoder.forward(&fused, &skips()[..2], Some(&depth_b));
        let diff: f32 = (&map_a - &map_b).mapv(f32::abs).sum();
        assert!(diff > 1e-4);
    }
}
