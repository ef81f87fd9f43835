//! Depth pathway: embeds the external depth estimate at the fusion
//! resolution and decodes it back up through transposed convolutions and
//! skip fusion, producing depth features the saliency decoder can absorb
//! early, late or at both points.

use ndarray::{concatenate, Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::kernels::activation::{dropout2d, relu};
use crate::kernels::conv::{Conv2d, ConvTranspose2d};
use crate::kernels::norm::{BatchNorm2d, GroupNorm};
use crate::kernels::resize::bilinear_resize;

const UP_MAX_GROUPS: usize = 16;
const CONV_MAX_GROUPS: usize = 32;

/// Transposed-conv decoder over embedded depth features.
///
/// Three up-stages interleaved with skip-concat convolutions; group norms
/// degrade to the largest valid group count for odd channel widths.
#[derive(Clone, Serialize, Deserialize)]
pub struct DepthDecoder {
    up1: ConvTranspose2d,
    gn_up1: GroupNorm,
    conv1: Conv2d,
    gn1: GroupNorm,
    up2: ConvTranspose2d,
    gn_up2: GroupNorm,
    conv2: Conv2d,
    gn2: GroupNorm,
    up3: ConvTranspose2d,
    gn3: GroupNorm,
    dropout_rate: f32,
}

impl DepthDecoder {
    pub fn init(rng: &mut StdRng, hidden: usize, dropout_rate: f32) -> Self {
        let half = hidden / 2;
        Self {
            up1: ConvTranspose2d::init(rng, hidden, half, 3, 2, 1, 0, false),
            gn_up1: GroupNorm::new(half, UP_MAX_GROUPS),
            conv1: Conv2d::init(rng, hidden, half + hidden, 3, 1, 1, false),
            gn1: GroupNorm::new(hidden, CONV_MAX_GROUPS),
            up2: ConvTranspose2d::init(rng, hidden, half, 3, 2, 1, 1, false),
            gn_up2: GroupNorm::new(half, UP_MAX_GROUPS),
            conv2: Conv2d::init(rng, hidden, half + hidden, 3, 1, 1, false),
            gn2: GroupNorm::new(hidden, CONV_MAX_GROUPS),
            up3: ConvTranspose2d::init(rng, hidden, hidden, 3, 2, 1, 0, false),
            gn3: GroupNorm::new(hidden, CONV_MAX_GROUPS),
            dropout_rate,
        }
    }

    /// Decode one sample. `skip_deep` and `skip_shallow` are the two
    /// projected skip scales directly above the fusion level's resolution.
    pub fn forward(
        &self,
        x: &Array3<f32>,
        skip_deep: &Array3<f32>,
        skip_shallow: &Array3<f32>,
        training: bool,
        rng: &mut impl Rng,
    ) -> Array3<f32> {
        let mut x = self.gn_up1.forward(&self.up1.forward(x)).mapv(relu);
        if training {
            x = dropout2d(&x, self.dropout_rate, rng);
        }
        let x = fuse_skip(&x, skip_deep);
        let mut x = self.gn1.forward(&self.conv1.forward(&x)).mapv(relu);
        if training {
            x = dropout2d(&x, self.dropout_rate, rng);
        }

        let mut x = self.gn_up2.forward(&self.up2.forward(&x)).mapv(relu);
        if training {
            x = dropout2d(&x, self.dropout_rate, rng);
        }
        let x = fuse_skip(&x, skip_shallow);
        let x = self.gn2.forward(&self.conv2.forward(&x)).mapv(relu);

        self.gn3.forward(&self.up3.forward(&x)).mapv(relu)
    }
}

/// Resize to the skip's resolution and concatenate along channels.
fn fuse_skip(x: &Array3<f32>, skip: &Array3<f32>) -> Array3<f32> {
    let (_, h, w) = skip.dim();
    let resized = bilinear_resize(x, h, w);
    concatenate(Axis(0), &[resized.view(), skip.view()]).expect("matching (H, W)")
}

/// Full depth pathway: 1-channel estimate → embedded hidden features →
/// decoded depth features.
#[derive(Clone, Serialize, Deserialize)]
pub struct DepthPathway {
    embed: Conv2d,
    embed_bn: BatchNorm2d,
    decoder: DepthDecoder,
    fusion_size: usize,
}

impl DepthPathway {
    pub fn init(rng: &mut StdRng, hidden: usize, fusion_size: usize, dropout_rate: f32) -> Self {
        Self {
            embed: Conv2d::init(rng, hidden, 1, 3, 1, 1, false),
            embed_bn: BatchNorm2d::new(hidden),
            decoder: DepthDecoder::init(rng, hidden, dropout_rate),
            fusion_size,
        }
    }

    /// `depth_map` is the estimator's (1, S, S) output for one frame.
    pub fn forward(
        &self,
        depth_map: &Array3<f32>,
        skip_deep: &Array3<f32>,
        skip_shallow: &Array3<f32>,
        training: bool,
        rng: &mut impl Rng,
    ) -> Array3<f32> {
        let embedded = bilinear_resize(depth_map, self.fusion_size, self.fusion_size);
        let embedded = self.embed_bn.forward(&self.embed.forward(&embedded)).mapv(relu);
        self.decoder
            .forward(&embedded, skip_deep, skip_shallow, training, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_depth_pathway_shapes() {
        let mut rng = StdRng::seed_from_u64(33);
        let pathway = DepthPathway::init(&mut rng, 8, 4, 0.1);

        let depth = Array3::from_elem((1, 32, 32), 0.6);
        let skip_deep = Array3::from_elem((8, 8, 8), 0.2);
        let skip_shallow = Array3::from_elem((8, 16, 16), 0.3);

        let mut rng2 = StdRng::seed_from_u64(34);
        let out = pathway.forward(&depth, &skip_deep, &skip_shallow, false, &mut rng2);
        // Three up-stages from the 4x4 embedding, pinned to the skip
        // resolutions on the way: 16x16 → up3 → 31x31.
        assert_eq!(out.dim().0, 8);
        assert!(out.dim().1 > 16);
    }

    #[test]
    fn test_eval_mode_deterministic() {
        let mut rng = StdRng::seed_from_u64(35);
        let pathway = DepthPathway::init(&mut rng, 8, 4, 0.5);
        let depth = Array3::from_elem((1, 16, 16), 0.4);
        let skip_deep = Array3::from_elem((8, 8, 8), 0.1);
        let skip_shallow = Array3::from_elem((8, 16, 16), 0.1);

        let mut rng_a = StdRng::seed_from_u64(1);
        let mut rng_b = StdRng::seed_from_u64(2);
        let a = pathway.forward(&depth, &skip_deep, &skip_shallow, false, &mut rng_a);
        let b = pathway.forward(&depth, &skip_deep, &skip_shallow, false, &mut rng_b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_odd_width_group_fallback_does_not_panic() {
        let mut rng = StdRng::seed_from_u64(36);
        // hidden = 12: 12/2 = 6 channels cannot take 16 groups; GroupNorm
        // silently degrades instead of erroring.
        let pathway = DepthPathway::init(&mut rng, 12, 4, 0.0);
        let depth = Array3::from_elem((1, 16, 16), 0.4);
        let skip_deep = Array3::from_elem((12, 8, 8), 0.1);
        let skip_shallow = Array3::from_elem((12, 16, 16), 0.1);
        let mut rng2 = StdRng::seed_from_u64(37);
        let out = pathway.forward(&depth, &skip_deep, &skip_shallow, false, &mut rng2);
        assert_eq!(out.dim().0, 12);
    }
}
