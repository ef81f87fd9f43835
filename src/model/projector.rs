//! Feature projection: maps raw multi-scale encoder features into the
//! shared hidden-channel space, fuses all scales at the configured fusion
//! resolution and optionally adds per-frame positional embeddings.

use ndarray::{concatenate, s, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SalError};
use crate::kernels::activation::relu;
use crate::kernels::conv::Conv2d;
use crate::kernels::norm::BatchNorm2d;
use crate::kernels::resize::bilinear_resize;
use crate::kernels::map_samples;

/// Per-scale projection: 1x1 channel projection followed by two depthwise
/// 3x3 spatial-awareness stages, each conv + BN + ReLU.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProjectionBlock {
    conv_in: Conv2d,
    bn_in: BatchNorm2d,
    dw1: Conv2d,
    bn1: BatchNorm2d,
    dw2: Conv2d,
    bn2: BatchNorm2d,
}

impl ProjectionBlock {
    pub fn init(rng: &mut StdRng, in_channels: usize, hidden: usize) -> Self {
        Self {
            conv_in: Conv2d::init(rng, hidden, in_channels, 1, 0, 1, false),
            bn_in: BatchNorm2d::new(hidden),
            dw1: Conv2d::init(rng, hidden, hidden, 3, 1, hidden, false),
            bn1: BatchNorm2d::new(hidden),
            dw2: Conv2d::init(rng, hidden, hidden, 3, 1, hidden, false),
            bn2: BatchNorm2d::new(hidden),
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let x = self.bn_in.forward(&self.conv_in.forward(x)).mapv(relu);
        let x = self.bn1.forward(&self.dw1.forward(&x)).mapv(relu);
        self.bn2.forward(&self.dw2.forward(&x)).mapv(relu)
    }
}

/// Projects every encoder scale to `hidden` channels, keeps the scales
/// below the fusion level as skip features, and fuses all scales into one
/// per-frame feature map at the fusion resolution.
#[derive(Clone, Serialize, Deserialize)]
pub struct Projector {
    blocks: Vec<ProjectionBlock>,
    fusion_conv: Conv2d,
    fusion_bn: BatchNorm2d,
    fusion_level: usize,
    fusion_size: usize,

    /// Learned per-frame-index bias, (L, C, fusion, fusion).
    positional: Option<Array4<f32>>,
}

impl Projector {
    pub fn init(
        rng: &mut StdRng,
        feature_channels: &[usize],
        fusion_level: usize,
        fusion_size: usize,
        hidden: usize,
        sequence_length: usize,
        with_positional_embeddings: bool,
    ) -> Self {
        let blocks = feature_channels
            .iter()
            .map(|&in_c| ProjectionBlock::init(rng, in_c, hidden))
            .collect::<Vec<_>>();
        let n_scales = feature_channels.len();
        let positional = with_positional_embeddings.then(|| {
            let normal = Normal::new(0.0, 1.0).expect("unit normal");
            Array4::from_shape_fn(
                (sequence_length, hidden, fusion_size, fusion_size),
                |_| normal.sample(rng),
            )
        });
        Self {
            blocks,
            fusion_conv: Conv2d::init(rng, hidden, hidden * n_scales, 1, 0, 1, false),
            fusion_bn: BatchNorm2d::new(hidden),
            fusion_level,
            fusion_size,
            positional,
        }
    }

    /// Project every scale to the hidden width.
    pub fn project(&self, features: &[Array4<f32>]) -> Result<Vec<Array4<f32>>> {
        if features.len() != self.blocks.len() {
            return Err(SalError::shape(
                format!("{} feature scales", self.blocks.len()),
                format!("{} feature scales", features.len()),
            ));
        }
        Ok(features
            .iter()
            .zip(self.blocks.iter())
            .map(|(feat, block)| map_samples(feat, |sample| block.forward(sample)))
            .collect())
    }

    /// Scales below the fusion level, shallowest first; kept for the
    /// decoders' skip connections.
    pub fn skip_features<'a>(&self, projected: &'a [Array4<f32>]) -> &'a [Array4<f32>] {
        &projected[..self.fusion_level]
    }

    /// Resize every projected scale to the fusion resolution, concatenate
    /// along channels and reduce back to the hidden width.
    pub fn fuse(&self, projected: &[Array4<f32>]) -> Array4<f32> {
        let n = projected[0].dim().0;
        let fs = self.fusion_size;

        let mut fused = Array4::zeros((
            n,
            self.fusion_conv.out_channels(),
            fs,
            fs,
        ));
        for i in 0..n {
            let resized: Vec<Array3<f32>> = projected
                .iter()
                .map(|scale| bilinear_resize(&scale.slice(s![i, .., .., ..]).to_owned(), fs, fs))
                .collect();
            let views: Vec<_> = resized.iter().map(|r| r.view()).collect();
            let stacked = concatenate(Axis(0), &views).expect("uniform fusion resolution");
            let out = self
                .fusion_bn
                .forward(&self.fusion_conv.forward(&stacked))
                .mapv(relu);
            fused.slice_mut(s![i, .., .., ..]).assign(&out);
        }
        fused
    }

    /// Add the learned per-frame-index bias. `fused` is (batch·L, C, f, f)
    /// with frame index `n % L`. No-op when embeddings are disabled.
    pub fn add_positional(&self, fused: &mut Array4<f32>, sequence_length: usize) {
        let Some(positional) = &self.positional else {
            return;
        };
        let n = fused.dim().0;
        for i in 0..n {
            let frame = i % sequence_length;
            let mut sample = fused.slice_mut(s![i, .., .., ..]);
            sample += &positional.slice(s![frame, .., .., ..]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn build() -> Projector {
        let mut rng = StdRng::seed_from_u64(21);
        Projector::init(&mut rng, &[4, 8, 12], 1, 8, 6, 3, true)
    }

    fn fake_features() -> Vec<Array4<f32>> {
        vec![
            Array4::from_elem((2, 4, 16, 16), 0.2),
            Array4::from_elem((2, 8, 8, 8), 0.4),
            Array4::from_elem((2, 12, 4, 4), 0.1),
        ]
    }

    #[test]
    fn test_project_and_fuse_shapes() {
        let projector = build();
        let projected = projector.project(&fake_features()).unwrap();
        assert_eq!(projected.len(), 3);
        assert_eq!(projected[0].dim(), (2, 6, 16, 16));
        assert_eq!(projector.skip_features(&projected).len(), 1);

        let fused = projector.fuse(&projected);
        assert_eq!(fused.dim(), (2, 6, 8, 8));
    }

    #[test]
    fn test_scale_count_mismatch_rejected() {
        let projector = build();
        let two_scales = fake_features()[..2].to_vec();
        assert!(projector.project(&two_scales).is_err());
    }

    #[test]
    fn test_positional_bias_varies_with_frame() {
        let projector = build();
        let mut fused = Array4::zeros((3, 6, 8, 8));
        projector.add_positional(&mut fused, 3);
        // Different frame indices received different biases.
        let f0 = fused.slice(s![0, .., .., ..]).to_owned();
        let f1 = fused.slice(s![1, .., .., ..]).to_owned();
        let diff: f32 = (&f0 - &f1).mapv(f32::abs).sum();
        assert!(diff > 1e-3);
    }
}
