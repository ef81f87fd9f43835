//! External-collaborator interfaces: the pretrained feature extractor and
//! the optional depth estimator, plus lightweight built-in implementations
//! for the demo binary and tests. The crate ships no pretrained weights.

use ndarray::{s, Array3, Array4};
use rand::rngs::StdRng;

use crate::kernels::activation::relu;
use crate::kernels::conv::Conv2d;
use crate::kernels::{map_samples, resize};

/// Multi-scale feature extractor boundary.
///
/// `extract` maps an image batch (batch, 3, S, S) to an ordered list of
/// feature maps with ascending channel count and descending resolution,
/// matching `feature_channels()` / `feature_sizes()`.
pub trait FeatureExtractor: Send + Sync {
    fn feature_channels(&self) -> &[usize];
    fn feature_sizes(&self) -> &[usize];
    fn extract(&self, images: &Array4<f32>) -> Vec<Array4<f32>>;
}

/// Monocular depth estimator boundary: (batch, 3, S, S) → (batch, 1, S, S).
pub trait DepthEstimator: Send + Sync {
    fn estimate(&self, images: &Array4<f32>) -> Array4<f32>;
}

/// Seeded strided-conv pyramid: each level halves the resolution with a 2x2
/// average pool and projects to the level's channel count with a 3x3 conv.
/// Deterministic for a given seed; stands in for a pretrained backbone.
pub struct PyramidExtractor {
    convs: Vec<Conv2d>,
    channels: Vec<usize>,
    sizes: Vec<usize>,
}

impl PyramidExtractor {
    pub fn new(rng: &mut StdRng, image_size: usize, channels: &[usize]) -> Self {
        let mut convs = Vec::with_capacity(channels.len());
        let mut sizes = Vec::with_capacity(channels.len());
        let mut in_c = 3;
        let mut size = image_size;
        for &out_c in channels {
            convs.push(Conv2d::init(rng, out_c, in_c, 3, 1, 1, true));
            size = (size / 2).max(1);
            sizes.push(size);
            in_c = out_c;
        }
        Self {
            convs,
            channels: channels.to_vec(),
            sizes,
        }
    }
}

impl FeatureExtractor for PyramidExtractor {
    fn feature_channels(&self) -> &[usize] {
        &self.channels
    }

    fn feature_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn extract(&self, images: &Array4<f32>) -> Vec<Array4<f32>> {
        let mut features = Vec::with_capacity(self.convs.len());
        let mut current = images.clone();
        for conv in &self.convs {
            current = map_samples(&current, |sample: &Array3<f32>| {
                conv.forward(&resize::avg_pool2(sample)).mapv(relu)
            });
            features.push(current.clone());
        }
        features
    }
}

/// Trivial deterministic depth proxy: per-pixel mean over the RGB channels.
pub struct LuminanceDepth;

impl DepthEstimator for LuminanceDepth {
    fn estimate(&self, images: &Array4<f32>) -> Array4<f32> {
        let (n, c, h, w) = images.dim();
        let mut out = Array4::zeros((n, 1, h, w));
        for i in 0..n {
            let mean = images
                .slice(s![i, .., .., ..])
                .sum_axis(ndarray::Axis(0))
                .mapv(|v| v / c as f32);
            out.slice_mut(s![i, 0, .., ..]).assign(&mean);
        }
        out
    }
}
