//! Top-level saliency model: wires the external feature extractor, the
//! projector, the graph reasoning engine, the depth pathway and the
//! decoder/mixing stack into one forward pass.
//!
//! Accepts rank-4 (image batch) or rank-5 (sequence batch) input; every
//! shape check runs before any tensor work begins.

use ndarray::{s, Array3, Array4, Array5, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::{ModelConfig, OutputType};
use crate::error::{Result, SalError};
use crate::graph::{GraphConfig, GraphProcessor};
use crate::model::backbone::{DepthEstimator, FeatureExtractor};
use crate::model::decoder::SaliencyDecoder;
use crate::model::depth::DepthPathway;
use crate::model::mixer::SpatioTemporalMixer;
use crate::model::projector::Projector;

/// The model's output maps, populated according to the configured
/// [`OutputType`].
pub struct SaliencyOutput {
    /// Per-frame maps, (batch, L, S, S).
    pub temporal: Option<Array4<f32>>,

    /// Sequence-level map, (batch, S, S).
    pub global: Option<Array3<f32>>,
}

pub struct SaliencyModel {
    config: ModelConfig,
    extractor: Box<dyn FeatureExtractor>,
    depth_estimator: Option<Box<dyn DepthEstimator>>,
    projector: Projector,
    graph: GraphProcessor,
    depth_pathway: Option<DepthPathway>,
    temporal_decoder: SaliencyDecoder,
    global_decoder: SaliencyDecoder,
    mixer: SpatioTemporalMixer,
    fusion_level: usize,
    seed: u64,
    training: bool,
}

impl SaliencyModel {
    /// Build the full model with seeded weight initialisation. All
    /// configuration conflicts surface here, before any forward pass.
    pub fn new(
        config: ModelConfig,
        extractor: Box<dyn FeatureExtractor>,
        depth_estimator: Option<Box<dyn DepthEstimator>>,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;

        let n_scales = extractor.feature_channels().len();
        let fusion_level = config.resolve_fusion_level(n_scales)?;
        let fusion_size = extractor.feature_sizes()[fusion_level];

        if config.depth_integration.enabled() {
            if depth_estimator.is_none() {
                return Err(SalError::config(
                    "depth_integration requires a depth estimator",
                ));
            }
            if fusion_level < 2 {
                return Err(SalError::config(
                    "depth_integration needs two skip scales; fusion_level must be >= 2",
                ));
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let hidden = config.hidden_channels;

        let projector = Projector::init(
            &mut rng,
            extractor.feature_channels(),
            fusion_level,
            fusion_size,
            hidden,
            config.sequence_length,
            config.with_positional_embeddings,
        );

        let graph = GraphProcessor::init(
            &mut rng,
            GraphConfig {
                hidden_channels: hidden,
                sequence_length: config.sequence_length,
                height: fusion_size,
                width: fusion_size,
                neighbor_radius: config.neighbor_radius,
                n_iterations: config.n_iterations,
                with_edge_features: config.with_edge_features,
                with_directional_kernels: config.with_directional_kernels,
            },
        );

        let depth_pathway = config
            .depth_integration
            .enabled()
            .then(|| DepthPathway::init(&mut rng, hidden, fusion_size, config.dropout_rate));

        let temporal_decoder = SaliencyDecoder::init(
            &mut rng,
            hidden,
            fusion_level,
            config.image_size,
            config.depth_integration.fuses_early(),
            config.depth_integration.fuses_late(),
        );
        let global_decoder = SaliencyDecoder::init(
            &mut rng,
            hidden,
            fusion_level,
            config.image_size,
            false,
            false,
        );
        let mixer = SpatioTemporalMixer::init(
            &mut rng,
            hidden,
            config.sequence_length,
            config.image_size,
        );

        Ok(Self {
            config,
            extractor,
            depth_estimator,
            projector,
            graph,
            depth_pathway,
            temporal_decoder,
            global_decoder,
            mixer,
            fusion_level,
            seed,
            training: false,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Enable training-mode stochastic layers (dropout in the depth
    /// pathway). Inference mode is fully deterministic.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Named sub-components an external trainer must exclude from updates.
    pub fn frozen_components(&self) -> Vec<&'static str> {
        let mut frozen = Vec::new();
        if self.config.freeze_encoder {
            frozen.push("encoder");
        }
        if self.config.freeze_temporal_pipeline {
            frozen.push("temporal_pipeline");
        }
        frozen
    }

    /// Run the full pipeline. Rank 4 is an image batch (the frame is
    /// repeated to a synthetic sequence); rank 5 is a video batch whose
    /// sequence axis must match the configured length.
    pub fn forward(&self, x: &ArrayD<f32>) -> Result<SaliencyOutput> {
        let l = self.config.sequence_length;
        let s_in = self.config.image_size;

        let (frames, batch, is_image) = match x.ndim() {
            4 => {
                let view = x
                    .view()
                    .into_dimensionality::<ndarray::Ix4>()
                    .map_err(|_| SalError::shape("rank 4", "non-rank-4 view"))?;
                let (b, c, h, w) = view.dim();
                if c != 3 || h != s_in || w != s_in {
                    return Err(SalError::shape(
                        format!("(batch, 3, {}, {})", s_in, s_in),
                        format!("{:?}", view.dim()),
                    ));
                }
                (view.to_owned(), b, true)
            }
            5 => {
                let view = x
                    .view()
                    .into_dimensionality::<ndarray::Ix5>()
                    .map_err(|_| SalError::shape("rank 5", "non-rank-5 view"))?;
                let (b, seq, c, h, w) = view.dim();
                if seq != l {
                    return Err(SalError::shape(
                        format!("sequence length {}", l),
                        format!("sequence length {}", seq),
                    ));
                }
                if c != 3 || h != s_in || w != s_in {
                    return Err(SalError::shape(
                        format!("(batch, {}, 3, {}, {})", l, s_in, s_in),
                        format!("{:?}", view.dim()),
                    ));
                }
                let flat = view
                    .to_owned()
                    .into_shape_with_order((b * seq, c, h, w))
                    .expect("contiguous frame batch");
                (flat, b, false)
            }
            other => {
                return Err(SalError::shape(
                    "input of rank 4 or 5",
                    format!("rank {}", other),
                ));
            }
        };

        // Encoder + projection run once per distinct frame.
        let features = self.extractor.extract(&frames);
        let projected = self.projector.project(&features)?;
        let mut skips: Vec<Array4<f32>> = self.projector.skip_features(&projected).to_vec();
        let mut fused = self.projector.fuse(&projected);
        tracing::debug!(scales = projected.len(), "features projected and fused");

        // Image inputs become synthetic sequences by repetition.
        if is_image {
            fused = repeat_samples(&fused, l);
            for skip in &mut skips {
                *skip = repeat_samples(skip, l);
            }
        }

        self.projector.add_positional(&mut fused, l);

        // Graph refinement with a residual connection around the engine.
        let sequence = to_sequence(&fused, batch, l);
        let refined = self.graph.forward(&sequence)?;
        let fused = to_flat(&refined, batch, l) + &fused;
        tracing::debug!("graph refinement complete");

        // Depth pathway, one decoded feature map per frame.
        let decoded_depth: Option<Vec<Array3<f32>>> = match &self.depth_pathway {
            Some(pathway) => {
                let estimator = self
                    .depth_estimator
                    .as_ref()
                    .ok_or_else(|| SalError::config("depth estimator missing"))?;
                let mut depth_maps = estimator.estimate(&frames);
                if is_image {
                    depth_maps = repeat_samples(&depth_maps, l);
                }
                let deep = &skips[self.fusion_level - 1];
                let shallow = &skips[self.fusion_level - 2];
                let n = fused.dim().0;
                let training = self.training;
                let seed = self.seed;
                let decoded: Vec<Array3<f32>> = (0..n)
                    .into_par_iter()
                    .map(|i| {
                        // Per-sample seeded stream keeps training-mode
                        // dropout reproducible across forward passes.
                        let mut rng = StdRng::seed_from_u64(seed ^ i as u64);
                        pathway.forward(
                            &depth_maps.slice(s![i, .., .., ..]).to_owned(),
                            &deep.slice(s![i, .., .., ..]).to_owned(),
                            &shallow.slice(s![i, .., .., ..]).to_owned(),
                            training,
                            &mut rng,
                        )
                    })
                    .collect();
                Some(decoded)
            }
            None => None,
        };

        // Pooled pathway shared by both output modes.
        let pooled_fused = time_mean(&fused, batch, l);
        let pooled_skips: Vec<Array4<f32>> =
            skips.iter().map(|skip| time_mean(skip, batch, l)).collect();
        let global_maps: Vec<_> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let sample_skips: Vec<Array3<f32>> = pooled_skips
                    .iter()
                    .map(|skip| skip.slice(s![b, .., .., ..]).to_owned())
                    .collect();
                self.global_decoder.forward(
                    &pooled_fused.slice(s![b, .., .., ..]).to_owned(),
                    &sample_skips,
                    None,
                )
            })
            .collect();

        match self.config.output_type {
            OutputType::Global => {
                let mut global = Array3::zeros((batch, s_in, s_in));
                for (b, map) in global_maps.into_iter().enumerate() {
                    global.slice_mut(s![b, .., ..]).assign(&map);
                }
                Ok(SaliencyOutput {
                    temporal: None,
                    global: Some(global),
                })
            }
            OutputType::Temporal => {
                let n = fused.dim().0;
                let maps: Vec<_> = (0..n)
                    .into_par_iter()
                    .map(|i| {
                        let sample_skips: Vec<Array3<f32>> = skips
                            .iter()
                            .map(|skip| skip.slice(s![i, .., .., ..]).to_owned())
                            .collect();
                        self.temporal_decoder.forward(
                            &fused.slice(s![i, .., .., ..]).to_owned(),
                            &sample_skips,
                            decoded_depth.as_ref().map(|d| &d[i]),
                        )
                    })
                    .collect();

                let mut temporal = Array4::zeros((batch, l, s_in, s_in));
                for (i, map) in maps.iter().enumerate() {
                    temporal.slice_mut(s![i / l, i % l, .., ..]).assign(map);
                }

                // Mix per-frame detail with the pooled pathway.
                let mut global = Array3::zeros((batch, s_in, s_in));
                for (b, global_map) in global_maps.into_iter().enumerate() {
                    let frame_maps = temporal.slice(s![b, .., .., ..]).to_owned();
                    let mixed = self.mixer.forward(
                        &frame_maps,
                        &global_map,
                        &pooled_fused.slice(s![b, .., .., ..]).to_owned(),
                    );
                    global.slice_mut(s![b, .., ..]).assign(&mixed);
                }

                Ok(SaliencyOutput {
                    temporal: Some(temporal),
                    global: Some(global),
                })
            }
        }
    }
}

/// Repeat each sample `times` times: sample b lands at indices
/// `b·times .. (b+1)·times`.
fn repeat_samples(x: &Array4<f32>, times: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let mut out = Array4::zeros((n * times, c, h, w));
    for i in 0..n {
        let sample = x.slice(s![i, .., .., ..]);
        for t in 0..times {
            out.slice_mut(s![i * times + t, .., .., ..]).assign(&sample);
        }
    }
    out
}

/// (batch·L, C, H, W) → (L, batch, C, H, W), frame-major per sample.
fn to_sequence(x: &Array4<f32>, batch: usize, l: usize) -> Array5<f32> {
    let (_, c, h, w) = x.dim();
    let mut out = Array5::zeros((l, batch, c, h, w));
    for b in 0..batch {
        for t in 0..l {
            out.slice_mut(s![t, b, .., .., ..])
                .assign(&x.slice(s![b * l + t, .., .., ..]));
        }
    }
    out
}

/// Inverse of [`to_sequence`].
fn to_flat(x: &Array5<f32>, batch: usize, l: usize) -> Array4<f32> {
    let (_, _, c, h, w) = x.dim();
    let mut out = Array4::zeros((batch * l, c, h, w));
    for b in 0..batch {
        for t in 0..l {
            out.slice_mut(s![b * l + t, .., .., ..])
                .assign(&x.slice(s![t, b, .., .., ..]));
        }
    }
    out
}

/// Mean over the sequence axis: (batch·L, C, H, W) → (batch, C, H, W).
fn time_mean(x: &Array4<f32>, batch: usize, l: usize) -> Array4<f32> {
    let (_, c, h, w) = x.dim();
    let mut out = Array4::zeros((batch, c, h, w));
    let inv = 1.0 / l as f32;
    for b in 0..batch {
        for t in 0..l {
            let frame = x.slice(s![b * l + t, .., .., ..]);
            let mut target = out.slice_mut(s![b, .., .., ..]);
            target += &frame;
        }
        out.slice_mut(s![b, .., .., ..]).mapv_inplace(|v| v * inv);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_roundtrip() {
        let x = Array4::from_shape_fn((6, 2, 2, 2), |(n, _, _, _)| n as f32);
        let seq = to_sequence(&x, 2, 3);
        // batch 1, frame 2 = flat index 1*3 + 2 = 5.
        assert!((seq[[2, 1, 0, 0, 0]] - 5.0).abs() < 1e-6);
        let flat = to_flat(&seq, 2, 3);
        assert_eq!(flat, x);
    }

    #[test]
    fn test_repeat_samples_layout() {
        let x = Array4::from_shape_fn((2, 1, 1, 1), |(n, _, _, _)| n as f32);
        let out = repeat_samples(&x, 3);
        assert_eq!(out.dim().0, 6);
        assert!((out[[2, 0, 0, 0]] - 0.0).abs() < 1e-6);
        assert!((out[[3, 0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_time_mean() {
        let mut x = Array4::zeros((4, 1, 1, 1));
        x[[0, 0, 0, 0]] = 1.0;
        x[[1, 0, 0, 0]] = 3.0;
        x[[2, 0, 0, 0]] = 5.0;
        x[[3, 0, 0, 0]] = 7.0;
        let pooled = time_mean(&x, 2, 2);
        assert!((pooled[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((pooled[[1, 0, 0, 0]] - 6.0).abs() < 1e-6);
    }
}
