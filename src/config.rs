//! Model configuration.
//!
//! All sizing lives here and is passed explicitly to every component at
//! construction — there are no process-wide constants. The graph engine
//! additionally derives the sequence length from the actual input tensor
//! and cross-checks it against this object.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SalError};

/// Where decoded depth features enter the saliency decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthIntegration {
    /// Depth pathway disabled.
    None,
    /// Fused at the deepest decoder stage.
    Early,
    /// Fused just before the final layer.
    Late,
    /// Fused at both points.
    Both,
}

impl DepthIntegration {
    pub fn enabled(&self) -> bool {
        !matches!(self, DepthIntegration::None)
    }

    pub fn fuses_early(&self) -> bool {
        matches!(self, DepthIntegration::Early | DepthIntegration::Both)
    }

    pub fn fuses_late(&self) -> bool {
        matches!(self, DepthIntegration::Late | DepthIntegration::Both)
    }
}

/// Which saliency map(s) the model emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// One map per frame, plus the mixed sequence-level map.
    Temporal,
    /// A single sequence-level map from the pooled pathway only.
    Global,
}

/// Complete configuration surface of the saliency model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Shared feature width used by the projector, graph engine and decoders.
    pub hidden_channels: usize,

    /// Number of frames per sequence (node count L of the temporal chain).
    pub sequence_length: usize,

    /// Input resolution S; frames are (3, S, S).
    pub image_size: usize,

    /// Encoder scale whose resolution the fused features adopt.
    /// `None` picks the middle scale.
    pub fusion_level: Option<usize>,

    /// Temporal neighbourhood radius R: nodes i, j exchange messages when
    /// `|i - j| <= R` and `i != j`. 1 is a Markov chain; 0 disables
    /// message passing entirely.
    pub neighbor_radius: usize,

    /// Graph refinement rounds. 0 makes the graph stage an identity.
    pub n_iterations: usize,

    /// Concatenate the signed index offset `i - j` as an extra message
    /// channel.
    pub with_edge_features: bool,

    /// Add a learned per-frame-index bias before graph iterations.
    pub with_positional_embeddings: bool,

    /// Use separate message kernels for past (`j < i`) and future (`j > i`)
    /// neighbours.
    pub with_directional_kernels: bool,

    /// Depth pathway integration point.
    pub depth_integration: DepthIntegration,

    /// Which output map(s) to produce.
    pub output_type: OutputType,

    /// Dropout probability used by the depth pathway while training.
    pub dropout_rate: f32,

    /// Exclude the feature extractor from external gradient updates.
    pub freeze_encoder: bool,

    /// Exclude the per-frame (temporal) pipeline from external updates.
    pub freeze_temporal_pipeline: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 32,
            sequence_length: 5,
            image_size: 64,
            fusion_level: None,
            neighbor_radius: 1,
            n_iterations: 3,
            with_edge_features: true,
            with_positional_embeddings: false,
            with_directional_kernels: false,
            depth_integration: DepthIntegration::None,
            output_type: OutputType::Temporal,
            dropout_rate: 0.0,
            freeze_encoder: true,
            freeze_temporal_pipeline: false,
        }
    }
}

impl ModelConfig {
    /// Check internal consistency. Called by the model constructor; callers
    /// building components by hand should invoke it themselves.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_channels == 0 {
            return Err(SalError::config("hidden_channels must be non-zero"));
        }
        if self.sequence_length == 0 {
            return Err(SalError::config("sequence_length must be non-zero"));
        }
        if self.image_size == 0 {
            return Err(SalError::config("image_size must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(SalError::config(format!(
                "dropout_rate must lie in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if self.output_type == OutputType::Temporal && self.freeze_temporal_pipeline {
            return Err(SalError::config(
                "output_type = temporal conflicts with freeze_temporal_pipeline: \
                 the frozen pipeline would have to produce the requested output",
            ));
        }
        if self.depth_integration.enabled() && self.hidden_channels % 4 != 0 {
            return Err(SalError::config(
                "depth integration halves and quarters hidden_channels; \
                 hidden_channels must be divisible by 4",
            ));
        }
        Ok(())
    }

    /// Resolve the fusion level against the number of scales the feature
    /// extractor actually provides. Defaults to the middle scale.
    pub fn resolve_fusion_level(&self, n_scales: usize) -> Result<usize> {
        let level = self.fusion_level.unwrap_or(n_scales / 2);
        if level == 0 || level >= n_scales {
            return Err(SalError::config(format!(
                "fusion_level must lie in [1, {}), got {}",
                n_scales, level
            )));
        }
        Ok(level)
    }
}
