//! # SALGRAPH
//!
//! Spatio-temporal graph reasoning for saliency prediction.
//!
//! A video (or image) batch flows through an external multi-scale feature
//! extractor, a per-scale projection into a shared hidden space, an
//! iterative graph engine that exchanges attention-weighted messages
//! between frames, and decoder stacks that upsample back to per-frame and
//! sequence-level saliency maps.
//!
//! ## Components
//!
//! 1. **ConvGRU** — convolutional gated recurrent state update per node
//! 2. **GraphProcessor** — intra-frame self-attention + inter-frame gated
//!    message passing with synchronous update rounds
//! 3. **Projector** — multi-scale fusion with optional per-frame
//!    positional embeddings
//! 4. **Depth pathway** — embeds and decodes an external depth estimate,
//!    fused into decoding early, late or at both points
//! 5. **Decoders + mixer** — temporal and global map heads with skip
//!    fusion and peak renormalisation
//!
//! All tensors are `ndarray` arrays; per-sample work fans out with rayon.

pub mod config;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod model;

pub use config::{DepthIntegration, ModelConfig, OutputType};
pub use error::{Result, SalError};
pub use graph::{ConvGru, GraphConfig, GraphProcessor};
pub use model::{SaliencyModel, SaliencyOutput};
