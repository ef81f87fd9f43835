//! Spatio-temporal graph reasoning: the [`conv_gru::ConvGru`] state-update
//! primitive and the [`processor::GraphProcessor`] refinement engine.

pub mod conv_gru;
pub mod processor;

pub use conv_gru::ConvGru;
pub use processor::{GraphConfig, GraphProcessor};
