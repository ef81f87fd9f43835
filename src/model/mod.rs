//! Model assembly: encoder boundary traits, projection, the depth pathway,
//! decoders, spatio-temporal mixing and the top-level [`SaliencyModel`].

pub mod backbone;
pub mod decoder;
pub mod depth;
pub mod mixer;
pub mod projector;
pub mod saliency;

pub use backbone::{DepthEstimator, FeatureExtractor, LuminanceDepth, PyramidExtractor};
pub use decoder::{peak_normalise, SaliencyDecoder};
pub use depth::DepthPathway;
pub use mixer::SpatioTemporalMixer;
pub use projector::Projector;
pub use saliency::{SaliencyModel, SaliencyOutput};
