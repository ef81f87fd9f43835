//! End-to-end forward-pass tests over the full model with the built-in
//! pyramid extractor and luminance depth proxy.

use ndarray::{Array, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use salgraph::model::{DepthEstimator, LuminanceDepth, PyramidExtractor};
use salgraph::{DepthIntegration, ModelConfig, OutputType, SaliencyModel};

fn small_config() -> ModelConfig {
    ModelConfig {
        hidden_channels: 8,
        sequence_length: 3,
        image_size: 32,
        neighbor_radius: 1,
        n_iterations: 1,
        ..Default::default()
    }
}

fn build_model(config: ModelConfig, with_depth: bool) -> SaliencyModel {
    let mut rng = StdRng::seed_from_u64(7);
    let extractor = PyramidExtractor::new(&mut rng, config.image_size, &[8, 16, 24, 32]);
    let depth = with_depth.then(|| Box::new(LuminanceDepth) as Box<dyn DepthEstimator>);
    SaliencyModel::new(config, Box::new(extractor), depth, 7).unwrap()
}

fn video_input(batch: usize, l: usize, s: usize, seed: u64) -> Array<f32, IxDyn> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array::from_shape_fn(IxDyn(&[batch, l, 3, s, s]), |_| rng.gen::<f32>())
}

#[test]
fn test_video_forward_temporal_shapes() {
    let model = build_model(small_config(), false);
    let input = video_input(2, 3, 32, 11);
    let output = model.forward(&input).unwrap();

    let temporal = output.temporal.expect("temporal maps");
    assert_eq!(temporal.dim(), (2, 3, 32, 32));
    let global = output.global.expect("mixed global map");
    assert_eq!(global.dim(), (2, 32, 32));

    for &v in temporal.iter().chain(global.iter()) {
        assert!((0.0..=1.0).contains(&v), "map value out of range: {}", v);
    }
}

#[test]
fn test_image_forward_repeats_frame() {
    let model = build_model(small_config(), false);
    let mut rng = StdRng::seed_from_u64(12);
    let input = Array::from_shape_fn(IxDyn(&[1, 3, 32, 32]), |_| rng.gen::<f32>());
    let output = model.forward(&input).unwrap();

    let temporal = output.temporal.expect("temporal maps");
    assert_eq!(temporal.dim(), (1, 3, 32, 32));
}

#[test]
fn test_global_mode_omits_temporal() {
    let config = ModelConfig {
        output_type: OutputType::Global,
        ..small_config()
    };
    let model = build_model(config, false);
    let output = model.forward(&video_input(1, 3, 32, 13)).unwrap();

    assert!(output.temporal.is_none());
    let global = output.global.expect("global map");
    assert_eq!(global.dim(), (1, 32, 32));
}

#[test]
fn test_rank_mismatch_rejected() {
    let model = build_model(small_config(), false);
    let rank3 = Array::<f32, _>::zeros(IxDyn(&[3, 32, 32]));
    assert!(model.forward(&rank3).is_err());
}

#[test]
fn test_wrong_sequence_length_rejected() {
    let model = build_model(small_config(), false);
    let input = video_input(1, 4, 32, 14);
    assert!(model.forward(&input).is_err());
}

#[test]
fn test_wrong_resolution_rejected() {
    let model = build_model(small_config(), false);
    let input = video_input(1, 3, 16, 15);
    assert!(model.forward(&input).is_err());
}

#[test]
fn test_depth_integration_forward() {
    for integration in [
        DepthIntegration::Early,
        DepthIntegration::Late,
        DepthIntegration::Both,
    ] {
        let config = ModelConfig {
            depth_integration: integration,
            ..small_config()
        };
        let model = build_model(config, true);
        let output = model.forward(&video_input(1, 3, 32, 16)).unwrap();
        let temporal = output.temporal.expect("temporal maps");
        assert_eq!(temporal.dim(), (1, 3, 32, 32));
    }
}

#[test]
fn test_depth_without_estimator_rejected() {
    let config = ModelConfig {
        depth_integration: DepthIntegration::Both,
        ..small_config()
    };
    let mut rng = StdRng::seed_from_u64(7);
    let extractor = PyramidExtractor::new(&mut rng, 32, &[8, 16, 24, 32]);
    assert!(SaliencyModel::new(config, Box::new(extractor), None, 7).is_err());
}

#[test]
fn test_forward_is_deterministic_in_eval_mode() {
    let model = build_model(small_config(), false);
    let input = video_input(1, 3, 32, 17);
    let a = model.forward(&input).unwrap();
    let b = model.forward(&input).unwrap();
    assert_eq!(a.temporal.unwrap(), b.temporal.unwrap());
    assert_eq!(a.global.unwrap(), b.global.unwrap());
}

#[test]
fn test_training_forward_reproducible() {
    // Training-mode dropout draws from per-sample seeded streams, so two
    // identical forward passes must agree bit for bit.
    let config = ModelConfig {
        depth_integration: DepthIntegration::Both,
        dropout_rate: 0.25,
        ..small_config()
    };
    let mut model = build_model(config, true);
    model.set_training(true);

    let input = video_input(1, 3, 32, 18);
    let a = model.forward(&input).unwrap();
    let b = model.forward(&input).unwrap();
    assert_eq!(a.temporal.unwrap(), b.temporal.unwrap());
    assert_eq!(a.global.unwrap(), b.global.unwrap());
}

#[test]
fn test_frozen_components_reported() {
    let config = ModelConfig {
        output_type: OutputType::Global,
        freeze_encoder: true,
        freeze_temporal_pipeline: true,
        ..small_config()
    };
    let model = build_model(config, false);
    let frozen = model.frozen_components();
    assert!(frozen.contains(&"encoder"));
    assert!(frozen.contains(&"temporal_pipeline"));
}
