//! SALGRAPH — spatio-temporal graph saliency.
//!
//! CLI binary: builds the model from a JSON config (or defaults), runs a
//! forward pass over a synthetic batch and reports the output shapes. Real
//! deployments substitute a pretrained extractor for the built-in pyramid.

use anyhow::Context;
use clap::Parser;
use ndarray::{Array, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use salgraph::model::{DepthEstimator, LuminanceDepth, PyramidExtractor};
use salgraph::{ModelConfig, OutputType, SaliencyModel};

/// SALGRAPH demo CLI.
#[derive(Parser, Debug)]
#[command(
    name = "salgraph",
    about = "SALGRAPH — spatio-temporal graph saliency prediction",
    version
)]
struct Cli {
    /// Path to a JSON model configuration. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Batch size of the synthetic input.
    #[arg(short, long, default_value_t = 1)]
    batch: usize,

    /// Feed a single-image batch (rank 4) instead of a video batch.
    #[arg(long, default_value_t = false)]
    image: bool,

    /// Override the configured sequence length.
    #[arg(short = 'l', long)]
    sequence_length: Option<usize>,

    /// Override the configured output mode (temporal | global).
    #[arg(short, long)]
    output: Option<String>,

    /// Weight initialisation seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    tracing::info!("SALGRAPH v{}", env!("CARGO_PKG_VERSION"));

    let mut config: ModelConfig = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path))?
        }
        None => ModelConfig::default(),
    };
    if let Some(l) = cli.sequence_length {
        config.sequence_length = l;
    }
    if let Some(output) = &cli.output {
        config.output_type = match output.as_str() {
            "temporal" => OutputType::Temporal,
            "global" => OutputType::Global,
            other => anyhow::bail!("unknown output mode '{}' (temporal | global)", other),
        };
    }

    tracing::info!(
        "Config: C={}, L={}, S={}, R={}, {} graph iterations, depth={:?}, output={:?}",
        config.hidden_channels,
        config.sequence_length,
        config.image_size,
        config.neighbor_radius,
        config.n_iterations,
        config.depth_integration,
        config.output_type,
    );

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let extractor = PyramidExtractor::new(
        &mut rng,
        config.image_size,
        &[
            config.hidden_channels,
            config.hidden_channels * 2,
            config.hidden_channels * 4,
            config.hidden_channels * 4,
        ],
    );
    let depth_estimator = config
        .depth_integration
        .enabled()
        .then(|| Box::new(LuminanceDepth) as Box<dyn DepthEstimator>);

    let model = SaliencyModel::new(config.clone(), Box::new(extractor), depth_estimator, cli.seed)?;
    if !model.frozen_components().is_empty() {
        tracing::info!("Frozen components: {:?}", model.frozen_components());
    }

    let s = config.image_size;
    let shape: Vec<usize> = if cli.image {
        vec![cli.batch, 3, s, s]
    } else {
        vec![cli.batch, config.sequence_length, 3, s, s]
    };
    let mut input_rng = StdRng::seed_from_u64(cli.seed ^ 0x5a17);
    let input = Array::from_shape_fn(IxDyn(&shape), |_| input_rng.gen::<f32>());

    tracing::info!("Input shape: {:?}", input.shape());
    let start = std::time::Instant::now();
    let output = model.forward(&input)?;
    let elapsed = start.elapsed();

    if let Some(temporal) = &output.temporal {
        tracing::info!("Temporal maps: {:?}", temporal.dim());
    }
    if let Some(global) = &output.global {
        tracing::info!("Global map: {:?}", global.dim());
    }
    tracing::info!("Forward pass took {:.1} ms", elapsed.as_secs_f64() * 1e3);

    Ok(())
}
