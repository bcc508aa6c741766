#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use hssl_burn::data::{load_slide, Slide};
use hssl_burn::model::ModelConfig;
use hssl_burn::training::TrainingConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train a joint histology and expression model on one slide")]
struct Args {
    /// Directory holding image.tif, label.tif and data.gz.
    data_dir: PathBuf,
    #[arg(long, default_value_t = 100)]
    latent_size: usize,
    #[arg(long)]
    spike_prior: bool,
    #[arg(long)]
    anneal_dkl: bool,
    #[arg(long, default_value_t = 0.1)]
    zoom: f64,
    #[arg(long, default_value_t = 50)]
    genes: usize,
    /// Defaults to ./hssl-<timestamp>.
    #[arg(long)]
    output_prefix: Option<PathBuf>,
    /// Checkpoint file, or a checkpoint directory to resume from its latest.
    #[arg(long)]
    state: Option<String>,
    #[arg(long, default_value_t = 100)]
    report_interval: usize,
    #[arg(long, default_value_t = 50000)]
    checkpoint_interval: usize,
    #[arg(long, default_value_t = 1e-3)]
    learning_rate: f64,
    #[arg(long)]
    seed: Option<u64>,
    /// Use the CPU backend.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hssl_burn=info")),
        )
        .init();

    let args = Args::parse();
    let slide = load_slide(&args.data_dir, args.zoom, args.genes)
        .with_context(|| format!("failed to load slide from {}", args.data_dir.display()))?;

    let model = ModelConfig::new(
        args.latent_size,
        slide.num_genes(),
        slide.height(),
        slide.width(),
    );
    let mut config = TrainingConfig::new(model, AdamConfig::new())
        .with_learning_rate(args.learning_rate)
        .with_report_interval(args.report_interval)
        .with_checkpoint_interval(args.checkpoint_interval)
        .with_anneal_dkl(args.anneal_dkl)
        .with_spike_prior(args.spike_prior)
        .with_state(args.state.clone());
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let output_dir = args.output_prefix.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "./hssl-{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S")
        ))
    });

    let last = if args.cpu {
        info!("using device: cpu");
        run::<Autodiff<NdArray<f32>>>(&slide, config, &output_dir, Default::default())?
    } else {
        run_accelerated(&slide, config, &output_dir)?
    };
    info!("finished after iteration {last}");
    Ok(())
}

fn run<B: AutodiffBackend>(
    slide: &Slide,
    config: TrainingConfig,
    output_dir: &Path,
    device: B::Device,
) -> Result<usize> {
    hssl_burn::training::train::<B>(slide, config, output_dir, device)
}

#[cfg(feature = "wgpu")]
fn run_accelerated(slide: &Slide, config: TrainingConfig, output_dir: &Path) -> Result<usize> {
    use burn::backend::wgpu::WgpuDevice;
    use burn::backend::WebGpu;

    let device = WgpuDevice::default();
    info!("using device: {device:?}");
    run::<Autodiff<WebGpu<f32, i32>>>(slide, config, output_dir, device)
}

#[cfg(not(feature = "wgpu"))]
fn run_accelerated(slide: &Slide, config: TrainingConfig, output_dir: &Path) -> Result<usize> {
    info!("built without an accelerated backend, using device: cpu");
    run::<Autodiff<NdArray<f32>>>(slide, config, output_dir, Default::default())
}
