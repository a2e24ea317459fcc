mod config;
mod data;
mod diffusion;
mod error;
mod inference;
mod metrics;
mod model_artifacts;
mod models;
mod train;

use clap::Parser;
use config::TrainConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ddpm-candle: train and sample a denoising diffusion model on an image folder",
    after_help = "EXAMPLES:
    # Train on data/train/<class>/*.png with default settings
    cargo run --release -- --train

    # Train with custom hyperparameters
    cargo run --release -- --train --dataset-path ./landscapes --epochs 100 --batch-size 8 --image-size 32

    # Generate a grid of samples from saved weights
    cargo run --release -- --sample --weights models/DDPM_Unconditional/ckpt.safetensors --num-samples 16"
)]
struct Args {
    /// Train the model on an image folder
    #[arg(long)]
    train: bool,

    /// Generate samples from saved weights
    #[arg(long)]
    sample: bool,

    /// Root of the image folder (one subdirectory per class)
    #[arg(long)]
    dataset_path: Option<PathBuf>,

    /// Name of the run; outputs go to models/<run>, results/<run> and runs/<run>
    #[arg(long)]
    run_name: Option<String>,

    /// Number of epochs for training (default: 500)
    #[arg(long)]
    epochs: Option<usize>,

    /// Batch size for training (default: 12)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Learning rate for AdamW (default: 3e-4)
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Side length of the square training images, multiple of 8 (default: 64)
    #[arg(long)]
    image_size: Option<usize>,

    /// Number of diffusion steps (default: 1000)
    #[arg(long)]
    noise_steps: Option<usize>,

    /// Images generated per sampling pass (default: 8)
    #[arg(long)]
    num_samples: Option<usize>,

    /// Sample a grid every N epochs during training (default: 1)
    #[arg(long)]
    sample_every: Option<usize>,

    /// Weights file used by --sample
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Output PNG for --sample (default: results/<run>/samples.png)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

impl Args {
    fn train_config(&self) -> TrainConfig {
        let defaults = TrainConfig::default();
        TrainConfig {
            run_name: self.run_name.clone().unwrap_or(defaults.run_name),
            dataset_path: self.dataset_path.clone().unwrap_or(defaults.dataset_path),
            epochs: self.epochs.unwrap_or(defaults.epochs),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            image_size: self.image_size.unwrap_or(defaults.image_size),
            noise_steps: self.noise_steps.unwrap_or(defaults.noise_steps),
            num_samples: self.num_samples.unwrap_or(defaults.num_samples),
            sample_every: self.sample_every.unwrap_or(defaults.sample_every),
            use_cuda: self.cuda,
            ..defaults
        }
    }
}

fn main() {
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ddpm_candle=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --train --cuda"
        );
        return;
    }

    let cfg = args.train_config();

    if args.train {
        match train::train_model(cfg) {
            Ok(_) => info!("Training completed successfully."),
            Err(e) => error!("Training failed: {}", e),
        }
        return;
    }

    if args.sample {
        let weights = args.weights.clone().unwrap_or_else(|| {
            cfg.output_root
                .join("models")
                .join(&cfg.run_name)
                .join(model_artifacts::SAFETENSORS_NAME)
        });
        let output = args.output.clone().unwrap_or_else(|| {
            cfg.output_root
                .join("results")
                .join(&cfg.run_name)
                .join("samples.png")
        });
        match inference::run_sampling(&cfg, &weights, cfg.num_samples, &output) {
            Ok(_) => info!("Sampling completed: {}", output.display()),
            Err(e) => error!("Sampling failed: {}", e),
        }
        return;
    }

    error!("Nothing to do: pass --train or --sample (see --help).");
}
