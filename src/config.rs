use candle_core::Device;
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::error::{DiffusionError, Result};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device (tip: compile with --features mkl for faster convolutions)");

    Device::Cpu
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() { "cuda" } else { "cpu" }
}

pub const RUN_NAME: &str = "DDPM_Unconditional";
pub const DATASET_PATH: &str = "data/train";
pub const OUTPUT_ROOT: &str = ".";
pub const EPOCHS: usize = 500;
pub const BATCH_SIZE: usize = 12;
pub const IMAGE_SIZE: usize = 64;
pub const LEARNING_RATE: f64 = 3e-4;
pub const WEIGHT_DECAY: f64 = 0.01;
pub const NOISE_STEPS: usize = 1000;
pub const BETA_START: f64 = 1e-4;
pub const BETA_END: f64 = 0.02;
/// Channel width of the first U-Net stage; deeper stages use 2x, 4x and 8x.
pub const BASE_CHANNELS: usize = 64;
pub const TIME_EMB_DIM: usize = 256;
pub const DROPOUT_RATE: f64 = 0.1;
/// Number of images generated at each sampling epoch.
pub const NUM_SAMPLES: usize = 8;
/// Sample every N epochs.
pub const SAMPLE_EVERY: usize = 1;
/// Images per row in saved sample grids.
pub const GRID_ROW: usize = 8;
/// Emit training progress every N batches.
pub const TRAIN_LOG_INTERVAL_BATCHES: usize = 20;

/// Fully resolved training configuration.
#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub run_name: String,
    pub dataset_path: PathBuf,
    pub output_root: PathBuf,
    pub epochs: usize,
    pub batch_size: usize,
    pub image_size: usize,
    pub learning_rate: f64,
    pub noise_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub base_channels: usize,
    pub time_emb_dim: usize,
    pub dropout_rate: f64,
    pub num_samples: usize,
    pub sample_every: usize,
    pub use_cuda: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            run_name: RUN_NAME.to_string(),
            dataset_path: PathBuf::from(DATASET_PATH),
            output_root: PathBuf::from(OUTPUT_ROOT),
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            image_size: IMAGE_SIZE,
            learning_rate: LEARNING_RATE,
            noise_steps: NOISE_STEPS,
            beta_start: BETA_START,
            beta_end: BETA_END,
            base_channels: BASE_CHANNELS,
            time_emb_dim: TIME_EMB_DIM,
            dropout_rate: DROPOUT_RATE,
            num_samples: NUM_SAMPLES,
            sample_every: SAMPLE_EVERY,
            use_cuda: false,
        }
    }
}

impl TrainConfig {
    /// Checks the values the schedule constructor does not see.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(DiffusionError::InvalidConfig("epochs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(DiffusionError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.image_size == 0 || self.image_size % 8 != 0 {
            return Err(DiffusionError::InvalidConfig(format!(
                "image_size must be a positive multiple of 8, got {}",
                self.image_size
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(DiffusionError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.base_channels == 0 || self.time_emb_dim < 2 || self.time_emb_dim % 2 != 0 {
            return Err(DiffusionError::InvalidConfig(
                "base_channels must be positive and time_emb_dim an even number >= 2".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(DiffusionError::InvalidConfig(format!(
                "dropout_rate must lie in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if self.num_samples == 0 {
            return Err(DiffusionError::InvalidConfig("num_samples must be positive".to_string()));
        }
        if self.sample_every == 0 {
            return Err(DiffusionError::InvalidConfig("sample_every must be positive".to_string()));
        }
        Ok(())
    }
}
