use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffusionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("timestep {timestep} out of range [1, {noise_steps})")]
    TimestepOutOfRange { timestep: u32, noise_steps: usize },

    #[error("batch size mismatch: {images} images but {timesteps} timesteps")]
    BatchMismatch { images: usize, timesteps: usize },

    #[error("noise shape {noise:?} does not match image shape {images:?}")]
    ShapeMismatch { images: Vec<usize>, noise: Vec<usize> },

    #[error("training diverged at step {step}: loss = {loss}")]
    Divergence { step: usize, loss: f64 },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
