use crate::config::{get_device, TrainConfig, GRID_ROW};
use crate::diffusion::Diffusion;
use crate::model_artifacts::{load_weights, save_image_grid};
use crate::models::unet::UNet;
use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Rebuilds the U-Net described by `config`, loads `weights` into it and generates
/// `num_samples` images. Returns the `u8` batch `[n, 3, size, size]`.
pub fn sample_from_weights(config: &TrainConfig, weights: &Path, num_samples: usize) -> Result<Tensor> {
    config.validate()?;
    let device = get_device(config.use_cuda);

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = UNet::new(config.base_channels, config.time_emb_dim, config.dropout_rate, vb.pp("unet"))?;
    load_weights(&mut varmap, weights)?;

    let diffusion = Diffusion::new(
        config.noise_steps,
        config.beta_start,
        config.beta_end,
        config.image_size,
        &device,
    )?;

    let start = Instant::now();
    let images = diffusion.sample(&mut model, num_samples)?;
    info!(
        "Generated {} samples in {:.1}s",
        num_samples,
        start.elapsed().as_secs_f64()
    );
    Ok(images)
}

pub fn run_sampling(config: &TrainConfig, weights: &Path, num_samples: usize, output: &Path) -> Result<()> {
    let images = sample_from_weights(config, weights, num_samples)?;
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    save_image_grid(&images, output, GRID_ROW)?;
    Ok(())
}
