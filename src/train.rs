use crate::config::{device_label, get_device, TrainConfig, GRID_ROW, TRAIN_LOG_INTERVAL_BATCHES, WEIGHT_DECAY};
use crate::data::ImageDataset;
use crate::diffusion::Diffusion;
use crate::error::DiffusionError;
use crate::metrics::{EpochLogEntry, MetricsWriter, TrainingRunLog};
use crate::model_artifacts::{save_image_grid, save_weights, RunPaths};
use crate::models::unet::UNet;
use crate::models::Denoiser;
use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Mean squared error between the injected and the predicted noise.
pub fn mse_loss(actual: &Tensor, predicted: &Tensor) -> crate::error::Result<Tensor> {
    Ok(candle_nn::loss::mse(predicted, actual)?)
}

/// One optimisation step on a batch of clean images `[b, 3, s, s]`. Returns the batch loss.
/// A non-finite loss aborts with `DiffusionError::Divergence` before any parameter update.
pub fn train_step<D: Denoiser, O: Optimizer>(
    model: &D,
    opt: &mut O,
    diffusion: &Diffusion,
    images: &Tensor,
    step: usize,
) -> crate::error::Result<f64> {
    let t = diffusion.sample_timesteps(images.dim(0)?)?;
    let (x_t, noise) = diffusion.noise_images(images, &t)?;
    let predicted_noise = model.predict(&x_t, &t)?;

    let loss = mse_loss(&noise, &predicted_noise)?;
    let value = loss.to_scalar::<f32>()? as f64;
    if !value.is_finite() {
        return Err(DiffusionError::Divergence { step, loss: value });
    }

    // candle builds a fresh gradient store on every backward pass.
    opt.backward_step(&loss)?;
    Ok(value)
}

fn log_schedule(diffusion: &Diffusion) {
    let last = diffusion.noise_steps() - 1;
    info!(
        "Schedule: {} steps at {}x{}, beta [{:.2e}, {:.2e}], alpha [{:.6}, {:.6}], alpha_hat [{:.6}, {:.3e}]",
        diffusion.noise_steps(),
        diffusion.image_size(),
        diffusion.image_size(),
        diffusion.betas()[0],
        diffusion.betas()[last],
        diffusion.alphas()[0],
        diffusion.alphas()[last],
        diffusion.alpha_hats()[0],
        diffusion.alpha_hats()[last]
    );
}

pub fn train_model(config: TrainConfig) -> Result<TrainingRunLog> {
    info!("Training mode started...");
    config.validate()?;

    info!(
        "Configuration: Epochs={}, Batch Size={}, LR={}, Image Size={}, Noise Steps={}",
        config.epochs, config.batch_size, config.learning_rate, config.image_size, config.noise_steps
    );

    let dataset = ImageDataset::load(&config.dataset_path, config.image_size)?;
    info!("Dataset classes: {:?}", dataset.classes);
    train_model_with_data(config, &dataset)
}

pub fn train_model_with_data(config: TrainConfig, dataset: &ImageDataset) -> Result<TrainingRunLog> {
    config.validate()?;
    if dataset.is_empty() {
        return Err(anyhow::anyhow!("No training data available."));
    }

    let started_at = Utc::now();
    let device = get_device(config.use_cuda);
    let paths = RunPaths::create(&config.output_root, &config.run_name)?;
    let mut metrics = MetricsWriter::create(&paths.runs)?;
    info!("Metrics log: {}", metrics.path().display());

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let mut model = UNet::new(config.base_channels, config.time_emb_dim, config.dropout_rate, vb.pp("unet"))?;
    let diffusion = Diffusion::new(
        config.noise_steps,
        config.beta_start,
        config.beta_end,
        config.image_size,
        &device,
    )?;
    log_schedule(&diffusion);

    let params = candle_nn::ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: WEIGHT_DECAY,
        ..Default::default()
    };
    let mut opt = candle_nn::AdamW::new(varmap.all_vars(), params)?;

    let num_batches = dataset.num_batches(config.batch_size);
    let mut epoch_metrics: Vec<EpochLogEntry> = Vec::with_capacity(config.epochs);

    info!(
        "Training on {} with {} samples ({} batches per epoch)",
        device_label(&device),
        dataset.len(),
        num_batches
    );

    for epoch in 0..config.epochs {
        info!("Starting epoch {}:", epoch);
        let epoch_start = Instant::now();
        let mut total_loss = 0.0;

        for (batch_idx, batch) in dataset.batches(config.batch_size, true, &device)?.enumerate() {
            let (images, _labels) = batch?;
            let global_step = epoch * num_batches + batch_idx;

            let loss = train_step(&model, &mut opt, &diffusion, &images, global_step)?;
            total_loss += loss;
            debug!("step {}: MSE = {:.6}", global_step, loss);

            if let Err(e) = metrics.add_scalar("MSE", loss, global_step) {
                warn!("Failed to append metric: {}", e);
            }

            let batch_no = batch_idx + 1;
            if batch_no % TRAIN_LOG_INTERVAL_BATCHES == 0 || batch_no == num_batches {
                let progress = (batch_no as f64 / num_batches.max(1) as f64) * 100.0;
                info!(
                    "Epoch {}/{} progress: {}/{} batches ({:.1}%), MSE={:.6}, elapsed: {:.1}s",
                    epoch + 1,
                    config.epochs,
                    batch_no,
                    num_batches,
                    progress,
                    loss,
                    epoch_start.elapsed().as_secs_f64()
                );
            }
        }

        let mean_loss = total_loss / num_batches.max(1) as f64;
        epoch_metrics.push(EpochLogEntry {
            epoch: epoch + 1,
            mean_loss,
            batches: num_batches,
        });
        info!("Epoch {}: mean MSE = {:.6}", epoch + 1, mean_loss);

        if (epoch + 1) % config.sample_every == 0 {
            let sampled = diffusion.sample(&mut model, config.num_samples)?;
            save_image_grid(&sampled, &paths.sample_grid_path(epoch), GRID_ROW)?;
        }
    }

    save_weights(&varmap, &paths.weights_path())?;
    info!("Training finished.");

    let run_log = TrainingRunLog {
        run_name: config.run_name.clone(),
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        device: device_label(&device).to_string(),
        epochs_requested: config.epochs,
        epochs_completed: epoch_metrics.len(),
        batch_size: config.batch_size,
        learning_rate: config.learning_rate,
        noise_steps: config.noise_steps,
        image_size: config.image_size,
        epoch_metrics,
    };

    match metrics.persist_run_summary(&run_log) {
        Ok(path) => info!("Training JSON log saved: {}", path.display()),
        Err(e) => warn!("Failed to save training JSON log: {}", e),
    }

    Ok(run_log)
}
