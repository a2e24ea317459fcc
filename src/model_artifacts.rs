use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{DiffusionError, Result};

pub const SAFETENSORS_NAME: &str = "ckpt.safetensors";
const GRID_PADDING: usize = 2;

/// Run-scoped output directories: `models/<run>`, `results/<run>` and `runs/<run>`.
#[derive(Clone, Debug)]
pub struct RunPaths {
    pub models: PathBuf,
    pub results: PathBuf,
    pub runs: PathBuf,
}

impl RunPaths {
    pub fn create<P: AsRef<Path>>(root: P, run_name: &str) -> Result<Self> {
        let root = root.as_ref();
        let paths = Self {
            models: root.join("models").join(run_name),
            results: root.join("results").join(run_name),
            runs: root.join("runs").join(run_name),
        };
        for dir in [&paths.models, &paths.results, &paths.runs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(paths)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.models.join(SAFETENSORS_NAME)
    }

    pub fn sample_grid_path(&self, epoch: usize) -> PathBuf {
        self.results.join(format!("{}.png", epoch))
    }
}

pub fn save_weights(varmap: &VarMap, path: &Path) -> Result<()> {
    varmap.save(path)?;
    info!("Saved safetensors weights: {}", path.display());
    Ok(())
}

pub fn load_weights(varmap: &mut VarMap, path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(DiffusionError::InvalidConfig(format!(
            "weights file not found: {}",
            path.display()
        )));
    }
    varmap.load(path)?;
    info!("Loaded safetensors weights: {}", path.display());
    Ok(())
}

/// Tiles `[n, 3, h, w]` pixels into rows of `nrow` images separated by a 2-pixel black
/// border and writes the grid as a PNG.
pub fn save_image_grid(images: &Tensor, path: &Path, nrow: usize) -> Result<()> {
    let (n, c, h, w) = images.dims4()?;
    if c != 3 {
        return Err(DiffusionError::Dataset(format!(
            "image grid expects 3 channels, got {}",
            c
        )));
    }
    if n == 0 {
        return Err(DiffusionError::Dataset("image grid needs at least one image".to_string()));
    }
    let pixels = images
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let cols = nrow.clamp(1, n);
    let rows = n.div_ceil(cols);
    let cell_h = h + GRID_PADDING;
    let cell_w = w + GRID_PADDING;
    let grid_h = rows * cell_h + GRID_PADDING;
    let grid_w = cols * cell_w + GRID_PADDING;

    let mut grid = image::RgbImage::new(grid_w as u32, grid_h as u32);
    let plane = h * w;
    for k in 0..n {
        let top = (k / cols) * cell_h + GRID_PADDING;
        let left = (k % cols) * cell_w + GRID_PADDING;
        let base = k * 3 * plane;
        for y in 0..h {
            for x in 0..w {
                let offset = base + y * w + x;
                let rgb = [
                    pixels[offset],
                    pixels[offset + plane],
                    pixels[offset + 2 * plane],
                ];
                grid.put_pixel((left + x) as u32, (top + y) as u32, image::Rgb(rgb));
            }
        }
    }

    grid.save(path)?;
    info!("Saved sample grid ({} images): {}", n, path.display());
    Ok(())
}
