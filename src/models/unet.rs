use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder};

use super::{Denoiser, Mode};

// ── Dropout helper ─────────────────────────────────────────────────────────────
/// Inverted dropout: during training, randomly zeros elements with probability `p`
/// and scales remaining elements by 1/(1-p). During inference, returns input unchanged.
pub fn dropout(x: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 || p >= 1.0 {
        return Ok(x.clone());
    }
    let rand_t = Tensor::rand(0.0f32, 1.0f32, x.shape(), x.device())?;
    let threshold = Tensor::full(p as f32, x.shape(), x.device())?;
    let mask = rand_t.ge(&threshold)?.to_dtype(x.dtype())?;
    let scale = 1.0 / (1.0 - p);
    (x.mul(&mask))?.affine(scale, 0.0)
}

/// Sinusoidal encoding of integer timesteps `[batch]` into `[batch, dim]` (sin half, cos half).
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = timesteps.device();
    let t = timesteps.to_dtype(DType::F32)?.unsqueeze(1)?;
    let freqs = Tensor::arange(0u32, half as u32, device)?
        .to_dtype(DType::F32)?
        .affine(-(10000f64).ln() / half as f64, 0.0)?
        .exp()?
        .unsqueeze(0)?;
    let args = t.broadcast_mul(&freqs)?;
    Tensor::cat(&[args.sin()?, args.cos()?], 1)
}

// --- 1. Time Embedding ---
// Projects the sinusoidal step encoding before it is injected into each block.
pub struct TimeEmbedding {
    dim: usize,
    linear1: Linear,
    linear2: Linear,
}

impl TimeEmbedding {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let linear1 = candle_nn::linear(dim, dim, vb.pp("linear1"))?;
        let linear2 = candle_nn::linear(dim, dim, vb.pp("linear2"))?;
        Ok(Self { dim, linear1, linear2 })
    }

    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let x = timestep_embedding(timesteps, self.dim)?;
        let x = self.linear1.forward(&x)?;
        let x = candle_nn::ops::silu(&x)?;
        self.linear2.forward(&x)
    }
}

// --- 2. Double Convolution ---
// conv3x3 -> GroupNorm -> GELU -> conv3x3 -> GroupNorm, optionally with a residual add.
pub struct DoubleConv {
    conv1: Conv2d,
    norm1: GroupNorm,
    conv2: Conv2d,
    norm2: GroupNorm,
    residual: bool,
}

impl DoubleConv {
    pub fn new(in_channels: usize, out_channels: usize, residual: bool, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d_no_bias(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?;
        let norm1 = candle_nn::group_norm(1, out_channels, 1e-5, vb.pp("norm1"))?;
        let conv2 = candle_nn::conv2d_no_bias(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?;
        let norm2 = candle_nn::group_norm(1, out_channels, 1e-5, vb.pp("norm2"))?;
        Ok(Self { conv1, norm1, conv2, norm2, residual })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(x)?;
        let h = self.norm1.forward(&h)?.gelu()?;
        let h = self.conv2.forward(&h)?;
        let h = self.norm2.forward(&h)?;
        if self.residual {
            (x + h)?.gelu()
        } else {
            Ok(h)
        }
    }
}

fn add_time(x: &Tensor, emb: &Tensor, projection: &Linear) -> Result<Tensor> {
    let emb = projection.forward(&candle_nn::ops::silu(emb)?)?;
    let emb = emb.unsqueeze(2)?.unsqueeze(3)?;
    x.broadcast_add(&emb)
}

// --- 3. Down / Up blocks ---
pub struct Down {
    res: DoubleConv,
    conv: DoubleConv,
    time_projection: Linear,
    dropout_rate: f64,
}

impl Down {
    pub fn new(in_channels: usize, out_channels: usize, time_dim: usize, dropout_rate: f64, vb: VarBuilder) -> Result<Self> {
        let res = DoubleConv::new(in_channels, in_channels, true, vb.pp("res"))?;
        let conv = DoubleConv::new(in_channels, out_channels, false, vb.pp("conv"))?;
        let time_projection = candle_nn::linear(time_dim, out_channels, vb.pp("time_projection"))?;
        Ok(Self { res, conv, time_projection, dropout_rate })
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.max_pool2d(2)?;
        let x = self.res.forward(&x)?;
        let x = self.conv.forward(&x)?;
        let x = add_time(&x, emb, &self.time_projection)?;
        dropout(&x, self.dropout_rate, train)
    }
}

pub struct Up {
    res: DoubleConv,
    conv: DoubleConv,
    time_projection: Linear,
    dropout_rate: f64,
}

impl Up {
    /// `in_channels` counts the concatenation of the skip connection and the upsampled input.
    pub fn new(in_channels: usize, out_channels: usize, time_dim: usize, dropout_rate: f64, vb: VarBuilder) -> Result<Self> {
        let res = DoubleConv::new(in_channels, in_channels, true, vb.pp("res"))?;
        let conv = DoubleConv::new(in_channels, out_channels, false, vb.pp("conv"))?;
        let time_projection = candle_nn::linear(time_dim, out_channels, vb.pp("time_projection"))?;
        Ok(Self { res, conv, time_projection, dropout_rate })
    }

    pub fn forward(&self, x: &Tensor, skip: &Tensor, emb: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, h, w) = skip.dims4()?;
        let x = x.upsample_nearest2d(h, w)?;
        let x = Tensor::cat(&[skip, &x], 1)?;
        let x = self.res.forward(&x)?;
        let x = self.conv.forward(&x)?;
        let x = add_time(&x, emb, &self.time_projection)?;
        dropout(&x, self.dropout_rate, train)
    }
}

// --- 4. UNet (Denoising Network) ---
pub struct UNet {
    time_embedding: TimeEmbedding,
    inc: DoubleConv,
    down1: Down,
    down2: Down,
    down3: Down,
    bot1: DoubleConv,
    bot2: DoubleConv,
    bot3: DoubleConv,
    up1: Up,
    up2: Up,
    up3: Up,
    output_projection: Conv2d,
    mode: Mode,
}

impl UNet {
    /// Three-channel U-Net. Input height and width must be divisible by 8.
    pub fn new(base_channels: usize, time_dim: usize, dropout_rate: f64, vb: VarBuilder) -> Result<Self> {
        let c = base_channels;
        let time_embedding = TimeEmbedding::new(time_dim, vb.pp("time_embedding"))?;

        let inc = DoubleConv::new(3, c, false, vb.pp("inc"))?;
        let down1 = Down::new(c, 2 * c, time_dim, dropout_rate, vb.pp("down1"))?;
        let down2 = Down::new(2 * c, 4 * c, time_dim, dropout_rate, vb.pp("down2"))?;
        let down3 = Down::new(4 * c, 4 * c, time_dim, dropout_rate, vb.pp("down3"))?;

        let bot1 = DoubleConv::new(4 * c, 8 * c, false, vb.pp("bot1"))?;
        let bot2 = DoubleConv::new(8 * c, 8 * c, false, vb.pp("bot2"))?;
        let bot3 = DoubleConv::new(8 * c, 4 * c, false, vb.pp("bot3"))?;

        let up1 = Up::new(8 * c, 2 * c, time_dim, dropout_rate, vb.pp("up1"))?;
        let up2 = Up::new(4 * c, c, time_dim, dropout_rate, vb.pp("up2"))?;
        let up3 = Up::new(2 * c, c, time_dim, dropout_rate, vb.pp("up3"))?;

        let output_projection = candle_nn::conv2d(c, 3, 1, Default::default(), vb.pp("output_projection"))?;

        Ok(Self {
            time_embedding,
            inc,
            down1,
            down2,
            down3,
            bot1,
            bot2,
            bot3,
            up1,
            up2,
            up3,
            output_projection,
            mode: Mode::Train,
        })
    }

    pub fn forward(&self, x: &Tensor, timesteps: &Tensor, train: bool) -> Result<Tensor> {
        let emb = self.time_embedding.forward(timesteps)?;

        let x1 = self.inc.forward(x)?;
        let x2 = self.down1.forward(&x1, &emb, train)?;
        let x3 = self.down2.forward(&x2, &emb, train)?;
        let x4 = self.down3.forward(&x3, &emb, train)?;

        let x4 = self.bot1.forward(&x4)?;
        let x4 = self.bot2.forward(&x4)?;
        let x4 = self.bot3.forward(&x4)?;

        let x = self.up1.forward(&x4, &x3, &emb, train)?;
        let x = self.up2.forward(&x, &x2, &emb, train)?;
        let x = self.up3.forward(&x, &x1, &emb, train)?;
        self.output_projection.forward(&x)
    }
}

impl Denoiser for UNet {
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.forward(xs, timesteps, self.mode() == Mode::Train)
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }
}
