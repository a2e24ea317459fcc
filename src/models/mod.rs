pub mod unet;

use candle_core::{Result, Tensor};
use std::ops::{Deref, DerefMut};

/// Behavioural mode of a denoiser. Layers such as dropout only act in `Train`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// A noise-prediction network: maps `(x_t, t)` to the predicted noise.
pub trait Denoiser {
    /// `xs` is `[batch, channels, height, width]`, `timesteps` is `[batch]` (u32).
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor>;

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);
}

/// Holds a denoiser in `Mode::Eval` and puts it back into `Mode::Train` when dropped,
/// whichever way the scope is left.
pub struct EvalGuard<'a, D: Denoiser + ?Sized> {
    model: &'a mut D,
}

impl<'a, D: Denoiser + ?Sized> EvalGuard<'a, D> {
    pub fn new(model: &'a mut D) -> Self {
        model.set_mode(Mode::Eval);
        Self { model }
    }
}

impl<D: Denoiser + ?Sized> Deref for EvalGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.model
    }
}

impl<D: Denoiser + ?Sized> DerefMut for EvalGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.model
    }
}

impl<D: Denoiser + ?Sized> Drop for EvalGuard<'_, D> {
    fn drop(&mut self) {
        self.model.set_mode(Mode::Train);
    }
}
