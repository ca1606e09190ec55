use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;

use crate::{image_to_tensor, ReferenceImage};

/// Share of the schedule a reference at full scale is allowed to keep.
const DEFAULT_REFERENCE_WEIGHT: f64 = 0.5;

/// Steers generation towards a reference image by starting the denoising loop from the
/// reference's latents instead of pure noise.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceAdapter {
    weight: f64,
}

impl Default for ReferenceAdapter {
    fn default() -> Self {
        Self {
            weight: DEFAULT_REFERENCE_WEIGHT,
        }
    }
}

impl ReferenceAdapter {
    /// Fraction of the schedule that is actually denoised, in `[1 - weight, 1]`.
    pub fn strength(&self, scale: f64) -> f64 {
        1.0 - scale.clamp(0.0, 1.0) * self.weight
    }

    /// Index of the first scheduler step to run for `steps` total steps.
    pub fn start_step(&self, steps: usize, scale: f64) -> usize {
        let denoised = (steps as f64 * self.strength(scale)) as usize;
        steps.saturating_sub(denoised.max(1))
    }

    /// Encodes the reference at the requested frame size into scaled VAE latents.
    pub fn encode(
        &self,
        vae: &AutoEncoderKL,
        reference: &ReferenceImage,
        (width, height): (usize, usize),
        vae_scale: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let pixels = image_to_tensor(&reference.image, width, height, device, dtype)
            .context("failed to prepare reference image")?;
        let latents = vae
            .encode(&pixels)
            .context("failed to encode reference image")?
            .sample()?;
        Ok((latents * vae_scale)?)
    }
}
