use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::{Api, ApiBuilder};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod reference;

pub use reference::ReferenceAdapter;

use crate::{
    select_best_device, tensor_to_image, GenerationRequest, LoadSettings, Loader, ModelLike,
    Precision, ReferenceImage,
};

/// Latent scaling factor of the SDXL VAE.
const VAE_SCALE: f64 = 0.13025;
const LATENT_CHANNELS: usize = 4;

/// Where the SDXL pieces live on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdxlWeights {
    /// Repo with `unet/`, `text_encoder/` and `text_encoder_2/`.
    pub base_repo: String,
    /// VAE that stays stable in half precision.
    pub vae_repo: String,
    pub tokenizer_repo: String,
    pub tokenizer_2_repo: String,
}

impl Default for SdxlWeights {
    fn default() -> Self {
        Self {
            base_repo: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            vae_repo: "madebyollin/sdxl-vae-fp16-fix".to_string(),
            tokenizer_repo: "openai/clip-vit-large-patch14".to_string(),
            tokenizer_2_repo: "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k".to_string(),
        }
    }
}

/// Local paths of every file the pipeline is built from.
struct SdxlFiles {
    unet: PathBuf,
    text_encoder: PathBuf,
    text_encoder_2: PathBuf,
    vae: PathBuf,
    tokenizer: PathBuf,
    tokenizer_2: PathBuf,
}

impl SdxlWeights {
    pub fn with_base_repo(base_repo: impl Into<String>) -> Self {
        Self {
            base_repo: base_repo.into(),
            ..Default::default()
        }
    }

    async fn fetch(&self, api: &Api, precision: Precision) -> Result<SdxlFiles> {
        let suffix = precision.weight_suffix();
        let base = api.model(self.base_repo.clone());
        let unet = base
            .get(&format!("unet/diffusion_pytorch_model{suffix}.safetensors"))
            .await
            .context("failed to get unet weights")?;
        let text_encoder = base
            .get(&format!("text_encoder/model{suffix}.safetensors"))
            .await
            .context("failed to get text encoder weights")?;
        let text_encoder_2 = base
            .get(&format!("text_encoder_2/model{suffix}.safetensors"))
            .await
            .context("failed to get second text encoder weights")?;
        let vae = api
            .model(self.vae_repo.clone())
            .get("diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get vae weights")?;
        let tokenizer = api
            .model(self.tokenizer_repo.clone())
            .get("tokenizer.json")
            .await
            .context("failed to get tokenizer")?;
        let tokenizer_2 = api
            .model(self.tokenizer_2_repo.clone())
            .get("tokenizer.json")
            .await
            .context("failed to get second tokenizer")?;
        Ok(SdxlFiles {
            unet,
            text_encoder,
            text_encoder_2,
            vae,
            tokenizer,
            tokenizer_2,
        })
    }

    /// Downloads every file into the cache without building the pipeline.
    pub async fn prefetch(&self, settings: &LoadSettings) -> Result<Vec<PathBuf>> {
        let device = select_best_device(settings.device_map).context("failed to set up device")?;
        let api = hub_api(settings.cache_dir.as_deref())?;
        let files = self.fetch(&api, Precision::for_device(&device)).await?;
        Ok(vec![
            files.unet,
            files.text_encoder,
            files.text_encoder_2,
            files.vae,
            files.tokenizer,
            files.tokenizer_2,
        ])
    }
}

fn hub_api(cache_dir: Option<&Path>) -> Result<Api> {
    let builder = match cache_dir {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir.to_path_buf()),
        None => ApiBuilder::from_env(),
    };
    builder.build().context("failed to create hf hub API")
}

/// A text encoder with its tokenizer and padding rules.
struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    eos_id: u32,
}

impl TextEncoder {
    fn new(
        tokenizer: Tokenizer,
        model: ClipTextTransformer,
        max_len: usize,
        pad_with: Option<&str>,
    ) -> Result<Self> {
        let vocab = tokenizer.get_vocab(true);
        let eos_id = *vocab
            .get("<|endoftext|>")
            .context("tokenizer has no end-of-text token")?;
        let pad_id = match pad_with {
            Some(token) => *vocab
                .get(token)
                .with_context(|| format!("tokenizer has no padding token {token}"))?,
            None => eos_id,
        };
        Ok(Self {
            tokenizer,
            model,
            max_len,
            pad_id,
            eos_id,
        })
    }

    fn tokens(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            warn!(
                tokens = tokens.len(),
                max = self.max_len,
                "prompt is longer than the text encoder window, truncating"
            );
            tokens.truncate(self.max_len - 1);
            tokens.push(self.eos_id);
        }
        tokens.resize(self.max_len, self.pad_id);
        Ok(Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?)
    }

    /// Hidden states for the prompt, preceded by the negative prompt's when guiding.
    fn encode(&self, prompt: &str, negative: Option<&str>, device: &Device) -> Result<Tensor> {
        let cond = self.model.forward(&self.tokens(prompt, device)?)?;
        match negative {
            Some(negative) => {
                let uncond = self.model.forward(&self.tokens(negative, device)?)?;
                Ok(Tensor::cat(&[uncond, cond], 0)?)
            }
            None => Ok(cond),
        }
    }
}

/// Standard normal noise drawn on the host so a seed gives the same latents on any device.
/// Without a seed the generator is seeded from entropy.
fn initial_noise(
    dims: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (b, c, h, w) = dims;
    let values: Vec<f32> = (0..b * c * h * w)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, dims, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)?)
}

/// Seeds the device RNG. Returns whether every random draw of the run is covered by the seed;
/// on CPU the VAE's latent sampling of the reference is not.
fn seed_device(device: &Device, seed: Option<u64>, conditioned: bool) -> Result<bool> {
    let Some(seed) = seed else { return Ok(false) };
    if !device.is_cpu() {
        device.set_seed(seed)?;
        return Ok(true);
    }
    if conditioned {
        warn!(seed, "cpu rng cannot be seeded, reference latents may differ between runs");
        return Ok(false);
    }
    debug!("cpu rng cannot be seeded, relying on host noise only");
    Ok(true)
}

pub struct SdxlModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    text_encoders: [TextEncoder; 2],
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    adapter: Option<ReferenceAdapter>,
}

impl SdxlModel {
    fn text_embeddings(&self, request: &GenerationRequest, guided: bool) -> Result<Tensor> {
        let negative = guided.then_some(request.negative_prompt.as_str());
        let embeddings = self
            .text_encoders
            .iter()
            .map(|encoder| encoder.encode(&request.prompt, negative, &self.device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&embeddings, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        reference: Option<(&ReferenceAdapter, &ReferenceImage)>,
    ) -> Result<DynamicImage> {
        seed_device(&self.device, request.seed, reference.is_some())?;

        let guided = request.guidance > 1.0;
        let text_embeddings = self.text_embeddings(request, guided)?;

        let mut scheduler: Box<dyn Scheduler> = self.config.build_scheduler(request.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_dims = (
            1,
            LATENT_CHANNELS,
            request.height / 8,
            request.width / 8,
        );
        let noise = initial_noise(latent_dims, request.seed, &self.device, self.dtype)?;

        let (mut latents, t_start) = match reference {
            None => ((noise * scheduler.init_noise_sigma())?, 0),
            Some((adapter, reference)) => {
                let t_start = adapter.start_step(timesteps.len(), reference.scale);
                let init = adapter.encode(
                    &self.vae,
                    reference,
                    (request.width, request.height),
                    VAE_SCALE,
                    &self.device,
                    self.dtype,
                )?;
                let latents = match timesteps.get(t_start) {
                    Some(&timestep) => scheduler.add_noise(&init, noise, timestep)?,
                    None => init,
                };
                (latents, t_start)
            }
        };

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * request.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising step done");
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let img = ((decoded / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&img)
    }
}

impl ModelLike for SdxlModel {
    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        self.generate(request, None)
    }

    fn run_with_reference(
        &self,
        request: &GenerationRequest,
        reference: &ReferenceImage,
    ) -> Result<DynamicImage> {
        let adapter = self
            .adapter
            .as_ref()
            .context("reference adapter is not loaded")?;
        self.generate(request, Some((adapter, reference)))
    }

    fn supports_reference(&self) -> bool {
        self.adapter.is_some()
    }
}

pub struct SdxlLoader {
    weights: SdxlWeights,
}

impl SdxlLoader {
    pub fn new(weights: SdxlWeights) -> Self {
        Self { weights }
    }
}

impl Default for SdxlLoader {
    fn default() -> Self {
        Self::new(SdxlWeights::default())
    }
}

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    async fn load(&self, settings: &LoadSettings) -> Result<SdxlModel> {
        let device = select_best_device(settings.device_map).context("failed to set up device")?;
        let precision = Precision::for_device(&device);
        let dtype = precision.dtype();
        info!(?device, ?dtype, base = %self.weights.base_repo, "fetching sdxl weights");

        let api = hub_api(settings.cache_dir.as_deref())?;
        let files = self.weights.fetch(&api, precision).await?;

        if let Some(slice) = settings.sliced_attention_size {
            info!(slice, "using sliced attention");
        }
        let config = StableDiffusionConfig::sdxl(settings.sliced_attention_size, None, None);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;
        let model =
            stable_diffusion::build_clip_transformer(&config.clip, &files.text_encoder, &device, dtype)
                .context("failed to load text encoder")?;
        let text_encoder = TextEncoder::new(
            tokenizer,
            model,
            config.clip.max_position_embeddings,
            config.clip.pad_with.as_deref(),
        )?;

        let clip2 = config
            .clip2
            .as_ref()
            .context("sdxl config has no second text encoder")?;
        let tokenizer_2 = Tokenizer::from_file(&files.tokenizer_2)
            .map_err(Error::msg)
            .context("failed to load second tokenizer")?;
        let model_2 =
            stable_diffusion::build_clip_transformer(clip2, &files.text_encoder_2, &device, dtype)
                .context("failed to load second text encoder")?;
        let text_encoder_2 = TextEncoder::new(
            tokenizer_2,
            model_2,
            clip2.max_position_embeddings,
            clip2.pad_with.as_deref(),
        )?;

        let vae = config
            .build_vae(&files.vae, &device, dtype)
            .context("failed to load vae")?;
        let unet = config
            .build_unet(
                &files.unet,
                &device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to load unet")?;

        let adapter = settings
            .variant
            .loads_adapter()
            .then(ReferenceAdapter::default);

        Ok(SdxlModel {
            device,
            dtype,
            config,
            text_encoders: [text_encoder, text_encoder_2],
            unet,
            vae,
            adapter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_base_repo_keeps_fp16_safe_vae() {
        let weights = SdxlWeights::with_base_repo("my-org/sdxl-finetune");
        assert_eq!(weights.base_repo, "my-org/sdxl-finetune");
        assert_eq!(weights.vae_repo, SdxlWeights::default().vae_repo);
    }

    fn noise_values(seed: Option<u64>) -> Vec<f32> {
        initial_noise((1, 4, 8, 8), seed, &Device::Cpu, DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let first = noise_values(Some(1234));
        assert_eq!(first.len(), 4 * 8 * 8);
        assert_eq!(first, noise_values(Some(1234)));
        assert_ne!(first, noise_values(Some(1235)));
    }

    #[test]
    fn unseeded_noise_differs_between_calls() {
        assert_ne!(noise_values(None), noise_values(None));
    }

    #[test]
    fn cpu_reference_runs_are_not_fully_seeded() {
        assert!(seed_device(&Device::Cpu, Some(1), false).unwrap());
        assert!(!seed_device(&Device::Cpu, Some(1), true).unwrap());
        assert!(!seed_device(&Device::Cpu, None, false).unwrap());
    }

    #[test]
    fn noise_has_requested_shape_and_dtype() {
        let noise = initial_noise((1, 4, 12, 16), Some(7), &Device::Cpu, DType::F16).unwrap();
        assert_eq!(noise.dims(), &[1, 4, 12, 16]);
        assert_eq!(noise.dtype(), DType::F16);
    }

    #[test]
    fn loader_defaults_to_sdxl_base() {
        let loader = SdxlLoader::default();
        assert_eq!(
            loader.weights.base_repo,
            "stabilityai/stable-diffusion-xl-base-1.0"
        );
    }
}
