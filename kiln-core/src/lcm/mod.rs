//! Latent-consistency text2image pipeline on top of the Stable Diffusion
//! building blocks from candle-transformers.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod scheduler;

pub use scheduler::ConsistencySchedule;

use crate::{
    select_best_device, tensor_to_image, DeviceMap, GenerationDefaults, GenerationRequest, Loader,
    ModelSpec, TextToImage,
};

/// SD-1.x tokenizer source; the model repos ship only vocab/merges files.
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_SCALE: f64 = 0.18215;
const DEFAULT_SIZE: usize = 768;

pub struct LcmPipeline {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl LcmPipeline {
    fn encode_text(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            bail!(
                "prompt is too long ({} tokens, the encoder takes at most {})",
                tokens.len(),
                self.max_tokens
            );
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?.to_dtype(self.dtype)?)
    }

    /// Prompt embedding, doubled up with the unconditional embedding when
    /// classifier-free guidance is in play.
    fn encode_prompt(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_text(prompt)?;
        if use_guidance {
            let uncond = self.encode_text("")?;
            Ok(Tensor::cat(&[uncond, cond], 0)?)
        } else {
            Ok(cond)
        }
    }
}

impl TextToImage for LcmPipeline {
    fn run(&self, request: GenerationRequest) -> Result<Vec<DynamicImage>> {
        let defaults = GenerationDefaults::default();
        let width = request.width.unwrap_or(DEFAULT_SIZE);
        let height = request.height.unwrap_or(DEFAULT_SIZE);
        let steps = request.steps.unwrap_or(defaults.steps);
        let guidance = request.guidance.unwrap_or(defaults.guidance);
        let origin_steps = request.origin_steps.unwrap_or(defaults.origin_steps);
        let num_images = request.num_images.unwrap_or(1).max(1);

        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            bail!("width and height must be non-zero multiples of 8, got {width}x{height}");
        }
        let schedule = ConsistencySchedule::new(steps, origin_steps)?;

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        let use_guidance = guidance > 1.0;
        let text_embeddings = self.encode_prompt(&request.prompt, use_guidance)?;

        let mut images = Vec::with_capacity(num_images);
        for index in 0..num_images {
            debug!(image = index + 1, total = num_images, steps, "sampling");
            let mut latents = Tensor::randn(
                0f32,
                1f32,
                (1, 4, height / 8, width / 8),
                &self.device,
            )?
            .to_dtype(self.dtype)?;
            let mut denoised = latents.clone();

            for (step_index, &timestep) in schedule.timesteps().iter().enumerate() {
                let unet_input = if use_guidance {
                    Tensor::cat(&[&latents, &latents], 0)?
                } else {
                    latents.clone()
                };
                let noise_pred =
                    self.unet
                        .forward(&unet_input, timestep as f64, &text_embeddings)?;
                let noise_pred = if use_guidance {
                    let chunks = noise_pred.chunk(2, 0)?;
                    (&chunks[0] + ((&chunks[1] - &chunks[0])? * guidance)?)?
                } else {
                    noise_pred
                };
                (latents, denoised) = schedule.step(&noise_pred, step_index, &latents)?;
            }

            let decoded = self.vae.decode(&(&denoised / VAE_SCALE)?)?;
            let image = ((decoded / 2.)? + 0.5)?
                .clamp(0f32, 1f32)?
                .to_device(&Device::Cpu)?;
            let image = (image * 255.)?.to_dtype(DType::U8)?.i(0)?;
            images.push(tensor_to_image(&image)?);
        }
        Ok(images)
    }
}

pub struct LcmLoader;

impl Loader for LcmLoader {
    type Model = LcmPipeline;

    async fn load(spec: ModelSpec, api: hf_hub::api::tokio::Api, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        info!(
            model_id = %spec.model_id,
            revision = %spec.revision,
            ?dtype,
            "loading latent consistency pipeline"
        );

        let repo = api.repo(hf_hub::Repo::with_revision(
            spec.model_id.clone(),
            hf_hub::RepoType::Model,
            spec.revision.clone(),
        ));

        // --- Tokenizer ---
        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;

        let sd_config = StableDiffusionConfig::v1_5(None, None, None);
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .with_context(|| format!("tokenizer has no pad token {pad_token:?}"))?;

        // --- Text encoder ---
        let clip_file = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let clip = stable_diffusion::build_clip_transformer(&sd_config.clip, clip_file, &device, dtype)
            .context("failed to load text encoder")?;

        // --- UNet ---
        let unet_file = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, false, dtype)
            .context("failed to load UNet")?;

        // --- Autoencoder ---
        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get autoencoder weights")?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load autoencoder")?;

        let max_tokens = sd_config.clip.max_position_embeddings;
        Ok(LcmPipeline {
            device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens,
            clip,
            unet,
            vae,
        })
    }
}
