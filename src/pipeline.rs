//! Candle Stable Diffusion pipeline.
//!
//! Resolves weights through the HuggingFace Hub, holds the CLIP tokenizer,
//! text encoder, UNet and VAE for the lifetime of a run, and exposes the
//! token embedding table plus batched classifier-free-guidance generation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::ExtractConfig;
use crate::extract::ExtractorBackend;
use crate::vocab::TokenVocab;

/// Scaling factor between VAE latents and UNet space.
const VAE_SCALE: f64 = 0.18215;
/// UNet latent channels.
const LATENT_CHANNELS: usize = 4;
/// Repo carrying the CLIP tokenizer.json; the SD model repos ship none.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Loaded Stable Diffusion components, read-only after construction.
pub struct SdPipeline {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    text_model: stable_diffusion::clip::ClipTextTransformer,
    unet: stable_diffusion::unet_2d::UNet2DConditionModel,
    vae: stable_diffusion::vae::AutoEncoderKL,
    sd_config: StableDiffusionConfig,
    /// Token embedding table, kept on CPU in f32 for snapshotting.
    token_embeddings: Tensor,
    vocab_size: usize,
    pad_id: u32,
    num_inference_steps: usize,
    guidance_scale: f64,
    model_id: String,
}

impl SdPipeline {
    /// Load all pipeline components for the configured model.
    ///
    /// Device selection: forced CPU runs in f32; otherwise CUDA with f16
    /// when available, CPU/f32 as fallback.
    pub fn from_pretrained(config: &ExtractConfig) -> Result<Self> {
        let (device, dtype) = if config.use_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::F16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };
        let use_f16 = dtype == DType::F16;

        info!("Loading model: {}", config.model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let tokenizer_path = api
            .repo(Repo::new(CLIP_TOKENIZER_REPO.to_string(), RepoType::Model))
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let repo = api.repo(Repo::new(config.model_id.clone(), RepoType::Model));
        let clip_weights = fetch_weights(&repo, "text_encoder", use_f16)?;
        let unet_weights = fetch_weights(&repo, "unet", use_f16)?;
        let vae_weights = fetch_weights(&repo, "vae", use_f16)?;

        let sd_config =
            StableDiffusionConfig::v2_1(None, Some(config.height), Some(config.width));

        let pad_id = match &sd_config.clip.pad_with {
            Some(padding) => *tokenizer
                .get_vocab(true)
                .get(padding.as_str())
                .context("pad token missing from tokenizer vocab")?,
            None => *tokenizer
                .get_vocab(true)
                .get("<|endoftext|>")
                .context("<|endoftext|> missing from tokenizer vocab")?,
        };

        info!("Building text encoder");
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, &clip_weights, &device, dtype)?;
        info!("Building VAE");
        let vae = sd_config.build_vae(&vae_weights, &device, dtype)?;
        info!("Building UNet");
        let unet = sd_config.build_unet(&unet_weights, &device, LATENT_CHANNELS, false, dtype)?;

        // The embedding table is read straight from the text-encoder weights
        // so snapshots stay f32 regardless of the inference dtype.
        let tensors = candle_core::safetensors::load(&clip_weights, &Device::Cpu)?;
        let token_embeddings = tensors
            .get("text_model.embeddings.token_embedding.weight")
            .context("token embedding table missing from text encoder weights")?
            .to_dtype(DType::F32)?;
        let vocab_size = token_embeddings.dim(0)?;
        info!("Token embedding table: {} entries", vocab_size);

        Ok(Self {
            device,
            dtype,
            tokenizer,
            text_model,
            unet,
            vae,
            sd_config,
            token_embeddings,
            vocab_size,
            pad_id,
            num_inference_steps: config.num_inference_steps,
            guidance_scale: config.guidance_scale,
            model_id: config.model_id.clone(),
        })
    }

    /// The model id this pipeline was loaded from.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The device the diffusion components run on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encode a prompt to CLIP hidden states, padded to the encoder's
    /// maximum sequence length.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?
            .get_ids()
            .to_vec();
        let max_len = self.sd_config.clip.max_position_embeddings;
        anyhow::ensure!(
            tokens.len() <= max_len,
            "prompt {prompt:?} is longer than {max_len} tokens"
        );
        tokens.resize(max_len, self.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl TokenVocab for SdPipeline {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], true)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    fn encode_word(&self, word: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(word, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl ExtractorBackend for SdPipeline {
    fn token_embedding(&self, token_id: u32) -> Result<Tensor> {
        Ok(self.token_embeddings.i(token_id as usize)?)
    }

    /// Run the denoising loop for one prompt batch.
    ///
    /// Classifier-free guidance doubles the batch: unconditional embeddings
    /// first, conditional second, with the noise prediction split back apart
    /// at every step.
    fn generate(&self, prompts: &[String]) -> Result<Vec<Tensor>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let bsize = prompts.len();

        let mut cond = Vec::with_capacity(bsize);
        for prompt in prompts {
            cond.push(self.encode_prompt(prompt)?);
        }
        let cond = Tensor::cat(&cond, 0)?;
        let uncond = self.encode_prompt("")?.repeat((bsize, 1, 1))?;
        let text_embeddings = Tensor::cat(&[&uncond, &cond], 0)?.to_dtype(self.dtype)?;

        let mut scheduler = self.sd_config.build_scheduler(self.num_inference_steps)?;
        let latents = Tensor::randn(
            0f32,
            1f32,
            (
                bsize,
                LATENT_CHANNELS,
                self.sd_config.height / 8,
                self.sd_config.width / 8,
            ),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for timestep in timesteps {
            debug!("Denoising step, timestep {}", timestep);
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond_pred, text_pred) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (uncond_pred + ((text_pred - uncond_pred)? * self.guidance_scale)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0., 1.)? * 255.)?.to_dtype(DType::U8)?;

        let mut out = Vec::with_capacity(bsize);
        for i in 0..bsize {
            out.push(images.i(i)?);
        }
        Ok(out)
    }
}

/// Resolve one weight file from the model repo, preferring fp16 variants
/// when running in half precision.
fn fetch_weights(repo: &ApiRepo, component: &str, use_f16: bool) -> Result<PathBuf> {
    let name = match (component, use_f16) {
        ("text_encoder", false) => "text_encoder/model.safetensors".to_string(),
        ("text_encoder", true) => "text_encoder/model.fp16.safetensors".to_string(),
        (_, false) => format!("{component}/diffusion_pytorch_model.safetensors"),
        (_, true) => format!("{component}/diffusion_pytorch_model.fp16.safetensors"),
    };
    repo.get(&name)
        .with_context(|| format!("Failed to download {name}"))
}
