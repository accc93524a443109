mod sampling;

use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::mmdit::model::{Config as MmditConfig, MMDiT};
use candle_transformers::models::stable_diffusion::clip::{self, ClipTextTransformer};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use candle_transformers::models::t5;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::util::{image_to_tensor, select_best_device, tensor_to_image};
use crate::{
    DeviceMap, LoadOptions, ModelLike, ModelProfile, Precision, RerenderParams, SamplingParams,
    SchedulerDescriptor,
};
use sampling::{FlowSampler, DEFAULT_SHIFT};

const TEXT_TOKENS: usize = 77;
const VAE_SCALE: f64 = 1.5305;
const VAE_SHIFT: f64 = 0.0609;
/// Pixels per latent patch: 8x VAE downsampling times the 2x2 patchifier.
const PATCH_PIXELS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sd3Variant {
    Medium,
    Large,
}

impl Sd3Variant {
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.to_uppercase().contains("MEDIUM") {
            Sd3Variant::Medium
        } else {
            Sd3Variant::Large
        }
    }

    fn mmdit_config(self) -> MmditConfig {
        match self {
            Sd3Variant::Medium => MmditConfig::sd3_5_medium(),
            Sd3Variant::Large => MmditConfig::sd3_5_large(),
        }
    }

    fn checkpoint(self) -> &'static str {
        match self {
            Sd3Variant::Medium => "sd3.5_medium.safetensors",
            Sd3Variant::Large => "sd3.5_large.safetensors",
        }
    }
}

struct ClipEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
}

impl ClipEncoder {
    fn new(tokenizer: Tokenizer, model: ClipTextTransformer, config: &clip::Config) -> Result<Self> {
        let pad = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad)
            .with_context(|| format!("tokenizer has no '{pad}' token"))?;
        Ok(Self {
            tokenizer,
            model,
            pad_id,
        })
    }

    /// Penultimate hidden states and the pooled end-of-text embedding.
    fn encode(&self, text: &str, device: &Device) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(TEXT_TOKENS);
        let eos_position = tokens.len().saturating_sub(1);
        tokens.resize(TEXT_TOKENS, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        let (last, penultimate) = self
            .model
            .forward_until_encoder_layer(&tokens, usize::MAX, -2)?;
        Ok((penultimate, last.i((0, eos_position, ..))?))
    }
}

struct T5Encoder {
    tokenizer: Tokenizer,
    model: t5::T5EncoderModel,
}

impl T5Encoder {
    fn encode(&mut self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(TEXT_TOKENS);
        tokens.resize(TEXT_TOKENS, 0);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward_dt(&tokens, Some(DType::F32))?)
    }
}

/// `MMDiT` holds boxed trait objects without a `Send` bound, but every
/// concrete block it contains is built from tensors only.
struct SendMmdit(MMDiT);

// SAFETY: all layers inside `MMDiT` are plain tensor containers, which are `Send`.
unsafe impl Send for SendMmdit {}

impl std::ops::Deref for SendMmdit {
    type Target = MMDiT;

    fn deref(&self) -> &MMDiT {
        &self.0
    }
}

pub struct StableDiffusion3Model {
    device: Device,
    dtype: DType,
    clip_l: ClipEncoder,
    clip_g: ClipEncoder,
    clip_g_projection: candle_nn::Linear,
    t5: T5Encoder,
    mmdit: SendMmdit,
    vae: AutoEncoderKL,
    scheduler: &'static SchedulerDescriptor,
}

impl StableDiffusion3Model {
    fn seed(&self, seed: Option<u64>) {
        if let Some(seed) = seed {
            if let Err(e) = self.device.set_seed(seed) {
                warn!(seed, error = %e, "device does not support seeding, continuing unseeded");
            }
        }
    }

    /// Token context and pooled vector for one prompt.
    fn encode_text(&mut self, text: &str) -> Result<(Tensor, Tensor)> {
        let (clip_l, clip_l_pooled) = self.clip_l.encode(text, &self.device)?;
        let (clip_g, clip_g_pooled) = self.clip_g.encode(text, &self.device)?;
        let clip_g_pooled = self
            .clip_g_projection
            .forward(&clip_g_pooled.unsqueeze(0)?)?
            .squeeze(0)?;
        let pooled = Tensor::cat(&[&clip_l_pooled, &clip_g_pooled], 0)?.unsqueeze(0)?;

        let clip = Tensor::cat(&[&clip_l, &clip_g], D::Minus1)?;
        let t5 = self.t5.encode(text, &self.device)?.to_dtype(clip.dtype())?;
        let width = t5.dim(D::Minus1)?;
        let clip = clip.pad_with_zeros(D::Minus1, 0, width - clip.dim(D::Minus1)?)?;
        let context = Tensor::cat(&[&clip, &t5], D::Minus2)?;
        Ok((context.to_dtype(self.dtype)?, pooled.to_dtype(self.dtype)?))
    }

    /// Conditional and unconditional embeddings stacked on the batch axis.
    fn encode_prompt(&mut self, prompt: &str, negative_prompt: &str) -> Result<(Tensor, Tensor)> {
        let (context, pooled) = self.encode_text(prompt)?;
        let (uncond_context, uncond_pooled) = self.encode_text(negative_prompt)?;
        Ok((
            Tensor::cat(&[context, uncond_context], 0)?,
            Tensor::cat(&[pooled, uncond_pooled], 0)?,
        ))
    }

    fn denoise(
        &self,
        sampler: &mut FlowSampler,
        mut latents: Tensor,
        (context, pooled): (&Tensor, &Tensor),
        guidance_scale: f64,
        start: usize,
    ) -> Result<Tensor> {
        let steps = sampler.steps();
        for index in start..steps {
            let timestep = sampler.sigmas()[index] * 1000.0;
            let prediction = self.mmdit.forward(
                &Tensor::cat(&[&latents, &latents], 0)?,
                &Tensor::full(timestep as f32, (2,), &self.device)?.contiguous()?,
                pooled,
                context,
                None,
            )?;
            let cond = prediction.narrow(0, 0, 1)?;
            let uncond = prediction.narrow(0, 1, 1)?;
            let velocity = ((cond * guidance_scale)? - (uncond * (guidance_scale - 1.0))?)?;
            latents = sampler.step(index, &latents, &velocity)?;
            debug!(step = index + 1, total = steps, "denoised");
        }
        Ok(latents)
    }

    fn decode(&self, latents: &Tensor, width: usize, height: usize) -> Result<DynamicImage> {
        let image = self.vae.decode(&((latents / VAE_SCALE)? + VAE_SHIFT)?)?;
        let image = image
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .clamp(-1f32, 1f32)?;
        let image = ((image + 1.0)? * 127.5)?.to_dtype(DType::U8)?.i(0)?;
        let image = image.narrow(1, 0, height)?.narrow(2, 0, width)?;
        tensor_to_image(&image)
    }
}

/// Latent (height, width) covering the image, rounded up to whole patches.
fn latent_size(width: usize, height: usize) -> (usize, usize) {
    (
        height.div_ceil(PATCH_PIXELS) * 2,
        width.div_ceil(PATCH_PIXELS) * 2,
    )
}

impl ModelLike for StableDiffusion3Model {
    fn scheduler(&self) -> &'static SchedulerDescriptor {
        self.scheduler
    }

    fn set_scheduler(&mut self, scheduler: &'static SchedulerDescriptor) -> Result<()> {
        self.scheduler = scheduler;
        Ok(())
    }

    fn run(&mut self, params: &SamplingParams) -> Result<DynamicImage> {
        self.seed(params.seed);
        let mut sampler = FlowSampler::new(self.scheduler.params, params.steps, DEFAULT_SHIFT);
        let (context, pooled) = self.encode_prompt(
            &params.prompt,
            params.negative_prompt.as_deref().unwrap_or(""),
        )?;

        let (latent_h, latent_w) = latent_size(params.width, params.height);
        let latents = (Tensor::randn(0f32, 1f32, (1, 16, latent_h, latent_w), &self.device)?
            * sampler.sigmas()[0])?
        .to_dtype(self.dtype)?;

        let latents = self.denoise(
            &mut sampler,
            latents,
            (&context, &pooled),
            params.guidance_scale,
            0,
        )?;
        self.decode(&latents, params.width, params.height)
    }

    fn rerender(&mut self, source: &DynamicImage, params: &RerenderParams) -> Result<DynamicImage> {
        let sampling = &params.sampling;
        self.seed(sampling.seed);
        let mut sampler = FlowSampler::new(self.scheduler.params, sampling.steps, DEFAULT_SHIFT);
        let (context, pooled) = self.encode_prompt(
            &sampling.prompt,
            sampling.negative_prompt.as_deref().unwrap_or(""),
        )?;

        let (latent_h, latent_w) = latent_size(sampling.width, sampling.height);
        let init_image = image_to_tensor(source, latent_w * 8, latent_h * 8)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let clean = ((self.vae.encode(&init_image)?.sample()? - VAE_SHIFT)? * VAE_SCALE)?;

        let steps = sampler.steps();
        let noised = ((steps as f64 * params.strength).ceil() as usize).clamp(1, steps);
        let start = steps - noised;
        let sigma = sampler.sigmas()[start];
        let noise = clean.randn_like(0f64, 1f64)?;
        let latents = ((clean * (1.0 - sigma))? + (noise * sigma)?)?;

        let latents = self.denoise(
            &mut sampler,
            latents,
            (&context, &pooled),
            sampling.guidance_scale,
            start,
        )?;
        self.decode(&latents, sampling.width, sampling.height)
    }
}

pub struct StableDiffusion3Loader;

impl StableDiffusion3Loader {
    pub async fn load(
        variant: Sd3Variant,
        api: Api,
        profile: &ModelProfile,
        device_map: DeviceMap,
        scheduler: &'static SchedulerDescriptor,
        options: &LoadOptions,
    ) -> Result<StableDiffusion3Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        // The MMDiT timestep embedding is always produced in f16.
        if profile.precision != Precision::F16 {
            warn!(
                model = %profile.model_id,
                precision = %profile.precision,
                "this pipeline family runs in f16, ignoring the profile precision"
            );
        }
        let dtype = DType::F16;
        let use_flash_attn = cfg!(feature = "flash-attn") && options.use_flash_attn;
        let repo = api.model(profile.model_id.clone());

        // --- Text encoders ---
        let clip_l_config = clip::Config::sdxl();
        let clip_l_file = repo
            .get("text_encoders/clip_l.safetensors")
            .await
            .context("failed to get clip_l weights")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[clip_l_file], dtype, &device)? };
        let clip_l = ClipEncoder::new(
            tokenizer(&api, "openai/clip-vit-large-patch14", "tokenizer.json").await?,
            ClipTextTransformer::new(vb, &clip_l_config).context("failed to build clip_l")?,
            &clip_l_config,
        )?;

        let clip_g_config = clip::Config::sdxl2();
        let clip_g_file = repo
            .get("text_encoders/clip_g.safetensors")
            .await
            .context("failed to get clip_g weights")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[clip_g_file], dtype, &device)? };
        let clip_g_projection =
            candle_nn::linear_no_bias(1280, 1280, vb.pp("text_projection"))?;
        let clip_g = ClipEncoder::new(
            tokenizer(&api, "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k", "tokenizer.json").await?,
            ClipTextTransformer::new(vb, &clip_g_config).context("failed to build clip_g")?,
            &clip_g_config,
        )?;

        let t5_config_file = repo
            .get("text_encoder_3/config.json")
            .await
            .context("failed to get t5 config")?;
        let t5_config: t5::Config = serde_json::from_str(&std::fs::read_to_string(t5_config_file)?)
            .context("invalid t5 config")?;
        let t5_file = repo
            .get("text_encoders/t5xxl_fp16.safetensors")
            .await
            .context("failed to get t5 weights")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[t5_file], dtype, &device)? };
        let t5 = T5Encoder {
            tokenizer: tokenizer(&api, "lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json").await?,
            model: t5::T5EncoderModel::load(vb, &t5_config).context("failed to build t5")?,
        };

        // --- MMDiT ---
        let checkpoint = repo
            .get(variant.checkpoint())
            .await
            .context("failed to get mmdit weights")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[checkpoint], dtype, &device)? };
        let mmdit = SendMmdit(
            MMDiT::new(
                &variant.mmdit_config(),
                use_flash_attn,
                vb.pp("model.diffusion_model"),
            )
            .context("failed to build mmdit")?,
        );

        // --- Autoencoder ---
        let vae_file = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get vae weights")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_file], dtype, &device)? };
        let vae = AutoEncoderKL::new(
            vb,
            3,
            3,
            AutoEncoderKLConfig {
                block_out_channels: vec![128, 256, 512, 512],
                layers_per_block: 2,
                latent_channels: 16,
                norm_num_groups: 32,
                use_quant_conv: false,
                use_post_quant_conv: false,
            },
        )
        .context("failed to build vae")?;

        Ok(StableDiffusion3Model {
            device,
            dtype,
            clip_l,
            clip_g,
            clip_g_projection,
            t5,
            mmdit,
            vae,
            scheduler,
        })
    }
}

async fn tokenizer(api: &Api, repo: &str, file: &str) -> Result<Tokenizer> {
    let path = api
        .model(repo.to_string())
        .get(file)
        .await
        .with_context(|| format!("failed to get tokenizer from {repo}"))?;
    Tokenizer::from_file(path)
        .map_err(E::msg)
        .context("failed to load tokenizer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_follows_the_model_id() {
        assert_eq!(
            Sd3Variant::from_model_id("stabilityai/stable-diffusion-3.5-medium"),
            Sd3Variant::Medium
        );
        assert_eq!(
            Sd3Variant::from_model_id("stabilityai/stable-diffusion-3.5-large"),
            Sd3Variant::Large
        );
        assert_eq!(Sd3Variant::Large.mmdit_config().depth, 38);
        assert_eq!(Sd3Variant::Medium.mmdit_config().depth, 24);
    }

    #[test]
    fn latents_cover_whole_patches() {
        assert_eq!(latent_size(1024, 1024), (128, 128));
        assert_eq!(latent_size(776, 520), (66, 98));
    }
}
