use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{self as sd_schedulers, PredictionType, Scheduler, SchedulerConfig},
    uni_pc::UniPCSchedulerConfig,
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::scheduler::{SchedulerParams, TimestepSpacing};
use crate::util::{image_to_tensor, select_best_device, tensor_to_image};
use crate::{
    DeviceMap, LoadOptions, ModelLike, ModelProfile, Precision, RerenderParams, SamplingParams,
    SchedulerDescriptor,
};

/// Stable Diffusion generations the candle UNet pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVariant {
    V2_1,
    Xl,
}

impl SdVariant {
    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            SdVariant::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
            SdVariant::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
        }
    }

    /// (weights directory, tokenizer repository) per text encoder, in
    /// embedding concatenation order.
    fn text_encoders(self) -> &'static [(&'static str, &'static str)] {
        match self {
            SdVariant::V2_1 => &[("text_encoder", "openai/clip-vit-base-patch32")],
            SdVariant::Xl => &[
                ("text_encoder", "openai/clip-vit-large-patch14"),
                ("text_encoder_2", "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k"),
            ],
        }
    }

    fn vae_scale(self) -> f64 {
        match self {
            SdVariant::V2_1 => 0.18215,
            SdVariant::Xl => 0.13025,
        }
    }

    fn prediction_type(self) -> PredictionType {
        match self {
            SdVariant::V2_1 => PredictionType::VPrediction,
            SdVariant::Xl => PredictionType::Epsilon,
        }
    }
}

fn timestep_spacing(spacing: TimestepSpacing) -> sd_schedulers::TimestepSpacing {
    match spacing {
        TimestepSpacing::Leading => sd_schedulers::TimestepSpacing::Leading,
        TimestepSpacing::Linspace => sd_schedulers::TimestepSpacing::Linspace,
        TimestepSpacing::Trailing => sd_schedulers::TimestepSpacing::Trailing,
    }
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    fn new(
        tokenizer: Tokenizer,
        model: ClipTextTransformer,
        config: &stable_diffusion::clip::Config,
    ) -> Result<Self> {
        let pad = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad)
            .with_context(|| format!("tokenizer has no '{pad}' token"))?;
        Ok(Self {
            tokenizer,
            model,
            pad_id,
            max_len: config.max_position_embeddings,
        })
    }

    fn encode(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    variant: SdVariant,
    device: Device,
    dtype: DType,
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler: &'static SchedulerDescriptor,
}

impl StableDiffusionModel {
    fn build_scheduler(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        let scheduler = match self.scheduler.params {
            SchedulerParams::Ddim { spacing } => DDIMSchedulerConfig {
                prediction_type: self.variant.prediction_type(),
                timestep_spacing: timestep_spacing(spacing),
                ..Default::default()
            }
            .build(steps)?,
            SchedulerParams::EulerAncestral { spacing } => EulerAncestralDiscreteSchedulerConfig {
                prediction_type: self.variant.prediction_type(),
                timestep_spacing: timestep_spacing(spacing),
                ..Default::default()
            }
            .build(steps)?,
            SchedulerParams::UniPc { solver_order } => UniPCSchedulerConfig {
                prediction_type: self.variant.prediction_type(),
                solver_order,
                ..Default::default()
            }
            .build(steps)?,
        };
        Ok(scheduler)
    }

    fn seed(&self, seed: Option<u64>) {
        if let Some(seed) = seed {
            if let Err(e) = self.device.set_seed(seed) {
                warn!(seed, error = %e, "device does not support seeding, continuing unseeded");
            }
        }
    }

    /// Unconditional and conditional embeddings stacked on the batch axis,
    /// each text encoder's output concatenated on the feature axis.
    fn encode_prompt(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(self.text_encoders.len());
        for encoder in &self.text_encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let uncond = encoder.encode(negative_prompt, &self.device)?;
            per_encoder.push(Tensor::cat(&[uncond, cond], 0)?);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn denoise(
        &self,
        scheduler: &mut dyn Scheduler,
        mut latents: Tensor,
        text_embeddings: &Tensor,
        guidance_scale: f64,
        t_start: usize,
    ) -> Result<Tensor> {
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (noise_pred_uncond
                + ((noise_pred_text - noise_pred_uncond)? * guidance_scale)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoised");
        }
        Ok(latents)
    }

    fn decode(&self, latents: &Tensor) -> Result<DynamicImage> {
        let image = self.vae.decode(&(latents / self.variant.vae_scale())?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

impl ModelLike for StableDiffusionModel {
    fn scheduler(&self) -> &'static SchedulerDescriptor {
        self.scheduler
    }

    fn set_scheduler(&mut self, scheduler: &'static SchedulerDescriptor) -> Result<()> {
        self.scheduler = scheduler;
        Ok(())
    }

    fn run(&mut self, params: &SamplingParams) -> Result<DynamicImage> {
        self.seed(params.seed);
        let mut scheduler = self.build_scheduler(params.steps)?;
        let text_embeddings = self.encode_prompt(
            &params.prompt,
            params.negative_prompt.as_deref().unwrap_or(""),
        )?;

        let latents = (Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )? * scheduler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        let latents = self.denoise(
            scheduler.as_mut(),
            latents,
            &text_embeddings,
            params.guidance_scale,
            0,
        )?;
        self.decode(&latents)
    }

    fn rerender(&mut self, source: &DynamicImage, params: &RerenderParams) -> Result<DynamicImage> {
        let sampling = &params.sampling;
        self.seed(sampling.seed);
        let mut scheduler = self.build_scheduler(sampling.steps)?;
        let text_embeddings = self.encode_prompt(
            &sampling.prompt,
            sampling.negative_prompt.as_deref().unwrap_or(""),
        )?;

        let init_image = image_to_tensor(source, sampling.width, sampling.height)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let latents = (self.vae.encode(&init_image)?.sample()? * self.variant.vae_scale())?;

        let timesteps = scheduler.timesteps().to_vec();
        if timesteps.is_empty() {
            anyhow::bail!("scheduler produced no timesteps");
        }
        let noised = ((timesteps.len() as f64 * params.strength).ceil() as usize)
            .clamp(1, timesteps.len());
        let t_start = timesteps.len() - noised;
        let noise = latents.randn_like(0f64, 1f64)?;
        let latents = scheduler.add_noise(&latents, noise, timesteps[t_start])?;

        let latents = self.denoise(
            scheduler.as_mut(),
            latents,
            &text_embeddings,
            sampling.guidance_scale,
            t_start,
        )?;
        self.decode(&latents)
    }
}

pub struct StableDiffusionLoader;

impl StableDiffusionLoader {
    pub async fn load(
        variant: SdVariant,
        api: Api,
        profile: &ModelProfile,
        device_map: DeviceMap,
        scheduler: &'static SchedulerDescriptor,
        options: &LoadOptions,
    ) -> Result<StableDiffusionModel> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = profile.precision.dtype();
        let config = variant.config(options.sliced_attention_size);
        let use_flash_attn = cfg!(feature = "flash-attn") && options.use_flash_attn;

        let repo = api.model(profile.model_id.clone());
        let suffix = if profile.precision == Precision::F16 {
            ".fp16"
        } else {
            ""
        };

        // --- Text encoders and their tokenizers ---
        let mut text_encoders = Vec::new();
        for (index, (weights_dir, tokenizer_repo)) in variant.text_encoders().iter().enumerate() {
            let clip_config = if index == 0 {
                &config.clip
            } else {
                config
                    .clip2
                    .as_ref()
                    .context("pipeline has no second text encoder config")?
            };
            let tokenizer_file = api
                .model(tokenizer_repo.to_string())
                .get("tokenizer.json")
                .await
                .with_context(|| format!("failed to get tokenizer from {tokenizer_repo}"))?;
            let tokenizer = Tokenizer::from_file(tokenizer_file)
                .map_err(E::msg)
                .context("failed to load tokenizer")?;
            let weights = repo
                .get(&format!("{weights_dir}/model{suffix}.safetensors"))
                .await
                .with_context(|| format!("failed to get {weights_dir} weights"))?;
            let model =
                stable_diffusion::build_clip_transformer(clip_config, weights, &device, DType::F32)
                    .with_context(|| format!("failed to build {weights_dir}"))?;
            text_encoders.push(TextEncoder::new(tokenizer, model, clip_config)?);
        }

        // --- UNet ---
        let unet_file = repo
            .get(&format!("unet/diffusion_pytorch_model{suffix}.safetensors"))
            .await
            .context("failed to get unet weights")?;
        let unet = config
            .build_unet(unet_file, &device, 4, use_flash_attn, dtype)
            .context("failed to build unet")?;

        // --- Autoencoder ---
        let vae_file = repo
            .get(&format!("vae/diffusion_pytorch_model{suffix}.safetensors"))
            .await
            .context("failed to get vae weights")?;
        let vae = config
            .build_vae(vae_file, &device, dtype)
            .context("failed to build vae")?;

        Ok(StableDiffusionModel {
            variant,
            device,
            dtype,
            text_encoders,
            unet,
            vae,
            scheduler,
        })
    }
}
