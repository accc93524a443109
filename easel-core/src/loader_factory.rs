use anyhow::Result;
use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sd::{SdVariant, StableDiffusionLoader};
use crate::sd3::{Sd3Variant, StableDiffusion3Loader};
use crate::{DeviceMap, Loader, ModelLike, ModelProfile, PipelineFamily, SchedulerDescriptor};

/// Knobs forwarded to every back end at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Only honoured when built with the `flash-attn` feature.
    pub use_flash_attn: bool,
    pub sliced_attention_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(SdVariant),
    StableDiffusion3(Sd3Variant),
}

impl ModelVariant {
    /// Detect the variant for a profile. The id wins over the profile's
    /// recorded family so a mislabelled override is caught here.
    pub fn for_profile(profile: &ModelProfile) -> Self {
        let family = PipelineFamily::from_model_id(&profile.model_id).unwrap_or(profile.family);
        match family {
            PipelineFamily::StableDiffusion2 => ModelVariant::StableDiffusion(SdVariant::V2_1),
            PipelineFamily::StableDiffusionXl => ModelVariant::StableDiffusion(SdVariant::Xl),
            PipelineFamily::StableDiffusion3 => {
                ModelVariant::StableDiffusion3(Sd3Variant::from_model_id(&profile.model_id))
            }
        }
    }
}

/// Loads pipelines from the Hugging Face hub, picking the back end from the
/// profile's model id.
pub struct HubLoader {
    api: Api,
    options: LoadOptions,
}

impl HubLoader {
    pub fn new(api: Api, options: LoadOptions) -> Self {
        Self { api, options }
    }
}

#[async_trait]
impl Loader for HubLoader {
    async fn load(
        &self,
        profile: &ModelProfile,
        device_map: DeviceMap,
        scheduler: &'static SchedulerDescriptor,
    ) -> Result<Box<dyn ModelLike>> {
        let variant = ModelVariant::for_profile(profile);

        info!(
            model = %profile.model_id,
            ?variant,
            precision = %profile.precision,
            device = %device_map,
            "loading model"
        );

        match variant {
            ModelVariant::StableDiffusion(sd_variant) => {
                let model = StableDiffusionLoader::load(
                    sd_variant,
                    self.api.clone(),
                    profile,
                    device_map,
                    scheduler,
                    &self.options,
                )
                .await?;
                Ok(Box::new(model))
            }
            ModelVariant::StableDiffusion3(sd3_variant) => {
                let model = StableDiffusion3Loader::load(
                    sd3_variant,
                    self.api.clone(),
                    profile,
                    device_map,
                    scheduler,
                    &self.options,
                )
                .await?;
                Ok(Box::new(model))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::default_profiles;

    #[test]
    fn default_tiers_map_to_variants() {
        let variants: Vec<_> = default_profiles()
            .iter()
            .map(ModelVariant::for_profile)
            .collect();
        assert_eq!(
            variants,
            vec![
                ModelVariant::StableDiffusion(SdVariant::V2_1),
                ModelVariant::StableDiffusion3(Sd3Variant::Medium),
                ModelVariant::StableDiffusion3(Sd3Variant::Large),
            ]
        );
    }

    #[test]
    fn model_id_overrides_recorded_family() {
        let mut profile = default_profiles().remove(0);
        profile.model_id = "stabilityai/sdxl-turbo-XL".into();
        assert_eq!(
            ModelVariant::for_profile(&profile),
            ModelVariant::StableDiffusion(SdVariant::Xl)
        );
    }
}
