use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::probe::GIB;
use crate::{EaselError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    Bf16,
    F32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }
}

/// The pipeline architecture a model id is loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineFamily {
    StableDiffusion2,
    StableDiffusionXl,
    StableDiffusion3,
}

serde_plain::derive_display_from_serialize!(PipelineFamily);
serde_plain::derive_fromstr_from_deserialize!(PipelineFamily);

impl PipelineFamily {
    /// Detect the family from a model id.
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let name_upper = model_id.to_uppercase();

        if name_upper.contains("DIFFUSION-3") || name_upper.contains("SD3") {
            Some(PipelineFamily::StableDiffusion3)
        } else if name_upper.contains("XL") {
            Some(PipelineFamily::StableDiffusionXl)
        } else if name_upper.contains("2-1") || name_upper.contains("2.1") || name_upper.contains("2-BASE") {
            Some(PipelineFamily::StableDiffusion2)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

serde_plain::derive_display_from_serialize!(Tier);

/// One row of the tier table.
///
/// A profile covers device memory `m` with `above < m <= up_to`; a missing
/// bound is open (0 below, infinity above).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelProfile {
    pub tier: Tier,
    pub above: Option<u64>,
    pub up_to: Option<u64>,
    pub model_id: String,
    pub family: PipelineFamily,
    pub precision: Precision,
}

impl ModelProfile {
    pub fn contains(&self, memory: u64) -> bool {
        self.above.map_or(true, |low| memory > low) && self.up_to.map_or(true, |high| memory <= high)
    }
}

/// Replaces a tier's model. A bare string is a model id; the object form
/// can also change the precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierOverride {
    ModelId(String),
    Model {
        model_id: String,
        #[serde(default)]
        precision: Option<Precision>,
    },
}

impl TierOverride {
    pub fn model_id(&self) -> &str {
        match self {
            TierOverride::ModelId(model_id) | TierOverride::Model { model_id, .. } => model_id,
        }
    }

    pub fn precision(&self) -> Option<Precision> {
        match self {
            TierOverride::ModelId(_) => None,
            TierOverride::Model { precision, .. } => *precision,
        }
    }
}

impl From<&str> for TierOverride {
    fn from(model_id: &str) -> Self {
        TierOverride::ModelId(model_id.to_string())
    }
}

/// Per-tier overrides; the family is detected from the model id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOverrides {
    pub small: Option<TierOverride>,
    pub medium: Option<TierOverride>,
    pub large: Option<TierOverride>,
}

/// Default table: <= 24 GiB, (24, 48] GiB, > 48 GiB.
pub fn default_profiles() -> Vec<ModelProfile> {
    vec![
        ModelProfile {
            tier: Tier::Small,
            above: None,
            up_to: Some(24 * GIB),
            model_id: "stabilityai/stable-diffusion-2-1".to_string(),
            family: PipelineFamily::StableDiffusion2,
            precision: Precision::F16,
        },
        ModelProfile {
            tier: Tier::Medium,
            above: Some(24 * GIB),
            up_to: Some(48 * GIB),
            model_id: "stabilityai/stable-diffusion-3.5-medium".to_string(),
            family: PipelineFamily::StableDiffusion3,
            precision: Precision::F16,
        },
        ModelProfile {
            tier: Tier::Large,
            above: Some(48 * GIB),
            up_to: None,
            model_id: "stabilityai/stable-diffusion-3.5-large".to_string(),
            family: PipelineFamily::StableDiffusion3,
            precision: Precision::F16,
        },
    ]
}

/// Default table with the overrides applied.
pub fn build_profiles(overrides: &ModelOverrides) -> Result<Vec<ModelProfile>> {
    let mut profiles = default_profiles();
    for profile in profiles.iter_mut() {
        let replacement = match profile.tier {
            Tier::Small => &overrides.small,
            Tier::Medium => &overrides.medium,
            Tier::Large => &overrides.large,
        };
        if let Some(replacement) = replacement {
            let model_id = replacement.model_id();
            profile.family = PipelineFamily::from_model_id(model_id).ok_or_else(|| {
                EaselError::Validation(format!("unsupported model family for '{model_id}'"))
            })?;
            profile.model_id = model_id.to_string();
            if let Some(precision) = replacement.precision() {
                profile.precision = precision;
            }
        }
    }
    validate_tiers(&profiles)?;
    Ok(profiles)
}

/// Checks the table is ordered, contiguous, non-overlapping and covers `[0, inf)`.
pub fn validate_tiers(profiles: &[ModelProfile]) -> Result<()> {
    let invalid = |msg: String| Err(EaselError::Validation(format!("tier table: {msg}")));

    let (Some(first), Some(last)) = (profiles.first(), profiles.last()) else {
        return invalid("empty".into());
    };
    if first.above.is_some() {
        return invalid(format!("{} tier must start at zero", first.tier));
    }
    if last.up_to.is_some() {
        return invalid(format!("{} tier must be unbounded above", last.tier));
    }
    for pair in profiles.windows(2) {
        let (lower, upper) = (&pair[0], &pair[1]);
        match (lower.up_to, upper.above) {
            (Some(high), Some(low)) if high == low => {}
            _ => {
                return invalid(format!(
                    "{} and {} tiers are not contiguous",
                    lower.tier, upper.tier
                ))
            }
        }
        if let (Some(low), Some(high)) = (lower.above, lower.up_to) {
            if low >= high {
                return invalid(format!("{} tier is empty", lower.tier));
            }
        }
    }
    Ok(())
}

/// The profile whose tier contains `memory` bytes.
pub fn select_profile(profiles: &[ModelProfile], memory: u64) -> Option<&ModelProfile> {
    profiles.iter().find(|profile| profile.contains(memory))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier_for(gib: f64) -> Tier {
        let profiles = default_profiles();
        select_profile(&profiles, (gib * GIB as f64) as u64).unwrap().tier
    }

    #[test]
    fn tier_boundaries_are_exact() {
        assert_eq!(tier_for(0.0), Tier::Small);
        assert_eq!(tier_for(24.0), Tier::Small);
        assert_eq!(tier_for(24.0001), Tier::Medium);
        assert_eq!(tier_for(48.0), Tier::Medium);
        assert_eq!(tier_for(48.0001), Tier::Large);
        assert_eq!(tier_for(80.0), Tier::Large);
    }

    #[test]
    fn byte_level_boundaries() {
        let profiles = default_profiles();
        assert_eq!(select_profile(&profiles, 24 * GIB).unwrap().tier, Tier::Small);
        assert_eq!(select_profile(&profiles, 24 * GIB + 1).unwrap().tier, Tier::Medium);
        assert_eq!(select_profile(&profiles, u64::MAX).unwrap().tier, Tier::Large);
    }

    #[test]
    fn default_table_is_valid() {
        validate_tiers(&default_profiles()).unwrap();
    }

    #[test]
    fn larger_tiers_load_larger_models() {
        let models: Vec<_> = default_profiles().into_iter().map(|p| p.model_id).collect();
        assert_eq!(
            models,
            vec![
                "stabilityai/stable-diffusion-2-1",
                "stabilityai/stable-diffusion-3.5-medium",
                "stabilityai/stable-diffusion-3.5-large",
            ]
        );
    }

    #[test]
    fn gaps_and_open_ends_are_rejected() {
        let mut gap = default_profiles();
        gap[1].above = Some(25 * GIB);
        assert!(validate_tiers(&gap).is_err());

        let mut bounded = default_profiles();
        bounded[2].up_to = Some(96 * GIB);
        assert!(validate_tiers(&bounded).is_err());

        let mut floor = default_profiles();
        floor[0].above = Some(GIB);
        assert!(validate_tiers(&floor).is_err());

        assert!(validate_tiers(&[]).is_err());
    }

    #[test]
    fn family_detection() {
        assert_eq!(
            PipelineFamily::from_model_id("stabilityai/stable-diffusion-xl-base-1.0"),
            Some(PipelineFamily::StableDiffusionXl)
        );
        assert_eq!(
            PipelineFamily::from_model_id("stabilityai/stable-diffusion-2-1"),
            Some(PipelineFamily::StableDiffusion2)
        );
        assert_eq!(
            PipelineFamily::from_model_id("stabilityai/stable-diffusion-3.5-large"),
            Some(PipelineFamily::StableDiffusion3)
        );
        assert_eq!(
            PipelineFamily::from_model_id("stabilityai/stable-diffusion-3-medium"),
            Some(PipelineFamily::StableDiffusion3)
        );
        assert_eq!(PipelineFamily::from_model_id("black-forest-labs/FLUX.1-schnell"), None);
    }

    #[test]
    fn overrides_replace_model_and_family() {
        let overrides = ModelOverrides {
            large: Some("stabilityai/stable-diffusion-2-1-base".into()),
            ..Default::default()
        };
        let profiles = build_profiles(&overrides).unwrap();
        assert_eq!(profiles[2].model_id, "stabilityai/stable-diffusion-2-1-base");
        assert_eq!(profiles[2].family, PipelineFamily::StableDiffusion2);

        let unknown = ModelOverrides {
            small: Some("some/unknown-model".into()),
            ..Default::default()
        };
        assert!(matches!(build_profiles(&unknown), Err(EaselError::Validation(_))));
    }

    #[test]
    fn overrides_accept_an_id_or_an_object() {
        let overrides: ModelOverrides = serde_json::from_str(
            r#"{
                "small": "stabilityai/stable-diffusion-2-1-base",
                "large": {"model_id": "stabilityai/stable-diffusion-xl-base-1.0", "precision": "bf16"}
            }"#,
        )
        .unwrap();
        let profiles = build_profiles(&overrides).unwrap();
        assert_eq!(profiles[0].precision, Precision::F16);
        assert_eq!(profiles[2].family, PipelineFamily::StableDiffusionXl);
        assert_eq!(profiles[2].precision, Precision::Bf16);
        assert_eq!(profiles[1].model_id, "stabilityai/stable-diffusion-3.5-medium");
    }

    #[test]
    fn precision_round_trips_through_strings() {
        assert_eq!("bf16".parse::<Precision>().unwrap(), Precision::Bf16);
        assert_eq!(Precision::F16.to_string(), "f16");
        assert_eq!(Precision::F32.dtype(), DType::F32);
    }
}
