use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::QueueLimits;
use crate::profile::{build_profiles, ModelOverrides, ModelProfile};
use crate::{scheduler, DeviceMap, EaselError, LoadOptions, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceMap,
    /// Category directories are created beneath this.
    pub output_root: PathBuf,
    pub models: ModelOverrides,
    /// Active after every load.
    pub default_scheduler: String,
    pub load: LoadOptions,
    pub queue: QueueLimits,
    pub upscale: UpscaleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceMap::default(),
            output_root: PathBuf::from("outputs"),
            models: ModelOverrides::default(),
            default_scheduler: scheduler::DEFAULT_SCHEDULER.to_string(),
            load: LoadOptions::default(),
            queue: QueueLimits::default(),
            upscale: UpscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Re-render size multiplier for single and directory mode.
    pub rerender_factor: f64,
    /// Stage-1 size multiplier for high-res mode.
    pub highres_factor: f64,
    /// Share of the schedule re-noised by a re-render pass.
    pub strength: f64,
    pub super_resolution: Option<SuperResolutionConfig>,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            rerender_factor: 2.0,
            highres_factor: 4.0,
            strength: 0.35,
            super_resolution: None,
        }
    }
}

/// An ONNX super-resolution network taking and producing NCHW f32 in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperResolutionConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_sr_scale")]
    pub scale: u32,
    /// Defaults to the network's first input.
    #[serde(default)]
    pub input_name: Option<String>,
    /// Defaults to the network's first output.
    #[serde(default)]
    pub output_name: Option<String>,
}

fn default_sr_scale() -> u32 {
    2
}

impl SuperResolutionConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            scale: default_sr_scale(),
            input_name: None,
            output_name: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| EaselError::Validation(format!("config {}: {e}", path.display())))
    }

    /// The tier table with model overrides applied.
    pub fn profiles(&self) -> Result<Vec<ModelProfile>> {
        build_profiles(&self.models)
    }

    pub fn validate(&self) -> Result<()> {
        scheduler::resolve(&self.default_scheduler)?;
        self.profiles()?;

        let upscale = &self.upscale;
        for (name, factor) in [
            ("rerender_factor", upscale.rerender_factor),
            ("highres_factor", upscale.highres_factor),
        ] {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(EaselError::Validation(format!(
                    "upscale.{name} must be positive, got {factor}"
                )));
            }
        }
        if !(upscale.strength > 0.0 && upscale.strength <= 1.0) {
            return Err(EaselError::Validation(format!(
                "upscale.strength must be in (0, 1], got {}",
                upscale.strength
            )));
        }
        if let Some(sr) = &upscale.super_resolution {
            if sr.scale == 0 {
                return Err(EaselError::Validation(
                    "upscale.super_resolution.scale must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_scheduler, "DDIM");
        assert_eq!(config.upscale.rerender_factor, 2.0);
        assert_eq!(config.upscale.highres_factor, 4.0);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "device": "force_cpu",
                "output_root": "/tmp/easel",
                "queue": {{ "max_waiting": 4 }},
                "upscale": {{ "super_resolution": {{ "model_path": "x4.onnx" }} }}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.device, DeviceMap::ForceCpu);
        assert_eq!(config.output_root, PathBuf::from("/tmp/easel"));
        assert_eq!(config.queue.max_waiting, Some(4));
        assert_eq!(config.queue.max_wait_secs, None);
        assert_eq!(config.upscale.strength, 0.35);
        let sr = config.upscale.super_resolution.unwrap();
        assert_eq!(sr.scale, 2);
        assert_eq!(sr.input_name, None);
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(EaselError::Validation(_))
        ));
    }

    #[test]
    fn rejects_broken_settings() {
        let mut config = EngineConfig {
            default_scheduler: "Karras".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EaselError::SchedulerNotFound(_))));

        config.default_scheduler = "unipc".into();
        config.upscale.strength = 0.0;
        assert!(config.validate().is_err());

        config.upscale.strength = 1.0;
        config.upscale.highres_factor = 0.0;
        assert!(config.validate().is_err());

        config.upscale.highres_factor = 4.0;
        config.models.medium = Some("not/a-known-model".into());
        assert!(config.validate().is_err());
    }
}
