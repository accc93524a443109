use serde::{Deserialize, Serialize};

use crate::scheduler::{self, SchedulerDescriptor};
use crate::store::is_bare_name;
use crate::upscale::UpscaleBackend;
use crate::{EaselError, Result, SamplingParams};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, ugly, bad anatomy, deformed hands,deformed fingers,extra limbs, poorly drawn face";

pub const MIN_STEPS: usize = 1;
pub const MAX_STEPS: usize = 100;
pub const MIN_GUIDANCE: f64 = 1.0;
pub const MAX_GUIDANCE: f64 = 20.0;
pub const MIN_SIDE: usize = 256;
pub const MAX_SIDE: usize = 2048;
/// Pixel stride of the latent space; sizes must be multiples of it.
pub const LATENT_STRIDE: usize = 8;

pub const DEFAULT_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".bmp", ".tiff"];

fn default_negative_prompt() -> Option<String> {
    Some(DEFAULT_NEGATIVE_PROMPT.to_string())
}
fn default_steps() -> usize {
    50
}
fn default_upscale_steps() -> usize {
    75
}
fn default_guidance() -> f64 {
    7.0
}
fn default_scheduler_guidance() -> f64 {
    7.5
}
fn default_side() -> usize {
    1024
}
fn default_scheduler_side() -> usize {
    768
}
fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_side")]
    pub height: usize,
    #[serde(default = "default_side")]
    pub width: usize,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Chain the fresh artifact through the upscaler before returning.
    #[serde(default)]
    pub upscale: bool,
    /// Upscale guidance prompt; the generation prompt when absent.
    #[serde(default)]
    pub upscale_prompt: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: default_negative_prompt(),
            steps: default_steps(),
            guidance_scale: default_guidance(),
            height: default_side(),
            width: default_side(),
            scheduler: None,
            seed: None,
            upscale: false,
            upscale_prompt: None,
        }
    }

    /// Checks, in order: prompt, steps, guidance, height, width, then the
    /// scheduler override's registry membership.
    pub fn validate(&self) -> Result<(SamplingParams, Option<&'static SchedulerDescriptor>)> {
        let sampling = validate_sampling(
            &self.prompt,
            self.negative_prompt.as_deref(),
            self.steps,
            self.guidance_scale,
            self.height,
            self.width,
            self.seed,
        )?;
        let scheduler = self.scheduler.as_deref().map(scheduler::resolve).transpose()?;
        Ok((sampling, scheduler))
    }
}

/// One generation under a named scheduler, stored under a deterministic name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerRequest {
    pub prompt: String,
    pub scheduler_name: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: usize,
    #[serde(default = "default_scheduler_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_scheduler_side")]
    pub height: usize,
    #[serde(default = "default_scheduler_side")]
    pub width: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub filename_prefix: Option<String>,
}

impl SchedulerRequest {
    pub fn new(prompt: impl Into<String>, scheduler_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            scheduler_name: scheduler_name.into(),
            negative_prompt: default_negative_prompt(),
            steps: default_steps(),
            guidance_scale: default_scheduler_guidance(),
            height: default_scheduler_side(),
            width: default_scheduler_side(),
            seed: None,
            filename_prefix: None,
        }
    }

    pub fn validate(&self) -> Result<(SamplingParams, &'static SchedulerDescriptor)> {
        let sampling = validate_sampling(
            &self.prompt,
            self.negative_prompt.as_deref(),
            self.steps,
            self.guidance_scale,
            self.height,
            self.width,
            self.seed,
        )?;
        if let Some(prefix) = &self.filename_prefix {
            validate_prefix(prefix)?;
        }
        Ok((sampling, scheduler::resolve(&self.scheduler_name)?))
    }
}

/// A scheduler sweep. Names are not checked here: an unknown name becomes a
/// failed item of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: Option<String>,
    /// Every registered scheduler, in registry order, when absent.
    #[serde(default, alias = "schedulers_to_test")]
    pub schedulers: Option<Vec<String>>,
    #[serde(default = "default_steps", alias = "num_inference_steps")]
    pub steps: usize,
    #[serde(default = "default_scheduler_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_scheduler_side")]
    pub height: usize,
    #[serde(default = "default_scheduler_side")]
    pub width: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub filename_prefix: Option<String>,
}

impl CompareRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: default_negative_prompt(),
            schedulers: None,
            steps: default_steps(),
            guidance_scale: default_scheduler_guidance(),
            height: default_scheduler_side(),
            width: default_scheduler_side(),
            seed: None,
            filename_prefix: None,
        }
    }

    pub fn validate(&self) -> Result<(SamplingParams, Vec<String>)> {
        let sampling = validate_sampling(
            &self.prompt,
            self.negative_prompt.as_deref(),
            self.steps,
            self.guidance_scale,
            self.height,
            self.width,
            self.seed,
        )?;
        if let Some(prefix) = &self.filename_prefix {
            validate_prefix(prefix)?;
        }
        let names = match &self.schedulers {
            Some(names) if names.is_empty() => {
                return Err(EaselError::Validation("scheduler list is empty".into()))
            }
            Some(names) => names.clone(),
            None => scheduler::list_schedulers()
                .into_iter()
                .map(String::from)
                .collect(),
        };
        Ok((sampling, names))
    }
}

/// Prompt and sampling knobs of an upscale; the size comes from the source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhanceSettings {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl EnhanceSettings {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            steps: default_upscale_steps(),
            guidance_scale: default_scheduler_guidance(),
            seed: None,
        }
    }

    fn validated(self) -> Result<Self> {
        validate_prompt(&self.prompt)?;
        validate_steps(self.steps)?;
        validate_guidance(self.guidance_scale)?;
        Ok(self)
    }

    /// Sampling parameters for an output of `width` x `height`.
    pub fn sampling(&self, width: usize, height: usize) -> SamplingParams {
        SamplingParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            width,
            height,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleRequest {
    /// Bare artifact filename, resolved through the store.
    pub input_file: String,
    pub prompt: String,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default = "default_upscale_steps", alias = "num_inference_steps")]
    pub steps: usize,
    #[serde(default = "default_scheduler_guidance")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub backend: UpscaleBackend,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl UpscaleRequest {
    pub fn new(input_file: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            input_file: input_file.into(),
            prompt: prompt.into(),
            output_file: None,
            steps: default_upscale_steps(),
            guidance_scale: default_scheduler_guidance(),
            backend: UpscaleBackend::default(),
            seed: None,
        }
    }

    pub fn settings(&self) -> Result<EnhanceSettings> {
        if let Some(name) = &self.output_file {
            validate_output_name(name)?;
        }
        EnhanceSettings {
            prompt: self.prompt.clone(),
            negative_prompt: None,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
        }
        .validated()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleDirectoryRequest {
    pub input_directory: String,
    pub prompt: String,
    #[serde(default = "default_extensions", alias = "file_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_upscale_steps", alias = "num_inference_steps")]
    pub steps: usize,
    #[serde(default = "default_scheduler_guidance")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub backend: UpscaleBackend,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl UpscaleDirectoryRequest {
    pub fn new(input_directory: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            input_directory: input_directory.into(),
            prompt: prompt.into(),
            extensions: default_extensions(),
            steps: default_upscale_steps(),
            guidance_scale: default_scheduler_guidance(),
            backend: UpscaleBackend::default(),
            seed: None,
        }
    }

    pub fn settings(&self) -> Result<EnhanceSettings> {
        if self.extensions.is_empty() {
            return Err(EaselError::Validation("extension list is empty".into()));
        }
        EnhanceSettings {
            prompt: self.prompt.clone(),
            negative_prompt: None,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
        }
        .validated()
    }

    /// Lower-cased extensions without the leading dot.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighResRequest {
    pub input_file: String,
    pub prompt: String,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default = "default_upscale_steps", alias = "sd_steps")]
    pub steps: usize,
    #[serde(default = "default_scheduler_guidance", alias = "sd_guidance_scale")]
    pub guidance_scale: f64,
    /// Run the super-resolution network on the stage-1 output.
    #[serde(default, alias = "use_swinir")]
    pub use_super_resolution: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl HighResRequest {
    pub fn new(input_file: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            input_file: input_file.into(),
            prompt: prompt.into(),
            output_file: None,
            steps: default_upscale_steps(),
            guidance_scale: default_scheduler_guidance(),
            use_super_resolution: false,
            seed: None,
        }
    }

    pub fn settings(&self) -> Result<EnhanceSettings> {
        if let Some(name) = &self.output_file {
            validate_output_name(name)?;
        }
        EnhanceSettings {
            prompt: self.prompt.clone(),
            negative_prompt: None,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
        }
        .validated()
    }
}

pub(crate) fn validate_sampling(
    prompt: &str,
    negative_prompt: Option<&str>,
    steps: usize,
    guidance_scale: f64,
    height: usize,
    width: usize,
    seed: Option<u64>,
) -> Result<SamplingParams> {
    validate_prompt(prompt)?;
    validate_steps(steps)?;
    validate_guidance(guidance_scale)?;
    validate_side("height", height)?;
    validate_side("width", width)?;
    Ok(SamplingParams {
        prompt: prompt.to_string(),
        negative_prompt: negative_prompt.map(str::to_string),
        steps,
        guidance_scale,
        width,
        height,
        seed,
    })
}

fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(EaselError::Validation("prompt must not be empty".into()));
    }
    Ok(())
}

fn validate_steps(steps: usize) -> Result<()> {
    if !(MIN_STEPS..=MAX_STEPS).contains(&steps) {
        return Err(EaselError::Validation(format!(
            "steps must be within {MIN_STEPS}..={MAX_STEPS}, got {steps}"
        )));
    }
    Ok(())
}

fn validate_guidance(guidance_scale: f64) -> Result<()> {
    // NaN fails the range check.
    if !(MIN_GUIDANCE..=MAX_GUIDANCE).contains(&guidance_scale) {
        return Err(EaselError::Validation(format!(
            "guidance_scale must be within {MIN_GUIDANCE}..={MAX_GUIDANCE}, got {guidance_scale}"
        )));
    }
    Ok(())
}

fn validate_side(name: &str, value: usize) -> Result<()> {
    if !(MIN_SIDE..=MAX_SIDE).contains(&value) {
        return Err(EaselError::Validation(format!(
            "{name} must be within {MIN_SIDE}..={MAX_SIDE}, got {value}"
        )));
    }
    if value % LATENT_STRIDE != 0 {
        return Err(EaselError::Validation(format!(
            "{name} must be a multiple of {LATENT_STRIDE}, got {value}"
        )));
    }
    Ok(())
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if !is_bare_name(prefix) {
        return Err(EaselError::Validation(format!(
            "filename prefix '{prefix}' must be a bare name"
        )));
    }
    Ok(())
}

/// Output names are bare filenames; `.png` is appended when missing.
pub(crate) fn validate_output_name(name: &str) -> Result<String> {
    if !is_bare_name(name) {
        return Err(EaselError::Validation(format!(
            "output file '{name}' must be a bare filename"
        )));
    }
    if name.to_ascii_lowercase().ends_with(".png") {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}.png"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: EaselError) -> String {
        match err {
            EaselError::Validation(reason) => reason,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let req: GenerationRequest = serde_json::from_str(r#"{"prompt": "a lighthouse"}"#).unwrap();
        assert_eq!(req, GenerationRequest::new("a lighthouse"));
        assert_eq!(req.steps, 50);
        assert_eq!(req.guidance_scale, 7.0);
        assert_eq!((req.width, req.height), (1024, 1024));
        assert_eq!(req.negative_prompt.as_deref(), Some(DEFAULT_NEGATIVE_PROMPT));

        let req: SchedulerRequest =
            serde_json::from_str(r#"{"prompt": "p", "scheduler_name": "UniPC"}"#).unwrap();
        assert_eq!((req.width, req.height, req.guidance_scale), (768, 768, 7.5));

        let req: HighResRequest =
            serde_json::from_str(r#"{"input_file": "a.png", "prompt": "p", "use_swinir": true}"#)
                .unwrap();
        assert!(req.use_super_resolution);
        assert_eq!(req.steps, 75);
    }

    #[test]
    fn aliases_from_the_legacy_field_names() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt": "p", "num_inference_steps": 20}"#).unwrap();
        assert_eq!(req.steps, 20);

        let req: CompareRequest =
            serde_json::from_str(r#"{"prompt": "p", "schedulers_to_test": ["DDIM"]}"#).unwrap();
        assert_eq!(req.schedulers, Some(vec!["DDIM".to_string()]));
    }

    #[test]
    fn validation_checks_bounds_in_order() {
        let mut req = GenerationRequest::new("   ");
        req.steps = 0;
        assert!(reason(req.validate().unwrap_err()).contains("prompt"));

        req.prompt = "p".into();
        assert!(reason(req.validate().unwrap_err()).contains("steps"));

        req.steps = 100;
        req.guidance_scale = 20.5;
        assert!(reason(req.validate().unwrap_err()).contains("guidance"));

        req.guidance_scale = f64::NAN;
        assert!(reason(req.validate().unwrap_err()).contains("guidance"));

        req.guidance_scale = 1.0;
        req.height = 2056;
        assert!(reason(req.validate().unwrap_err()).contains("height"));

        req.height = 2048;
        req.width = 260;
        assert!(reason(req.validate().unwrap_err()).contains("multiple of 8"));

        req.width = 256;
        req.validate().unwrap();
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut req = GenerationRequest::new("p");
        req.steps = 1;
        req.guidance_scale = 20.0;
        req.width = 2048;
        req.height = 256;
        let (sampling, scheduler) = req.validate().unwrap();
        assert_eq!(sampling.steps, 1);
        assert!(scheduler.is_none());
    }

    #[test]
    fn scheduler_checked_after_bounds() {
        let mut req = GenerationRequest::new("p");
        req.scheduler = Some("Karras".into());
        assert!(matches!(req.validate(), Err(EaselError::SchedulerNotFound(_))));

        req.steps = 500;
        assert!(matches!(req.validate(), Err(EaselError::Validation(_))));

        req.steps = 10;
        req.scheduler = Some("eulerancestral".into());
        assert_eq!(req.validate().unwrap().1.unwrap().name, "EulerAncestral");
    }

    #[test]
    fn compare_defaults_to_every_scheduler() {
        let (_, names) = CompareRequest::new("p").validate().unwrap();
        assert_eq!(names, scheduler::list_schedulers());

        let mut req = CompareRequest::new("p");
        req.schedulers = Some(vec!["DDIM".into(), "Bogus".into()]);
        assert_eq!(req.validate().unwrap().1, vec!["DDIM", "Bogus"]);

        req.schedulers = Some(vec![]);
        assert!(req.validate().is_err());

        req.schedulers = None;
        req.filename_prefix = Some("../escape".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn output_names_must_be_bare() {
        assert_eq!(validate_output_name("big").unwrap(), "big.png");
        assert_eq!(validate_output_name("big.PNG").unwrap(), "big.PNG");
        assert!(validate_output_name("../big.png").is_err());
        assert!(validate_output_name("dir/big.png").is_err());
        assert!(validate_output_name("").is_err());

        let mut req = UpscaleRequest::new("a.png", "sharper");
        req.output_file = Some("a/b.png".into());
        assert!(req.settings().is_err());
    }

    #[test]
    fn directory_extensions_are_normalized() {
        let mut req = UpscaleDirectoryRequest::new("in", "p");
        req.extensions = vec![".PNG".into(), "jpg".into(), " .Tiff ".into(), ".".into()];
        assert_eq!(req.normalized_extensions(), vec!["png", "jpg", "tiff"]);

        req.extensions.clear();
        assert!(req.settings().is_err());
    }
}
