pub mod batch;
pub mod compare;
pub mod config;
pub mod device_map;
pub mod engine;
pub mod error;
pub mod generate;
pub mod loader;
mod loader_factory;
pub mod pipeline;
pub mod probe;
pub mod profile;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod upscale;
mod util;

mod sd;
mod sd3;
#[cfg(feature = "super-res")]
mod superres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use batch::{BatchItem, BatchResult, ItemOutcome};
pub use config::EngineConfig;
pub use device_map::*;
pub use engine::Engine;
pub use error::{EaselError, Result};
pub use loader::*;
pub use loader_factory::*;
pub use pipeline::{HealthReport, PipelineManager, PipelineStatus, QueueLimits};
pub use probe::{ResourceProbe, ResourceSnapshot};
pub use profile::{ModelProfile, PipelineFamily, Precision, Tier};
pub use scheduler::SchedulerDescriptor;
pub use store::{Artifact, ArtifactCategory, ArtifactStore};
#[cfg(feature = "super-res")]
pub use superres::OnnxSuperResolution;
pub use upscale::{SuperResolution, UpscaleBackend};

use image::DynamicImage;
use serde::Serialize;

/// Validated parameters of one sampling pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

/// An image-to-image pass: `sampling.width`/`height` is the output size and
/// `strength` in (0, 1] is the share of the schedule that is re-noised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerenderParams {
    pub sampling: SamplingParams,
    pub strength: f64,
}

/// A loaded, device-resident pipeline.
///
/// Only [`PipelineManager`] holds one; callers never see it directly.
pub trait ModelLike: Send {
    fn scheduler(&self) -> &'static SchedulerDescriptor;

    fn set_scheduler(&mut self, scheduler: &'static SchedulerDescriptor) -> anyhow::Result<()>;

    fn run(&mut self, params: &SamplingParams) -> anyhow::Result<DynamicImage>;

    fn rerender(
        &mut self,
        source: &DynamicImage,
        params: &RerenderParams,
    ) -> anyhow::Result<DynamicImage>;
}
