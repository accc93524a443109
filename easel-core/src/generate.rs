use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;
use tracing::{info, warn};

use crate::request::{EnhanceSettings, GenerationRequest, SchedulerRequest};
use crate::scheduler::SchedulerDescriptor;
use crate::upscale::{UpscaleOutcome, Upscaler};
use crate::util::sanitize_fragment;
use crate::{Artifact, ArtifactCategory, ArtifactStore, PipelineManager, Result, SamplingParams};

pub(crate) const SINGLE_SCHEDULER_PREFIX: &str = "single_scheduler";

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub artifact: Artifact,
    /// Scheduler in effect during the pass.
    pub scheduler: &'static str,
    pub seed: Option<u64>,
    /// Present when the request chained an upscale.
    pub upscaled: Option<UpscaleOutcome>,
    /// Why a chained upscale failed. `artifact` is still stored and valid.
    pub upscale_error: Option<String>,
}

impl GenerationOutcome {
    /// The artifact handed back to the caller: the upscaled one when chained.
    pub fn delivered(&self) -> &Artifact {
        self.upscaled
            .as_ref()
            .map_or(&self.artifact, |upscaled| &upscaled.artifact)
    }
}

/// Single-image generation, and the scheduler comparisons layered on it.
pub struct Generator {
    pub(crate) pipeline: Arc<PipelineManager>,
    pub(crate) store: Arc<ArtifactStore>,
    upscaler: Arc<Upscaler>,
}

impl Generator {
    pub fn new(
        pipeline: Arc<PipelineManager>,
        store: Arc<ArtifactStore>,
        upscaler: Arc<Upscaler>,
    ) -> Self {
        Self {
            pipeline,
            store,
            upscaler,
        }
    }

    /// One sampling pass, under `scheduler` or the active one.
    pub(crate) async fn render(
        &self,
        sampling: SamplingParams,
        scheduler: Option<&'static SchedulerDescriptor>,
    ) -> Result<(DynamicImage, &'static str)> {
        self.pipeline
            .with_pipeline(scheduler, move |model| {
                let image = model.run(&sampling)?;
                Ok((image, model.scheduler().name))
            })
            .await
    }

    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationOutcome> {
        let (sampling, scheduler) = req.validate()?;
        let seed = sampling.seed;
        let (image, used) = self.render(sampling.clone(), scheduler).await?;

        let descriptor = sanitize_fragment(&sampling.prompt, 30);
        let artifact = self.store.store(
            &image,
            ArtifactCategory::Generation,
            &descriptor,
            Some(summary("generate", used, &sampling)),
        )?;
        info!(
            filename = %artifact.filename,
            scheduler = used,
            steps = sampling.steps,
            width = sampling.width,
            height = sampling.height,
            "generated image"
        );

        let (upscaled, upscale_error) = if req.upscale {
            let settings = EnhanceSettings {
                prompt: req
                    .upscale_prompt
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| sampling.prompt.clone()),
                seed,
                ..EnhanceSettings::new(String::new())
            };
            match self.upscaler.upscale_artifact(&artifact, &settings).await {
                Ok(outcome) => (Some(outcome), None),
                Err(e) => {
                    warn!(
                        filename = %artifact.filename,
                        code = e.code(),
                        error = %e,
                        "chained upscale failed; returning the generated image"
                    );
                    (None, Some(format!("{}: {e}", e.code())))
                }
            }
        } else {
            (None, None)
        };

        Ok(GenerationOutcome {
            artifact,
            scheduler: used,
            seed,
            upscaled,
            upscale_error,
        })
    }

    /// Generates under a named scheduler and stores the result under the
    /// deterministic comparison name, replacing an earlier identical run.
    pub async fn generate_with_scheduler(&self, req: &SchedulerRequest) -> Result<GenerationOutcome> {
        let (sampling, scheduler) = req.validate()?;
        let prefix = req
            .filename_prefix
            .as_deref()
            .unwrap_or(SINGLE_SCHEDULER_PREFIX);
        let filename =
            crate::compare::comparison_filename(prefix, &sampling.prompt, scheduler.name, sampling.steps);

        let (image, used) = self.render(sampling.clone(), Some(scheduler)).await?;
        let artifact = self.store.store_named(
            &image,
            ArtifactCategory::SchedulerComparison,
            &filename,
            Some(summary("generate-scheduler", used, &sampling)),
        )?;
        info!(filename = %artifact.filename, scheduler = used, "generated with scheduler");
        Ok(GenerationOutcome {
            artifact,
            scheduler: used,
            seed: sampling.seed,
            upscaled: None,
            upscale_error: None,
        })
    }
}

pub(crate) fn summary(kind: &str, scheduler: &str, sampling: &SamplingParams) -> String {
    format!(
        "{kind}[{scheduler}, {} steps, {}x{}]: {}",
        sampling.steps, sampling.width, sampling.height, sampling.prompt
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::config::UpscaleConfig;
    use crate::pipeline::QueueLimits;
    use crate::probe::FixedProbe;
    use crate::profile::default_profiles;
    use crate::scheduler;
    use crate::testing::MockLoader;
    use crate::util::encode_png;
    use crate::{DeviceMap, EaselError};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ArtifactStore>,
        pipeline: Arc<PipelineManager>,
        loader: Arc<MockLoader>,
        generator: Generator,
    }

    fn fixture(loader: MockLoader) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let loader = Arc::new(loader);
        let pipeline = Arc::new(
            PipelineManager::new(
                Arc::new(FixedProbe::gib(24.0)),
                loader.clone(),
                default_profiles(),
                DeviceMap::ForceCpu,
                scheduler::resolve("DDIM").unwrap(),
                QueueLimits::default(),
            )
            .unwrap(),
        );
        let upscaler = Arc::new(Upscaler::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            None,
            UpscaleConfig::default(),
        ));
        let generator = Generator::new(Arc::clone(&pipeline), Arc::clone(&store), upscaler);
        Fixture {
            _dir: dir,
            store,
            pipeline,
            loader,
            generator,
        }
    }

    fn small(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            width: 256,
            height: 256,
            steps: 4,
            ..GenerationRequest::new(prompt)
        }
    }

    #[tokio::test]
    async fn generate_then_download_round_trips() {
        let fx = fixture(MockLoader::new());
        let outcome = fx.generator.generate(&small("a red fox")).await.unwrap();

        assert_eq!(outcome.artifact.category, ArtifactCategory::Generation);
        assert!(outcome.artifact.filename.starts_with("a_red_fox_"));
        assert_eq!(outcome.scheduler, "DDIM");
        assert_eq!(outcome.delivered(), &outcome.artifact);

        let (_, bytes) = fx.store.read(&outcome.artifact.filename).unwrap();
        let expected = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([9, 64, 128])));
        assert_eq!(bytes, encode_png(&expected).unwrap());
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_pipeline() {
        let fx = fixture(MockLoader::new());

        let mut req = small("p");
        req.steps = 0;
        assert!(matches!(fx.generator.generate(&req).await, Err(EaselError::Validation(_))));

        let mut req = small("p");
        req.scheduler = Some("Karras".into());
        assert!(matches!(
            fx.generator.generate(&req).await,
            Err(EaselError::SchedulerNotFound(_))
        ));

        assert_eq!(fx.pipeline.acquisitions(), 0);
        assert_eq!(fx.loader.state().load_attempts(), 0);
    }

    #[tokio::test]
    async fn failed_pass_leaves_pipeline_reusable() {
        let fx = fixture(MockLoader::new().failing_on("explode"));
        let mut req = small("explode please");
        req.scheduler = Some("UniPC".into());
        assert!(matches!(
            fx.generator.generate(&req).await,
            Err(EaselError::InternalGeneration(_))
        ));

        let outcome = fx.generator.generate(&small("calm lake")).await.unwrap();
        assert_eq!(outcome.scheduler, "DDIM");
        assert_eq!(fx.loader.state().loads(), 1);
        assert!(fx.store.list().iter().all(|a| !a.filename.starts_with("explode")));
    }

    #[tokio::test]
    async fn chained_upscale_returns_enhanced_artifact() {
        let fx = fixture(MockLoader::new());
        let mut req = small("harbour at dusk");
        req.upscale = true;
        req.seed = Some(7);
        let outcome = fx.generator.generate(&req).await.unwrap();

        let upscaled = outcome.upscaled.as_ref().unwrap();
        assert_eq!(upscaled.artifact.category, ArtifactCategory::Upscale);
        assert_eq!(outcome.delivered(), &upscaled.artifact);

        let runs = fx.loader.state().runs();
        assert_eq!(runs.len(), 2);
        assert!(!runs[0].rerender);
        assert!(runs[1].rerender);
        assert_eq!(runs[1].prompt, "harbour at dusk");
        assert_eq!((runs[1].width, runs[1].height), (512, 512));
        assert_eq!(runs[1].seed, Some(7));
    }

    #[tokio::test]
    async fn failed_chained_upscale_keeps_the_generated_artifact() {
        let fx = fixture(MockLoader::new().failing_on("explode"));
        let mut req = small("quiet meadow");
        req.upscale = true;
        req.upscale_prompt = Some("explode the meadow".into());
        let outcome = fx.generator.generate(&req).await.unwrap();

        assert!(outcome.upscaled.is_none());
        let reason = outcome.upscale_error.as_deref().unwrap();
        assert!(reason.starts_with("internal_generation_error"), "{reason}");
        assert_eq!(outcome.delivered(), &outcome.artifact);
        assert_eq!(outcome.artifact.category, ArtifactCategory::Generation);
        fx.store.read(&outcome.artifact.filename).unwrap();
        assert_eq!(fx.store.list().len(), 1);
        let runs = fx.loader.state().runs();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].rerender);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_generations_keep_their_schedulers() {
        let fx = Arc::new(fixture(
            MockLoader::new().with_pass_time(Duration::from_millis(15)),
        ));
        let tasks: Vec<_> = ["DDIM", "UniPC", "EulerAncestral", "DDIMTrailing"]
            .into_iter()
            .cycle()
            .take(12)
            .map(|name| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move {
                    let mut req = small(name);
                    req.scheduler = Some(name.to_string());
                    (name, fx.generator.generate(&req).await.unwrap())
                })
            })
            .collect();
        for task in tasks {
            let (requested, outcome) = task.await.unwrap();
            assert_eq!(outcome.scheduler, requested);
        }

        let state = fx.loader.state();
        assert_eq!(state.max_in_flight(), 1);
        for run in state.runs() {
            assert_eq!(run.scheduler_at_start, run.prompt);
            assert_eq!(run.scheduler_at_end, run.prompt);
        }
        assert_eq!(fx.pipeline.active_scheduler().name, "DDIM");
    }

    #[tokio::test]
    async fn scheduler_generation_uses_deterministic_names() {
        let fx = fixture(MockLoader::new());
        let mut req = SchedulerRequest::new("A red fox!", "unipc");
        req.steps = 20;
        req.width = 256;
        req.height = 256;

        let first = fx.generator.generate_with_scheduler(&req).await.unwrap();
        assert_eq!(first.artifact.filename, "single_scheduler_a_red_fox_unipc_20steps.png");
        assert_eq!(first.artifact.category, ArtifactCategory::SchedulerComparison);
        assert_eq!(first.scheduler, "UniPC");

        let second = fx.generator.generate_with_scheduler(&req).await.unwrap();
        assert_eq!(second.artifact.filename, first.artifact.filename);
        assert_eq!(fx.store.list().len(), 1);

        req.scheduler_name = "Bogus".into();
        assert!(matches!(
            fx.generator.generate_with_scheduler(&req).await,
            Err(EaselError::SchedulerNotFound(_))
        ));
    }
}
