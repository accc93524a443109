use tracing::{info, warn};
use uuid::Uuid;

use crate::generate::{summary, Generator};
use crate::request::CompareRequest;
use crate::scheduler;
use crate::util::sanitize_fragment;
use crate::{ArtifactCategory, BatchResult, Result};

pub const COMPARISON_PREFIX: &str = "scheduler_test";

/// `{prefix}_{prompt fragment}_{scheduler}_{steps}steps.png`. Identical
/// inputs give identical names, so a rerun replaces the earlier image.
pub fn comparison_filename(prefix: &str, prompt: &str, scheduler: &str, steps: usize) -> String {
    format!(
        "{prefix}_{}_{}_{steps}steps.png",
        sanitize_fragment(prompt, 30),
        scheduler.to_lowercase()
    )
}

impl Generator {
    /// Runs the sweep in the caller's order. An unknown name or a failed
    /// pass is recorded against its item and the sweep continues.
    pub async fn compare(&self, req: &CompareRequest) -> Result<BatchResult> {
        let (mut sampling, names) = req.validate()?;
        // Every item shares one seed so they differ only by scheduler.
        let seed = sampling
            .seed
            .unwrap_or_else(|| Uuid::new_v4().as_u64_pair().0);
        sampling.seed = Some(seed);
        let prefix = req.filename_prefix.as_deref().unwrap_or(COMPARISON_PREFIX);
        info!(schedulers = names.len(), seed, steps = sampling.steps, "starting scheduler comparison");

        let mut batch = BatchResult::default();
        for name in names {
            let descriptor = match scheduler::resolve(&name) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(scheduler = %name, error = %err, "skipping unknown scheduler");
                    batch.push_failure(name, &err);
                    continue;
                }
            };

            let filename =
                comparison_filename(prefix, &sampling.prompt, descriptor.name, sampling.steps);
            let stored = match self.render(sampling.clone(), Some(descriptor)).await {
                Ok((image, used)) => self.store.store_named(
                    &image,
                    ArtifactCategory::SchedulerComparison,
                    &filename,
                    Some(summary("compare", used, &sampling)),
                ),
                Err(err) => Err(err),
            };
            match stored {
                Ok(artifact) => {
                    info!(scheduler = descriptor.name, filename = %artifact.filename, "comparison item done");
                    batch.push_success(name, artifact);
                }
                Err(err) => {
                    warn!(scheduler = descriptor.name, error = %err, "comparison item failed");
                    batch.push_failure(name, &err);
                }
            }
        }
        info!(
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            "scheduler comparison finished"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::config::UpscaleConfig;
    use crate::pipeline::QueueLimits;
    use crate::probe::FixedProbe;
    use crate::profile::default_profiles;
    use crate::testing::MockLoader;
    use crate::upscale::Upscaler;
    use crate::{ArtifactStore, DeviceMap, EaselError, ItemOutcome, PipelineManager};

    fn generator(dir: &tempfile::TempDir, loader: Arc<MockLoader>) -> Generator {
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let pipeline = Arc::new(
            PipelineManager::new(
                Arc::new(FixedProbe::gib(30.0)),
                loader,
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
        Generator::new(pipeline, store, upscaler)
    }

    fn request(names: &[&str]) -> CompareRequest {
        CompareRequest {
            schedulers: Some(names.iter().map(|n| n.to_string()).collect()),
            steps: 10,
            width: 256,
            height: 256,
            ..CompareRequest::new("Misty forest, dawn")
        }
    }

    #[test]
    fn filenames_are_deterministic() {
        assert_eq!(
            comparison_filename("scheduler_test", "Misty forest, dawn", "EulerAncestral", 30),
            "scheduler_test_misty_forest_dawn_eulerancestral_30steps.png"
        );
        assert_eq!(
            comparison_filename("p", "x", "DDIM", 1),
            comparison_filename("p", "x", "DDIM", 1)
        );
    }

    #[tokio::test]
    async fn unknown_scheduler_fails_only_its_item() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(MockLoader::new());
        let generator = generator(&dir, loader.clone());

        let batch = generator
            .compare(&request(&["UniPC", "Bogus", "DDIMTrailing"]))
            .await
            .unwrap();

        let labels: Vec<_> = batch.items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["UniPC", "Bogus", "DDIMTrailing"]);
        assert!(batch.items[0].outcome.is_success());
        assert!(matches!(
            &batch.items[1].outcome,
            ItemOutcome::Failure { code: "scheduler_not_found", .. }
        ));
        assert!(batch.items[2].outcome.is_success());

        let names: Vec<_> = batch.artifacts().map(|a| a.filename.clone()).collect();
        assert_eq!(
            names,
            vec![
                "scheduler_test_misty_forest_dawn_unipc_10steps.png",
                "scheduler_test_misty_forest_dawn_ddimtrailing_10steps.png",
            ]
        );

        let runs = loader.state().runs();
        let used: Vec<_> = runs.iter().map(|r| r.scheduler_at_start).collect();
        assert_eq!(used, vec!["UniPC", "DDIMTrailing"]);
        let seeds: HashSet<_> = runs.iter().map(|r| r.seed).collect();
        assert_eq!(seeds.len(), 1);
        assert!(runs[0].seed.is_some());
    }

    #[tokio::test]
    async fn failed_pass_does_not_abort_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(MockLoader::new().failing_on("Misty"));
        let generator = generator(&dir, loader);
        let batch = generator.compare(&request(&["DDIM", "UniPC"])).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.failed(), 2);
        assert!(matches!(
            &batch.items[0].outcome,
            ItemOutcome::Failure { code: "internal_generation_error", .. }
        ));
    }

    #[tokio::test]
    async fn default_sweep_covers_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(MockLoader::new());
        let generator = generator(&dir, loader);
        let mut req = request(&[]);
        req.schedulers = None;
        req.seed = Some(42);
        req.filename_prefix = Some("sweep".into());

        let batch = generator.compare(&req).await.unwrap();
        assert_eq!(batch.succeeded(), scheduler::SCHEDULERS.len());
        let labels: Vec<_> = batch.items.iter().map(|i| i.label.clone()).collect();
        assert_eq!(labels, scheduler::list_schedulers());
        assert!(batch.artifacts().all(|a| a.filename.starts_with("sweep_")));

        // A rerun overwrites rather than accumulating files.
        generator.compare(&req).await.unwrap();
        assert_eq!(generator.store.list().len(), scheduler::SCHEDULERS.len());
    }

    #[tokio::test]
    async fn invalid_sweep_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(&dir, Arc::new(MockLoader::new()));
        let mut req = request(&["DDIM"]);
        req.guidance_scale = 0.5;
        assert!(matches!(generator.compare(&req).await, Err(EaselError::Validation(_))));
        assert_eq!(generator.pipeline.acquisitions(), 0);
    }
}
