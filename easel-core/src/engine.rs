use std::sync::Arc;

use hf_hub::api::tokio::Api;
use tracing::{info, warn};

use crate::config::UpscaleConfig;
use crate::generate::{GenerationOutcome, Generator};
use crate::probe::probe_for;
use crate::request::{
    CompareRequest, GenerationRequest, HighResRequest, SchedulerRequest, UpscaleDirectoryRequest,
    UpscaleRequest,
};
use crate::upscale::{Capabilities, UpscaleOutcome, Upscaler};
use crate::{
    scheduler, Artifact, ArtifactStore, BatchResult, EngineConfig, HealthReport, HubLoader, Loader,
    ModelProfile, PipelineManager, ResourceProbe, Result, SchedulerDescriptor, SuperResolution,
};

pub struct Engine {
    config: EngineConfig,
    pipeline: Arc<PipelineManager>,
    store: Arc<ArtifactStore>,
    upscaler: Arc<Upscaler>,
    generator: Generator,
}

impl Engine {
    /// Wires an engine from explicit parts. Nothing is loaded until the
    /// first request or [`Engine::preload`].
    pub fn new(
        config: EngineConfig,
        probe: Arc<dyn ResourceProbe>,
        loader: Arc<dyn Loader>,
        super_resolution: Option<Arc<dyn SuperResolution>>,
    ) -> Result<Self> {
        config.validate()?;
        let default_scheduler = scheduler::resolve(&config.default_scheduler)?;
        let pipeline = Arc::new(PipelineManager::new(
            probe,
            loader,
            config.profiles()?,
            config.device,
            default_scheduler,
            config.queue,
        )?);
        let store = Arc::new(ArtifactStore::open(&config.output_root)?);
        let upscaler = Arc::new(Upscaler::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            super_resolution,
            config.upscale.clone(),
        ));
        let generator = Generator::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            Arc::clone(&upscaler),
        );
        info!(
            output_root = %config.output_root.display(),
            device = ?config.device,
            default_scheduler = default_scheduler.name,
            artifacts = store.list().len(),
            "engine ready"
        );
        Ok(Self {
            config,
            pipeline,
            store,
            upscaler,
            generator,
        })
    }

    /// The production wiring: hub-backed loader, the probe matching the
    /// device, and the ONNX network when one is configured and built in.
    pub fn from_config(
        config: EngineConfig,
        api: Api,
        assume_memory_gib: Option<f64>,
    ) -> Result<Self> {
        let probe: Arc<dyn ResourceProbe> = Arc::from(probe_for(config.device, assume_memory_gib));
        let loader: Arc<dyn Loader> = Arc::new(HubLoader::new(api, config.load.clone()));
        let super_resolution = super_resolution_for(&config.upscale);
        Self::new(config, probe, loader, super_resolution)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<PipelineManager> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub async fn preload(&self) -> Result<ModelProfile> {
        self.pipeline.ensure_loaded().await
    }

    pub async fn reload(&self) -> Result<ModelProfile> {
        self.pipeline.reload().await
    }

    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await
    }

    pub fn health(&self) -> HealthReport {
        self.pipeline.health()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.upscaler.capabilities()
    }

    pub async fn generate(&self, req: &GenerationRequest) -> Result<GenerationOutcome> {
        self.generator.generate(req).await
    }

    pub async fn generate_with_scheduler(
        &self,
        req: &SchedulerRequest,
    ) -> Result<GenerationOutcome> {
        self.generator.generate_with_scheduler(req).await
    }

    pub async fn compare(&self, req: &CompareRequest) -> Result<BatchResult> {
        self.generator.compare(req).await
    }

    pub async fn upscale_file(&self, req: &UpscaleRequest) -> Result<UpscaleOutcome> {
        self.upscaler.upscale_file(req).await
    }

    pub async fn upscale_directory(&self, req: &UpscaleDirectoryRequest) -> Result<BatchResult> {
        self.upscaler.upscale_directory(req).await
    }

    pub async fn upscale_highres(&self, req: &HighResRequest) -> Result<UpscaleOutcome> {
        self.upscaler.upscale_highres(req).await
    }

    /// Registered scheduler names in registry order.
    pub fn schedulers(&self) -> Vec<&'static str> {
        scheduler::list_schedulers()
    }

    pub fn active_scheduler(&self) -> &'static SchedulerDescriptor {
        self.pipeline.active_scheduler()
    }

    pub async fn apply_scheduler(&self, name: &str) -> Result<&'static SchedulerDescriptor> {
        self.pipeline.apply_scheduler(name).await
    }

    pub fn list_files(&self) -> Vec<Artifact> {
        self.store.list()
    }

    pub fn download(&self, filename: &str) -> Result<(Artifact, Vec<u8>)> {
        self.store.read(filename)
    }
}

#[cfg(feature = "super-res")]
fn super_resolution_for(config: &UpscaleConfig) -> Option<Arc<dyn SuperResolution>> {
    let sr = config.super_resolution.as_ref()?;
    match crate::OnnxSuperResolution::load(sr) {
        Ok(network) => Some(Arc::new(network)),
        Err(err) => {
            warn!(model = %sr.model_path.display(), error = %format!("{err:#}"), "super-resolution unavailable");
            None
        }
    }
}

#[cfg(not(feature = "super-res"))]
fn super_resolution_for(config: &UpscaleConfig) -> Option<Arc<dyn SuperResolution>> {
    if let Some(sr) = &config.super_resolution {
        warn!(
            model = %sr.model_path.display(),
            "built without the `super-res` feature; super-resolution unavailable"
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::probe::FixedProbe;
    use crate::request::EnhanceSettings;
    use crate::testing::{MockLoader, MockSuperResolution};
    use crate::{ArtifactCategory, EaselError, PipelineStatus, Tier};

    fn engine(dir: &tempfile::TempDir, gib: f64) -> (Engine, Arc<MockLoader>) {
        let config = EngineConfig {
            output_root: dir.path().join("out"),
            ..EngineConfig::default()
        };
        let loader = Arc::new(MockLoader::new());
        let engine = Engine::new(
            config,
            Arc::new(FixedProbe::gib(gib)),
            loader.clone(),
            Some(Arc::new(MockSuperResolution::new(2))),
        )
        .unwrap();
        (engine, loader)
    }

    #[tokio::test]
    async fn preload_picks_the_tier_for_device_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, loader) = engine(&dir, 80.0);
        assert!(!engine.health().ready);

        let profile = engine.preload().await.unwrap();
        assert_eq!(profile.tier, Tier::Large);
        let health = engine.health();
        assert!(health.ready);
        assert_eq!(health.profile, Some(profile));
        assert_eq!(health.active_scheduler, "DDIM");
        assert_eq!(loader.state().loads(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            output_root: dir.path().to_path_buf(),
            default_scheduler: "PNDM".into(),
            ..EngineConfig::default()
        };
        let result = Engine::new(
            config,
            Arc::new(FixedProbe::gib(16.0)),
            Arc::new(MockLoader::new()),
            None,
        );
        assert!(matches!(result, Err(EaselError::SchedulerNotFound(_))));
    }

    #[tokio::test]
    async fn generated_artifacts_are_listed_and_downloadable() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(&dir, 16.0);
        let mut req = GenerationRequest::new("lighthouse");
        req.width = 256;
        req.height = 256;
        let outcome = engine.generate(&req).await.unwrap();

        let listed = engine.list_files();
        assert_eq!(listed, vec![outcome.artifact.clone()]);
        let (artifact, bytes) = engine.download(&outcome.artifact.filename).unwrap();
        assert_eq!(artifact.category, ArtifactCategory::Generation);
        assert_eq!(bytes.len() as u64, artifact.size_bytes);
        assert!(matches!(
            engine.download("nope.png"),
            Err(EaselError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn apply_scheduler_persists_across_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, loader) = engine(&dir, 16.0);
        assert_eq!(engine.apply_scheduler("unipc").await.unwrap().name, "UniPC");
        assert_eq!(engine.active_scheduler().name, "UniPC");

        let mut req = GenerationRequest::new("orchard");
        req.width = 256;
        req.height = 256;
        assert_eq!(engine.generate(&req).await.unwrap().scheduler, "UniPC");
        assert_eq!(loader.state().runs()[0].scheduler_at_start, "UniPC");

        assert!(matches!(
            engine.apply_scheduler("Karras").await,
            Err(EaselError::SchedulerNotFound(_))
        ));
        assert_eq!(engine.active_scheduler().name, "UniPC");
    }

    #[tokio::test]
    async fn shutdown_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, loader) = engine(&dir, 30.0);
        engine.preload().await.unwrap();
        engine.shutdown().await;
        assert_eq!(engine.health().status, PipelineStatus::ShutDown);

        let mut req = GenerationRequest::new("after shutdown");
        req.width = 256;
        req.height = 256;
        assert!(engine.generate(&req).await.is_err());

        engine.reload().await.unwrap();
        assert!(engine.health().ready);
        assert!(engine.generate(&req).await.is_ok());
        assert_eq!(loader.state().loads(), 2);
    }

    #[tokio::test]
    async fn reports_super_resolution_capability() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(&dir, 16.0);
        let caps = engine.capabilities();
        assert!(caps.rerender);
        assert_eq!(caps.super_resolution.unwrap().scale, 2);
    }

    #[cfg(not(feature = "super-res"))]
    #[test]
    fn configured_network_is_absent_without_the_feature() {
        use crate::config::SuperResolutionConfig;

        let upscale = UpscaleConfig {
            super_resolution: Some(SuperResolutionConfig::new("x4.onnx")),
            ..UpscaleConfig::default()
        };
        assert!(super_resolution_for(&upscale).is_none());
    }

    #[tokio::test]
    async fn upscales_a_generated_artifact_in_place_of_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(&dir, 16.0);
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(128, 96, Rgb([1, 2, 3])));
        let artifact = engine
            .store()
            .store(&source, ArtifactCategory::Generation, "seed image", None)
            .unwrap();

        let settings = EnhanceSettings::new("sharper");
        let outcome = engine
            .upscaler
            .upscale_artifact(&artifact, &settings)
            .await
            .unwrap();
        assert_eq!(outcome.artifact.category, ArtifactCategory::Upscale);
        assert!(outcome.artifact.filename.starts_with("seed_image_"));
    }
}
