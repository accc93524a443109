use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::UpscaleConfig;
use crate::request::{
    validate_output_name, EnhanceSettings, HighResRequest, UpscaleDirectoryRequest, UpscaleRequest,
    LATENT_STRIDE, MAX_SIDE, MIN_SIDE,
};
use crate::util::fit_dimensions;
use crate::{
    Artifact, ArtifactCategory, ArtifactStore, BatchResult, EaselError, PipelineManager,
    RerenderParams, Result,
};

/// A dedicated super-resolution network. Runs outside the pipeline lock.
pub trait SuperResolution: Send + Sync {
    fn name(&self) -> &str;

    /// Output size over input size, per side.
    fn scale(&self) -> u32;

    fn upscale(&self, image: &DynamicImage) -> anyhow::Result<DynamicImage>;
}

/// Which back ends an upscale runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpscaleBackend {
    /// img2img through the loaded pipeline at a larger size.
    #[default]
    Rerender,
    SuperResolution,
    /// Re-render, then the super-resolution network.
    Chained,
}

impl UpscaleBackend {
    fn needs_super_resolution(self) -> bool {
        matches!(self, UpscaleBackend::SuperResolution | UpscaleBackend::Chained)
    }

    fn rerenders(self) -> bool {
        matches!(self, UpscaleBackend::Rerender | UpscaleBackend::Chained)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Rerender,
    SuperResolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpscaleOutcome {
    pub artifact: Artifact,
    pub stages: Vec<Stage>,
    /// Set when the super-resolution stage was asked for but is not available.
    pub degraded: bool,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub rerender: bool,
    pub super_resolution: Option<SuperResolutionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuperResolutionInfo {
    pub name: String,
    pub scale: u32,
}

pub struct Upscaler {
    pipeline: Arc<PipelineManager>,
    store: Arc<ArtifactStore>,
    super_resolution: Option<Arc<dyn SuperResolution>>,
    config: UpscaleConfig,
}

impl Upscaler {
    pub fn new(
        pipeline: Arc<PipelineManager>,
        store: Arc<ArtifactStore>,
        super_resolution: Option<Arc<dyn SuperResolution>>,
        config: UpscaleConfig,
    ) -> Self {
        Self {
            pipeline,
            store,
            super_resolution,
            config,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            rerender: true,
            super_resolution: self.super_resolution.as_ref().map(|sr| SuperResolutionInfo {
                name: sr.name().to_string(),
                scale: sr.scale(),
            }),
        }
    }

    fn require(&self, backend: UpscaleBackend) -> Result<()> {
        if backend.needs_super_resolution() && self.super_resolution.is_none() {
            return Err(EaselError::UpscaleBackendUnavailable(
                "no super-resolution network is configured".into(),
            ));
        }
        Ok(())
    }

    /// Re-renders `source` at `factor` times its size through the pipeline.
    async fn rerender(
        &self,
        source: DynamicImage,
        settings: &EnhanceSettings,
        factor: f64,
    ) -> Result<DynamicImage> {
        let (width, height) = fit_dimensions(
            source.width(),
            source.height(),
            factor,
            MIN_SIDE,
            MAX_SIDE,
            LATENT_STRIDE,
        );
        let params = RerenderParams {
            sampling: settings.sampling(width, height),
            strength: self.config.strength,
        };
        self.pipeline
            .with_pipeline(None, move |model| model.rerender(&source, &params))
            .await
    }

    async fn super_resolve(&self, source: DynamicImage) -> Result<DynamicImage> {
        let network = self.super_resolution.clone().ok_or_else(|| {
            EaselError::UpscaleBackendUnavailable("no super-resolution network is configured".into())
        })?;
        tokio::task::spawn_blocking(move || network.upscale(&source))
            .await
            .map_err(|e| EaselError::InternalGeneration(format!("super-resolution aborted: {e}")))?
            .map_err(EaselError::generation)
    }

    /// Runs `backend` over `source`. Capability must already be checked.
    async fn enhance(
        &self,
        source: DynamicImage,
        settings: &EnhanceSettings,
        backend: UpscaleBackend,
        factor: f64,
    ) -> Result<(DynamicImage, Vec<Stage>)> {
        let mut stages = Vec::new();
        let mut image = source;
        if backend.rerenders() {
            image = self.rerender(image, settings, factor).await?;
            stages.push(Stage::Rerender);
        }
        if backend.needs_super_resolution() {
            image = self.super_resolve(image).await?;
            stages.push(Stage::SuperResolution);
        }
        Ok((image, stages))
    }

    fn save(
        &self,
        image: &DynamicImage,
        output_file: Option<&str>,
        descriptor: &str,
        source: String,
    ) -> Result<Artifact> {
        match output_file {
            Some(name) => self.store.store_named(
                image,
                ArtifactCategory::Upscale,
                &validate_output_name(name)?,
                Some(source),
            ),
            None => self
                .store
                .store(image, ArtifactCategory::Upscale, descriptor, Some(source)),
        }
    }

    /// Upscales one stored artifact, found by bare filename in any category.
    pub async fn upscale_file(&self, req: &UpscaleRequest) -> Result<UpscaleOutcome> {
        let settings = req.settings()?;
        self.require(req.backend)?;
        let input = self.store.resolve(&req.input_file)?;
        self.upscale_path(
            &input.path,
            &settings,
            req.backend,
            req.output_file.as_deref(),
        )
        .await
    }

    /// Re-renders a freshly generated artifact; the chained-upscale path.
    pub async fn upscale_artifact(
        &self,
        artifact: &Artifact,
        settings: &EnhanceSettings,
    ) -> Result<UpscaleOutcome> {
        self.upscale_path(&artifact.path, settings, UpscaleBackend::Rerender, None)
            .await
    }

    async fn upscale_path(
        &self,
        path: &Path,
        settings: &EnhanceSettings,
        backend: UpscaleBackend,
        output_file: Option<&str>,
    ) -> Result<UpscaleOutcome> {
        let source = decode(path.to_path_buf()).await?;
        let (image, stages) = self
            .enhance(source, settings, backend, self.config.rerender_factor)
            .await?;
        let descriptor = format!("{}_upscaled", stem(path));
        let artifact = self.save(&image, output_file, &descriptor, summary(settings, backend))?;
        info!(
            input = %path.display(),
            output = %artifact.filename,
            ?stages,
            width = image.width(),
            height = image.height(),
            "upscaled image"
        );
        Ok(UpscaleOutcome {
            artifact,
            stages,
            degraded: false,
            notice: None,
        })
    }

    /// Upscales every file in a directory whose extension is allow-listed,
    /// in file-name order. A file that fails is recorded and the rest go on.
    pub async fn upscale_directory(&self, req: &UpscaleDirectoryRequest) -> Result<BatchResult> {
        let settings = req.settings()?;
        self.require(req.backend)?;
        let extensions = req.normalized_extensions();
        let files = list_images(Path::new(&req.input_directory), &extensions)?;
        info!(directory = %req.input_directory, files = files.len(), "upscaling directory");

        let mut batch = BatchResult::default();
        for path in files {
            let label = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.upscale_path(&path, &settings, req.backend, None).await {
                Ok(outcome) => batch.push_success(label, outcome.artifact),
                Err(err) => {
                    warn!(file = %label, error = %err, "upscale failed, continuing");
                    batch.push_failure(label, &err);
                }
            }
        }
        info!(
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            "directory upscale finished"
        );
        Ok(batch)
    }

    /// Stage 1 re-renders at the high-res factor; stage 2 runs the
    /// super-resolution network when asked. A missing network degrades to
    /// stage 1 only and is reported rather than raised.
    pub async fn upscale_highres(&self, req: &HighResRequest) -> Result<UpscaleOutcome> {
        let settings = req.settings()?;
        let input = self.store.resolve(&req.input_file)?;
        let source = decode(input.path.clone()).await?;

        let (degraded, notice) = match (req.use_super_resolution, &self.super_resolution) {
            (true, None) => {
                let err = EaselError::UpscaleBackendUnavailable(
                    "no super-resolution network is configured".into(),
                );
                warn!(input = %input.filename, error = %err, "high-res upscale degraded to re-render only");
                (true, Some(format!("{err}; applied the re-render stage only")))
            }
            _ => (false, None),
        };
        let backend = if req.use_super_resolution && !degraded {
            UpscaleBackend::Chained
        } else {
            UpscaleBackend::Rerender
        };

        let (image, stages) = self
            .enhance(source, &settings, backend, self.config.highres_factor)
            .await?;

        let mut factor = self.config.highres_factor;
        if let (true, Some(network)) = (backend.needs_super_resolution(), &self.super_resolution) {
            factor *= network.scale() as f64;
        }
        let descriptor = format!(
            "{}_upscaled_highres_{}x",
            stem(&input.path),
            factor.to_string().replace('.', "_")
        );
        let artifact = self.save(
            &image,
            req.output_file.as_deref(),
            &descriptor,
            summary(&settings, backend),
        )?;
        info!(
            input = %input.filename,
            output = %artifact.filename,
            ?stages,
            degraded,
            "high-res upscale finished"
        );
        Ok(UpscaleOutcome {
            artifact,
            stages,
            degraded,
            notice,
        })
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

fn summary(settings: &EnhanceSettings, backend: UpscaleBackend) -> String {
    let backend = serde_plain::to_string(&backend).unwrap_or_default();
    format!("upscale[{backend}]: {}", settings.prompt)
}

async fn decode(path: PathBuf) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::open(&path).map_err(|e| match e {
            image::ImageError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                EaselError::FileNotFound(path.display().to_string())
            }
            other => EaselError::Validation(format!("cannot decode {}: {other}", path.display())),
        })
    })
    .await
    .map_err(|e| EaselError::InternalGeneration(format!("decode aborted: {e}")))?
}

/// Regular files in `dir` with an allow-listed extension, sorted by name.
fn list_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(EaselError::FileNotFound(dir.display().to_string()));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let allowed = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.contains(&e.to_ascii_lowercase()));
        if allowed && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
