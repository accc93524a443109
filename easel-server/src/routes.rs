use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine as _};
use easel_core::generate::GenerationOutcome;
use easel_core::request::{
    CompareRequest, GenerationRequest, HighResRequest, SchedulerRequest, UpscaleDirectoryRequest,
    UpscaleRequest,
};
use easel_core::upscale::{Capabilities, UpscaleOutcome};
use easel_core::{Artifact, BatchItem, EaselError, Engine, HealthReport, ModelProfile};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};

type AppState = Arc<Engine>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/generate", post(generate_handler))
        .route("/generate-scheduler", post(generate_scheduler_handler))
        .route("/test-schedulers", post(test_schedulers_handler))
        .route("/upscale", post(upscale_handler))
        .route("/upscale-directory", post(upscale_directory_handler))
        .route("/upscale-highres", post(upscale_highres_handler))
        .route("/schedulers", get(schedulers_handler))
        .route("/schedulers/active", put(apply_scheduler_handler))
        .route("/files", get(files_handler))
        .route("/download/{filename}", get(download_handler))
        .route("/health", get(health_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/v1/images/generations", post(openai_generation_handler))
        .with_state(engine)
}

/// Request bodies share the engine's validation error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload.map(|Json(value)| value).map_err(ApiError::from)
}

async fn index_handler() -> Json<Value> {
    Json(json!({
        "message": "easel image generation service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "generate": "POST /generate",
            "generate-scheduler": "POST /generate-scheduler",
            "test-schedulers": "POST /test-schedulers",
            "upscale": "POST /upscale",
            "upscale-directory": "POST /upscale-directory",
            "upscale-highres": "POST /upscale-highres",
            "schedulers": "GET /schedulers",
            "apply-scheduler": "PUT /schedulers/active",
            "files": "GET /files",
            "download": "GET /download/{filename}",
            "health": "GET /health",
            "reload": "POST /admin/reload",
            "openai": "POST /v1/images/generations",
        }
    }))
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    message: String,
    /// The delivered artifact: the upscaled one when an upscale was chained.
    filename: String,
    output_path: String,
    scheduler_used: &'static str,
    seed: Option<u64>,
    /// The raw generation when an upscale was chained.
    original_filename: Option<String>,
    upscale: Option<UpscaleResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    upscale_error: Option<String>,
}

impl From<GenerationOutcome> for GenerateResponse {
    fn from(outcome: GenerationOutcome) -> Self {
        let delivered = outcome.delivered().clone();
        let upscale = outcome.upscaled.map(UpscaleResponse::from);
        Self {
            message: match (&upscale, &outcome.upscale_error) {
                (Some(_), _) => "Image generated and upscaled successfully".into(),
                (None, Some(_)) => "Image generated; the chained upscale failed".into(),
                (None, None) => format!("Image generated successfully with {}", outcome.scheduler),
            },
            filename: delivered.filename,
            output_path: delivered.path.display().to_string(),
            scheduler_used: outcome.scheduler,
            seed: outcome.seed,
            original_filename: upscale.as_ref().map(|_| outcome.artifact.filename.clone()),
            upscale,
            upscale_error: outcome.upscale_error,
        }
    }
}

async fn generate_handler(
    State(engine): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> ApiResult<Json<GenerateResponse>> {
    let req = body(payload)?;
    let outcome = engine.generate(&req).await?;
    Ok(Json(outcome.into()))
}

async fn generate_scheduler_handler(
    State(engine): State<AppState>,
    payload: Result<Json<SchedulerRequest>, JsonRejection>,
) -> ApiResult<Json<GenerateResponse>> {
    let req = body(payload)?;
    let outcome = engine.generate_with_scheduler(&req).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    message: &'static str,
    results: Vec<BatchItem>,
    total: usize,
    succeeded: usize,
    failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_schedulers: Option<Vec<&'static str>>,
}

async fn test_schedulers_handler(
    State(engine): State<AppState>,
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> ApiResult<Json<BatchResponse>> {
    let req = body(payload)?;
    let batch = engine.compare(&req).await?;
    Ok(Json(BatchResponse {
        message: "Scheduler comparison finished",
        total: batch.len(),
        succeeded: batch.succeeded(),
        failed: batch.failed(),
        results: batch.items,
        available_schedulers: Some(engine.schedulers()),
    }))
}

#[derive(Debug, Serialize)]
struct UpscaleResponse {
    message: String,
    filename: String,
    output_path: String,
    stages: Vec<easel_core::upscale::Stage>,
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
}

impl From<UpscaleOutcome> for UpscaleResponse {
    fn from(outcome: UpscaleOutcome) -> Self {
        Self {
            message: if outcome.degraded {
                "Image upscaled in degraded mode".into()
            } else {
                "Image upscaled successfully".into()
            },
            filename: outcome.artifact.filename,
            output_path: outcome.artifact.path.display().to_string(),
            stages: outcome.stages,
            degraded: outcome.degraded,
            notice: outcome.notice,
        }
    }
}

async fn upscale_handler(
    State(engine): State<AppState>,
    payload: Result<Json<UpscaleRequest>, JsonRejection>,
) -> ApiResult<Json<UpscaleResponse>> {
    let req = body(payload)?;
    Ok(Json(engine.upscale_file(&req).await?.into()))
}

async fn upscale_directory_handler(
    State(engine): State<AppState>,
    payload: Result<Json<UpscaleDirectoryRequest>, JsonRejection>,
) -> ApiResult<Json<BatchResponse>> {
    let req = body(payload)?;
    let batch = engine.upscale_directory(&req).await?;
    Ok(Json(BatchResponse {
        message: "Directory upscaling finished",
        total: batch.len(),
        succeeded: batch.succeeded(),
        failed: batch.failed(),
        results: batch.items,
        available_schedulers: None,
    }))
}

async fn upscale_highres_handler(
    State(engine): State<AppState>,
    payload: Result<Json<HighResRequest>, JsonRejection>,
) -> ApiResult<Json<UpscaleResponse>> {
    let req = body(payload)?;
    Ok(Json(engine.upscale_highres(&req).await?.into()))
}

async fn schedulers_handler(State(engine): State<AppState>) -> Json<Value> {
    let schedulers = engine.schedulers();
    Json(json!({
        "total": schedulers.len(),
        "schedulers": schedulers,
        "active": engine.active_scheduler().name,
    }))
}

#[derive(Debug, Deserialize)]
struct ApplySchedulerRequest {
    #[serde(alias = "name")]
    scheduler_name: String,
}

async fn apply_scheduler_handler(
    State(engine): State<AppState>,
    payload: Result<Json<ApplySchedulerRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let active = engine.apply_scheduler(&req.scheduler_name).await?;
    Ok(Json(json!({ "active": active.name })))
}

#[derive(Debug, Serialize)]
struct FileEntry {
    #[serde(flatten)]
    artifact: Artifact,
    download_url: String,
}

async fn files_handler(State(engine): State<AppState>) -> Json<Value> {
    let files: Vec<FileEntry> = engine
        .list_files()
        .into_iter()
        .map(|artifact| FileEntry {
            download_url: format!("/download/{}", artifact.filename),
            artifact,
        })
        .collect();
    Json(json!({ "total": files.len(), "files": files }))
}

fn content_type(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "image/png"
    }
}

async fn download_handler(
    State(engine): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let (artifact, bytes) = tokio::task::spawn_blocking(move || engine.download(&filename))
        .await
        .map_err(|e| ApiError(EaselError::Io(std::io::Error::other(e))))??;
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&artifact.filename).to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    pipeline: HealthReport,
    capabilities: Capabilities,
}

async fn health_handler(State(engine): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        pipeline: engine.health(),
        capabilities: engine.capabilities(),
    })
}

async fn reload_handler(State(engine): State<AppState>) -> ApiResult<Json<ModelProfile>> {
    Ok(Json(engine.reload().await?))
}

#[derive(Debug, Serialize)]
struct InlineImageResponse {
    image: String,
    filename: String,
}

/// Generates and returns the PNG inline as base64, keeping the stored copy.
async fn openai_generation_handler(
    State(engine): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<InlineImageResponse>)> {
    let req = body(payload)?;
    let outcome = engine.generate(&req).await?;
    let filename = outcome.delivered().filename.clone();
    let (_, bytes) = engine.download(&filename)?;
    Ok((
        StatusCode::OK,
        Json(InlineImageResponse {
            image: BASE64_STANDARD.encode(&bytes),
            filename,
        }),
    ))
}
