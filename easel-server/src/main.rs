mod error;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use easel_core::config::SuperResolutionConfig;
use easel_core::{DeviceMap, Engine, EngineConfig};
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// CUDA device ordinal
    #[arg(long)]
    ordinal: Option<usize>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// JSON engine configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the artifact categories
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Skip the device probe and assume this much accelerator memory
    #[arg(long)]
    assume_memory_gb: Option<f64>,

    /// Requests allowed to wait for the pipeline at once
    #[arg(long)]
    max_queue: Option<usize>,

    /// Seconds a request waits for the pipeline before it is turned away
    #[arg(long)]
    max_wait_secs: Option<f64>,

    /// Load the pipeline on first use instead of at start-up
    #[arg(long)]
    no_preload: bool,

    /// ONNX super-resolution network
    #[arg(long)]
    super_res_model: Option<PathBuf>,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if self.cpu || self.ordinal.is_some() {
            config.device = DeviceMap::from_args(self.cpu, self.ordinal.unwrap_or(0));
        }
        if let Some(root) = &self.output_root {
            config.output_root = root.clone();
        }
        if let Some(max_waiting) = self.max_queue {
            config.queue.max_waiting = Some(max_waiting);
        }
        if let Some(secs) = self.max_wait_secs {
            config.queue.max_wait_secs = Some(secs);
        }
        if let Some(model) = &self.super_res_model {
            let scale = config.upscale.super_resolution.as_ref().map(|sr| sr.scale);
            let mut sr = SuperResolutionConfig::new(model);
            if let Some(scale) = scale {
                sr.scale = scale;
            }
            config.upscale.super_resolution = Some(sr);
        }
        config.validate()?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("easel_core=info,easel_server=info")),
        )
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;
    let engine = Arc::new(Engine::from_config(config, Api::new()?, args.assume_memory_gb)?);

    if !args.no_preload {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            match engine.preload().await {
                Ok(profile) => info!(model = %profile.model_id, tier = %profile.tier, "pipeline preloaded"),
                Err(e) => error!(code = e.code(), error = %e, "preload failed; serving as not ready"),
            }
        });
    }

    let app = routes::router(Arc::clone(&engine));
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "easel-server",
            "--cpu",
            "--output-root",
            "/tmp/easel",
            "--max-queue",
            "3",
            "--max-wait-secs",
            "12.5",
            "--super-res-model",
            "x4.onnx",
        ])
        .unwrap();
        let config = args.engine_config().unwrap();
        assert_eq!(config.device, DeviceMap::ForceCpu);
        assert_eq!(config.output_root, PathBuf::from("/tmp/easel"));
        assert_eq!(config.queue.max_waiting, Some(3));
        assert_eq!(config.queue.max_wait_secs, Some(12.5));
        let sr = config.upscale.super_resolution.unwrap();
        assert_eq!(sr.model_path, PathBuf::from("x4.onnx"));
        assert_eq!(sr.scale, 2);
    }

    #[test]
    fn config_file_is_read_before_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("easel.json");
        std::fs::write(
            &path,
            r#"{"device": {"ordinal": 1}, "default_scheduler": "UniPC", "queue": {"max_waiting": 8}}"#,
        )
        .unwrap();
        let args = Args::try_parse_from([
            "easel-server",
            "--config",
            path.to_str().unwrap(),
            "--max-queue",
            "2",
        ])
        .unwrap();
        let config = args.engine_config().unwrap();
        assert_eq!(config.device, DeviceMap::Ordinal(1));
        assert_eq!(config.default_scheduler, "UniPC");
        assert_eq!(config.queue.max_waiting, Some(2));
        assert!(!args.no_preload);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"default_scheduler": "Karras"}"#).unwrap();
        let args =
            Args::try_parse_from(["easel-server", "--config", path.to_str().unwrap()]).unwrap();
        assert!(args.engine_config().is_err());
    }
}
