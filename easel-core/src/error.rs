use thiserror::Error;

/// Failure modes surfaced to callers.
///
/// Caller errors (`Validation`, `SchedulerNotFound`, `FileNotFound`) are
/// always raised before the shared pipeline is touched. Process-level
/// conditions (`ResourceUnavailable`, `ModelLoad`) are sticky until the
/// pipeline is explicitly reloaded.
#[derive(Debug, Error)]
pub enum EaselError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("accelerator unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("failed to load pipeline '{model_id}': {reason}")]
    ModelLoad { model_id: String, reason: String },

    #[error("unknown scheduler '{0}'")]
    SchedulerNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("upscale backend unavailable: {0}")]
    UpscaleBackendUnavailable(String),

    #[error("generation failed: {0}")]
    InternalGeneration(String),

    #[error("pipeline busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EaselError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EaselError::Validation(_) => "validation_error",
            EaselError::ResourceUnavailable(_) => "resource_unavailable",
            EaselError::ModelLoad { .. } => "model_load_error",
            EaselError::SchedulerNotFound(_) => "scheduler_not_found",
            EaselError::FileNotFound(_) => "file_not_found",
            EaselError::UpscaleBackendUnavailable(_) => "upscale_backend_unavailable",
            EaselError::InternalGeneration(_) => "internal_generation_error",
            EaselError::Busy(_) => "busy",
            EaselError::Io(_) => "io_error",
        }
    }

    /// True when the request itself is at fault and retrying it unchanged is pointless.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EaselError::Validation(_)
                | EaselError::SchedulerNotFound(_)
                | EaselError::FileNotFound(_)
        )
    }

    pub(crate) fn generation(err: anyhow::Error) -> Self {
        EaselError::InternalGeneration(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, EaselError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_distinguished_from_service_errors() {
        assert!(EaselError::Validation("steps".into()).is_client_error());
        assert!(EaselError::SchedulerNotFound("x".into()).is_client_error());
        assert!(EaselError::FileNotFound("a.png".into()).is_client_error());
        assert!(!EaselError::ResourceUnavailable("no gpu".into()).is_client_error());
        assert!(!EaselError::Busy("queue full".into()).is_client_error());
        assert_eq!(
            EaselError::ModelLoad {
                model_id: "m".into(),
                reason: "oom".into()
            }
            .code(),
            "model_load_error"
        );
    }
}
