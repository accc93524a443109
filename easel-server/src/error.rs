use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use easel_core::EaselError;
use serde_json::json;
use tracing::{error, warn};

/// An engine error on its way out as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub EaselError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EaselError::Validation(_) => StatusCode::BAD_REQUEST,
            EaselError::SchedulerNotFound(_) | EaselError::FileNotFound(_) => StatusCode::NOT_FOUND,
            EaselError::ResourceUnavailable(_)
            | EaselError::ModelLoad { .. }
            | EaselError::Busy(_)
            | EaselError::UpscaleBackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EaselError::InternalGeneration(_) | EaselError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<EaselError> for ApiError {
    fn from(err: EaselError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(EaselError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        if status.is_server_error() {
            error!(code = self.0.code(), %message, "request failed");
        } else {
            warn!(code = self.0.code(), %message, "request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
