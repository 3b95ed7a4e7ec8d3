//! Maps `ControllerError` onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuctl_core::error::ControllerError;
use serde_json::json;

pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ControllerError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            ControllerError::BackendSpawnFailed { .. }
            | ControllerError::BackendReadinessTimeout { .. }
            | ControllerError::BackendCrashed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
            ControllerError::UpstreamUnreachable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string())
            }
            ControllerError::UpstreamError { status, body } => {
                let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                (code, body.clone())
            }
            ControllerError::Cancelled => (StatusCode::CONFLICT, self.0.to_string()),
            ControllerError::Io(_) | ControllerError::Other(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
