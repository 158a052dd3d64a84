//! Core error to HTTP response mapping, in one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::common::CoreError;

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            CoreError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Duplicate { .. } => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::StaleTransition { .. } => StatusCode::CONFLICT,
            CoreError::Cancelled => StatusCode::CONFLICT,
            CoreError::WorkerLost { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.kind().as_str(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
