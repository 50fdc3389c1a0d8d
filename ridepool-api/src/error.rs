use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use ridepool_core::CoreError;

/// Seconds a client should wait before retrying a busy pool.
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug)]
pub struct AppError(pub CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::Conflict(_) | CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::LockTimeout(_) | CoreError::LeaseLost(_) | CoreError::FastStore(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::HoldExpired(_) => StatusCode::GONE,
            CoreError::NotFound(_) | CoreError::HoldNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::ValidationError(_) => StatusCode::BAD_REQUEST,
            CoreError::Durable(_) | CoreError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal Server Error: {}", self.0);
            "Internal Server Error".to_string()
        } else {
            self.0.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": self.0.code(),
        }));

        if self.0.is_retryable() {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
