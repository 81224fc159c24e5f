use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::RelayError;
use serde::Serialize;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    error: String,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: status.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.error,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Authentication(_) => StatusCode::UNAUTHORIZED,
        RelayError::Authorization(_)
        | RelayError::DirectoryTraversal(_)
        | RelayError::ToolDenied { .. } => StatusCode::FORBIDDEN,
        RelayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        RelayError::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RelayError::ProviderFailure { .. } | RelayError::ProviderRejected { .. } => {
            StatusCode::BAD_GATEWAY
        }
        RelayError::SessionConflict(_) => StatusCode::CONFLICT,
        RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
        RelayError::Storage(_) | RelayError::Configuration(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Detail stays in the logs and the audit trail; the caller only sees the
/// user-facing message.
impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        Self {
            status: status_for(&err),
            error: err.kind().to_string(),
            message: err.user_message().to_string(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<governance::StorageError> for AppError {
    fn from(err: governance::StorageError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}
