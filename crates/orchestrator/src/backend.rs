use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use governance::BackendKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What a backend emits while serving one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Text { text: String },
    ToolUse { name: String, arguments: Value },
    Usage { cost: f64 },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BackendError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::Unavailable(_) | BackendError::Upstream(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "timeout",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Upstream(_) => "upstream",
            BackendError::Unauthorized(_) => "unauthorized",
            BackendError::Rejected(_) => "rejected",
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// One turn as handed to a backend.
#[derive(Clone, Debug, Serialize)]
pub struct BackendRequest {
    pub session_id: String,
    pub identity: String,
    pub working_directory: PathBuf,
    pub prompt: String,
    pub has_attachment: bool,
    #[serde(skip)]
    pub preferred_backend: Option<BackendKind>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn invoke(&self, request: &BackendRequest) -> Result<EventStream, BackendError>;
}
