use governance::{
    AuditCategory, AuthError, BackendKind, DenialReason, RateLimitError, RiskLevel, SandboxError,
    StorageError,
};
use thiserror::Error;

use crate::backend::BackendError;

/// Every way a relayed request can fail.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("directory traversal: {0}")]
    DirectoryTraversal(String),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("tool {tool} denied")]
    ToolDenied {
        tool: String,
        reason: Option<DenialReason>,
    },
    #[error("backend {backend} timed out after {attempts} attempt(s)")]
    ProviderTimeout { backend: BackendKind, attempts: u32 },
    #[error("no backend succeeded after {attempts} attempt(s): {detail}")]
    ProviderFailure { attempts: u32, detail: String },
    #[error("backend {backend} rejected the request: {detail}")]
    ProviderRejected { backend: BackendKind, detail: String },
    #[error("session {0} is busy with another turn")]
    SessionConflict(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("request cancelled")]
    Cancelled { executing: bool },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RelayError {
    pub fn category(&self) -> AuditCategory {
        match self {
            RelayError::Authentication(_) | RelayError::Authorization(_) => AuditCategory::Auth,
            RelayError::DirectoryTraversal(_) => AuditCategory::Path,
            RelayError::RateLimited(_) => AuditCategory::Rate,
            RelayError::ToolDenied { .. } => AuditCategory::Tool,
            RelayError::ProviderTimeout { .. }
            | RelayError::ProviderFailure { .. }
            | RelayError::ProviderRejected { .. } => AuditCategory::Provider,
            RelayError::SessionConflict(_)
            | RelayError::SessionNotFound(_)
            | RelayError::Cancelled { .. }
            | RelayError::Storage(_)
            | RelayError::Configuration(_) => AuditCategory::Session,
        }
    }

    pub fn risk(&self) -> RiskLevel {
        match self {
            RelayError::DirectoryTraversal(_) => RiskLevel::High,
            RelayError::Authentication(_)
            | RelayError::Authorization(_)
            | RelayError::RateLimited(_)
            | RelayError::ToolDenied { .. } => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    /// Message safe to show the end user. Never includes internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            RelayError::Authentication(_) => "You are not authorized to use this service.",
            RelayError::Authorization(_) => "Access to that resource is not permitted.",
            RelayError::DirectoryTraversal(_) => "That path is outside your approved directory.",
            RelayError::RateLimited(RateLimitError::CostLimit { .. }) => {
                "Your spending limit has been reached. Please try again later."
            }
            RelayError::RateLimited(_) => "Too many requests. Please wait before trying again.",
            RelayError::ToolDenied { .. } => "The assistant attempted an action that is not allowed.",
            RelayError::ProviderTimeout { .. } => "The assistant took too long to respond.",
            RelayError::ProviderFailure { .. } | RelayError::ProviderRejected { .. } => {
                "The assistant is currently unavailable. Please try again later."
            }
            RelayError::SessionConflict(_) => "Another request is still running in this session.",
            RelayError::SessionNotFound(_) => "That session does not exist.",
            RelayError::Cancelled { .. } => "The request was cancelled.",
            RelayError::Storage(_) | RelayError::Configuration(_) => {
                "An internal error occurred. Please try again later."
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Authentication(_) => "authentication",
            RelayError::Authorization(_) => "authorization",
            RelayError::DirectoryTraversal(_) => "directory_traversal",
            RelayError::RateLimited(_) => "rate_limited",
            RelayError::ToolDenied { .. } => "tool_denied",
            RelayError::ProviderTimeout { .. } => "provider_timeout",
            RelayError::ProviderFailure { .. } => "provider_failure",
            RelayError::ProviderRejected { .. } => "provider_rejected",
            RelayError::SessionConflict(_) => "session_conflict",
            RelayError::SessionNotFound(_) => "session_not_found",
            RelayError::Cancelled { .. } => "cancelled",
            RelayError::Storage(_) => "storage",
            RelayError::Configuration(_) => "configuration",
        }
    }

    /// Whether a backend was already doing work when the request failed, in
    /// which case the admission estimate is kept as the charge.
    pub fn charges_estimate(&self) -> bool {
        match self {
            RelayError::ToolDenied { .. }
            | RelayError::ProviderTimeout { .. }
            | RelayError::ProviderRejected { .. } => true,
            RelayError::ProviderFailure { attempts, .. } => *attempts > 0,
            RelayError::Cancelled { executing } => *executing,
            _ => false,
        }
    }
}

impl From<AuthError> for RelayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Authentication { .. } => RelayError::Authentication(err.to_string()),
            AuthError::Authorization { .. } => RelayError::Authorization(err.to_string()),
            AuthError::Storage(err) => RelayError::Storage(err.to_string()),
        }
    }
}

impl From<SandboxError> for RelayError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::DirectoryTraversal(path) => RelayError::DirectoryTraversal(path),
            other => RelayError::Authorization(other.to_string()),
        }
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        RelayError::Storage(err.to_string())
    }
}

impl RelayError {
    /// A terminal backend error. Credential failures land here too: they
    /// concern the relay's key for that backend, not the caller.
    pub(crate) fn from_backend(backend: BackendKind, err: BackendError) -> Self {
        RelayError::ProviderRejected {
            backend,
            detail: err.to_string(),
        }
    }
}
