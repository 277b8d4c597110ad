//! Error types for the generation orchestration core.

use crate::types::{ArtifactRef, TaskId};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Request shape errors, raised before a task is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Too many reference images: {count} (maximum {max})")]
    TooManyReferences { count: usize, max: usize },

    #[error("A prompt is required when no primary image is given")]
    MissingPrompt,

    #[error("Image {0} is referenced more than once")]
    DuplicateReference(ArtifactRef),

    #[error("Prompt is too long: {len} characters (maximum {max})")]
    PromptTooLong { len: usize, max: usize },
}

/// Normalized provider failures.
///
/// This is the only place retry eligibility is decided.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Rejected by content policy: {0}")]
    ContentPolicyRejected(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    /// Delay suggested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::AuthFailure(_) => "auth_failure",
            ProviderError::Transient(_) => "transient",
            ProviderError::ContentPolicyRejected(_) => "content_policy_rejected",
        }
    }
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(ArtifactRef),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ArtifactRef,
        actual: ArtifactRef,
    },

    #[error("History entry already recorded for task {0}")]
    AlreadyRecorded(TaskId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(e) => StorageError::Io(e),
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Why a task ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Provider(ProviderError),
    Storage(String),
    Cancelled,
    Timeout,
    Shutdown,
}

impl FailureReason {
    /// Cancellation is user-initiated and not counted as a failure in stats.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FailureReason::Cancelled)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Provider(err) => write!(f, "{}", err),
            FailureReason::Storage(msg) => write!(f, "Storage error: {}", msg),
            FailureReason::Cancelled => f.write_str("Cancelled"),
            FailureReason::Timeout => f.write_str("Timed out waiting for the provider"),
            FailureReason::Shutdown => f.write_str("Interrupted by shutdown"),
        }
    }
}

/// Errors surfaced by the orchestrator façade and configuration layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Task {0} failed: {1}")]
    TaskFailed(TaskId, String),

    #[error("Timed out waiting for task {0}")]
    WaitTimeout(TaskId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::Config(err.to_string())
    }
}
