//! # Error Taxonomy
//!
//! Every fallible operation in the engine returns [`SyncError`]. The variants
//! are the failure classes the rest of the system makes decisions on: the
//! dispatcher retries only what [`SyncError::is_retryable`] allows, and callers
//! of the reconciliation engine see storage failures as their own class.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Timeouts, connection resets and other transport-level failures.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Non-success vendor responses, business failure flags and bad payload shapes.
    #[error("vendor business failure: {0}")]
    VendorBusiness(String),

    /// Commit failures and constraint violations in durable storage.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Cache backend failures. The cache is an accelerator, so callers usually log these.
    #[error("cache failure: {0}")]
    Cache(String),

    /// Missing credentials or invalid settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input that cannot be canonicalized or serialized.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Caller-supplied values the engine refuses, such as an empty station id.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The dispatcher queue no longer accepts work.
    #[error("task queue closed")]
    QueueClosed,
}

impl SyncError {
    /// Whether a task that failed with this error should be scheduled again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientNetwork(_) => true,
            SyncError::VendorBusiness(_)
            | SyncError::Storage(_)
            | SyncError::Cache(_)
            | SyncError::Config(_)
            | SyncError::Encoding(_)
            | SyncError::InvalidInput(_)
            | SyncError::QueueClosed => false,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(value: sqlx::Error) -> Self {
        SyncError::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        SyncError::Encoding(value.to_string())
    }
}

#[cfg(feature = "redis-cache")]
impl From<redis::RedisError> for SyncError {
    fn from(value: redis::RedisError) -> Self {
        SyncError::Cache(value.to_string())
    }
}
