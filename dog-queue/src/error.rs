use thiserror::Error;

use crate::JobId;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Backing store could not be reached; surfaced to the caller, never retried here
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Job does not exist or is not currently leased
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// Lease on the job ran out (and may already belong to another worker)
    #[error("Lease expired for job: {0}")]
    LeaseExpired(JobId),

    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("Handler already registered: {0}")]
    HandlerAlreadyRegistered(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the error means the store itself is unreachable
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::QueueUnavailable(_))
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error - dead-letter immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Argument decoding failures can never succeed on retry
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("Invalid job arguments: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::QueueUnavailable(err.to_string())
        } else {
            Self::Internal(format!("Redis error: {}", err))
        }
    }
}
