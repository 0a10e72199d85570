use thiserror::Error;

/// Result type for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Errors raised while dispatching a notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    /// Recipient address rejected locally, before any request was made
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Notification is missing required content
    #[error("Invalid notification: {0}")]
    InvalidNotification(String),

    /// Provider could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// Provider did not answer in time
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Provider answered with a non-success status
    #[error("Provider returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Provider misconfigured (missing credential, bad URL)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MailError {
    /// Whether sending the same notification again might succeed.
    ///
    /// Network failures, timeouts, 408, 429 and 5xx are retryable; every other
    /// 4xx and any locally rejected notification is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::InvalidRecipient(_) | Self::InvalidNotification(_) | Self::Config(_) => false,
        }
    }

    /// HTTP status reported by the provider, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_builder() {
            Self::Config(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
