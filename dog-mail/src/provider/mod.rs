//! Email provider implementations

pub mod http;
pub mod recording;

pub use http::{HttpEmailConfig, HttpEmailProvider};
pub use recording::RecordingProvider;

use async_trait::async_trait;

use crate::{MailResult, Notification};

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    /// Provider-assigned message id, when the provider returns one
    pub message_id: Option<String>,
}

/// Trait for email providers.
///
/// One call is one delivery attempt; retrying is the caller's business.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send a notification
    async fn send(&self, notification: &Notification) -> MailResult<SentEmail>;

    /// Get provider name
    fn name(&self) -> &'static str;
}
