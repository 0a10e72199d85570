//! Provider that keeps sent notifications in memory, for tests and local runs

use std::collections::VecDeque;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    MailError, MailResult, Notification,
    provider::{EmailProvider, SentEmail},
};

/// Records every accepted notification instead of delivering it.
///
/// Failures can be queued up front; each queued error is returned by one `send` call.
#[derive(Clone, Default)]
pub struct RecordingProvider {
    sent: Arc<Mutex<Vec<Notification>>>,
    failures: Arc<Mutex<VecDeque<MailError>>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `send` fail with `error`
    pub async fn fail_next(&self, error: MailError) {
        self.failures.lock().await.push_back(error);
    }

    /// Notifications accepted so far
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl EmailProvider for RecordingProvider {
    async fn send(&self, notification: &Notification) -> MailResult<SentEmail> {
        notification.validate()?;

        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut sent = self.sent.lock().await;
        sent.push(notification.clone());
        info!(to = %notification.to, subject = %notification.subject, "Recorded email");

        Ok(SentEmail {
            message_id: Some(format!("recorded-{}", sent.len())),
        })
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
