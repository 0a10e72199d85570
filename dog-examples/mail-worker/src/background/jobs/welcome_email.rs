use async_trait::async_trait;
use dog_mail::{MailError, Notification};
use dog_queue::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::background::MailContext;

/// Handler name producers use for welcome emails
pub const SEND_WELCOME_EMAIL: &str = "sendWelcomeEmail";

/// Sends the welcome email for a freshly registered user.
///
/// Args: `[email, name]`.
pub struct WelcomeEmailHandler;

impl WelcomeEmailHandler {
    pub fn notification(email: &str, name: &str) -> Notification {
        Notification::new(
            email,
            format!("Welcome, {}!", name),
            format!(
                "Hi {},\n\nThanks for signing up. Your account is ready to use.\n\nSee you soon!",
                name
            ),
        )
        .with_to_name(name)
    }
}

#[async_trait]
impl JobHandler<MailContext> for WelcomeEmailHandler {
    async fn handle(&self, ctx: Arc<MailContext>, job: JobInvocation) -> Result<(), JobError> {
        let email: String = job.arg(0)?;
        let name: String = job.arg(1)?;

        let notification = Self::notification(&email, &name);
        let sent = ctx.provider.send(&notification).await.map_err(|e| {
            warn!(job_id = %job.job_id, attempt = job.attempt, error = %e, "Welcome email not sent");
            mail_error_to_job_error(e)
        })?;

        info!(
            job_id = %job.job_id,
            provider = ctx.provider.name(),
            message_id = ?sent.message_id,
            "Welcome email sent"
        );
        Ok(())
    }
}

/// Retryable provider failures go back on the queue; everything else is final
pub fn mail_error_to_job_error(error: MailError) -> JobError {
    if error.is_retryable() {
        JobError::transient(error.to_string())
    } else {
        JobError::permanent(error.to_string())
    }
}
