//! HTTP transactional-email provider
//!
//! Speaks the SendGrid v3 `mail/send` API; any service accepting the same
//! payload (or a local stand-in) can be targeted through `api_url`.

use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn, instrument};

use crate::{
    MailError, MailResult, Notification,
    provider::{EmailProvider, SentEmail},
};

/// Default API base URL
pub const DEFAULT_API_URL: &str = "https://api.sendgrid.com/v3";

/// Longest error body kept in [`MailError::Http`]
const MAX_ERROR_BODY: usize = 512;

/// Settings for [`HttpEmailProvider`]
#[derive(Debug, Clone)]
pub struct HttpEmailConfig {
    /// API base URL; requests go to `{api_url}/mail/send`
    pub api_url: String,
    /// Bearer credential
    pub api_key: String,
    pub from_email: String,
    pub from_name: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpEmailConfig {
    pub fn new(api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: api_key.into(),
            from_email: from_email.into(),
            from_name: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_from_name(mut self, from_name: impl Into<String>) -> Self {
        self.from_name = Some(from_name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create from environment variables
    ///
    /// Expects:
    /// - `MAIL_API_KEY`
    /// - `MAIL_FROM_EMAIL`
    /// - `MAIL_FROM_NAME` (optional)
    /// - `MAIL_API_URL` (optional, defaults to SendGrid)
    /// - `MAIL_TIMEOUT_SECS` (optional, defaults to 10)
    pub fn from_env() -> MailResult<Self> {
        let api_key = std::env::var("MAIL_API_KEY")
            .map_err(|_| MailError::Config("MAIL_API_KEY not set".to_string()))?;
        let from_email = std::env::var("MAIL_FROM_EMAIL")
            .map_err(|_| MailError::Config("MAIL_FROM_EMAIL not set".to_string()))?;

        let mut config = Self::new(api_key, from_email);
        if let Ok(api_url) = std::env::var("MAIL_API_URL") {
            config.api_url = api_url;
        }
        if let Ok(from_name) = std::env::var("MAIL_FROM_NAME") {
            config.from_name = Some(from_name);
        }
        if let Ok(raw) = std::env::var("MAIL_TIMEOUT_SECS") {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| MailError::Config(format!("invalid MAIL_TIMEOUT_SECS: {:?}", raw)))?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Email provider backed by an HTTP API
pub struct HttpEmailProvider {
    config: HttpEmailConfig,
    endpoint: String,
    client: Client,
}

impl HttpEmailProvider {
    pub fn new(config: HttpEmailConfig) -> MailResult<Self> {
        if config.api_key.trim().is_empty() {
            return Err(MailError::Config("API key is empty".to_string()));
        }
        if !crate::is_valid_address(&config.from_email) {
            return Err(MailError::Config(format!("invalid sender address: {}", config.from_email)));
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let endpoint = format!("{}/mail/send", config.api_url.trim_end_matches('/'));

        Ok(Self {
            config,
            endpoint,
            client,
        })
    }

    pub fn config(&self) -> &HttpEmailConfig {
        &self.config
    }

    fn request_body<'a>(&'a self, notification: &'a Notification) -> SendRequest<'a> {
        SendRequest {
            personalizations: vec![Personalization {
                to: vec![EmailAddress {
                    email: &notification.to,
                    name: notification.to_name.as_deref(),
                }],
            }],
            from: EmailAddress {
                email: &self.config.from_email,
                name: self.config.from_name.as_deref(),
            },
            reply_to: notification.reply_to.as_deref().map(|email| EmailAddress { email, name: None }),
            subject: &notification.subject,
            content: vec![Content {
                content_type: notification.content_type.as_str(),
                value: &notification.body,
            }],
        }
    }
}

/// API request payload
#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: EmailAddress<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<EmailAddress<'a>>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<EmailAddress<'a>>,
}

#[derive(Debug, Serialize)]
struct EmailAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'a str,
    value: &'a str,
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    #[instrument(skip(self, notification), fields(provider = "http", to = %notification.to))]
    async fn send(&self, notification: &Notification) -> MailResult<SentEmail> {
        notification.validate()?;

        debug!(subject = %notification.subject, "Sending email");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(notification))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            debug!(message_id = ?message_id, "Email accepted");
            return Ok(SentEmail { message_id });
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            body.truncate(cut);
        }
        warn!(status = %status, error = %body, "Email provider rejected request");

        Err(MailError::Http {
            status: status.as_u16(),
            body,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
