use lettre::Address;
use serde::{Deserialize, Serialize};

use crate::{MailError, MailResult};

/// MIME type of a notification body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "text/plain")]
    PlainText,
    #[serde(rename = "text/html")]
    Html,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "text/plain",
            Self::Html => "text/html",
        }
    }
}

/// A single outbound email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient address
    pub to: String,
    /// Recipient display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_name: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Notification {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            to_name: None,
            subject: subject.into(),
            body: body.into(),
            content_type: ContentType::PlainText,
            reply_to: None,
        }
    }

    pub fn with_to_name(mut self, name: impl Into<String>) -> Self {
        self.to_name = Some(name.into());
        self
    }

    pub fn html(mut self) -> Self {
        self.content_type = ContentType::Html;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Reject notifications a provider would refuse anyway
    pub fn validate(&self) -> MailResult<()> {
        if !is_valid_address(&self.to) {
            return Err(MailError::InvalidRecipient(self.to.clone()));
        }
        if let Some(reply_to) = &self.reply_to {
            if !is_valid_address(reply_to) {
                return Err(MailError::InvalidNotification(format!("invalid reply-to address: {}", reply_to)));
            }
        }
        if self.subject.trim().is_empty() {
            return Err(MailError::InvalidNotification("subject is empty".to_string()));
        }
        if self.body.trim().is_empty() {
            return Err(MailError::InvalidNotification("body is empty".to_string()));
        }
        Ok(())
    }
}

/// Whether `address` is a deliverable mailbox: RFC 5322 syntax as parsed by
/// [`lettre::Address`], with a dotted host name for the domain.
pub fn is_valid_address(address: &str) -> bool {
    match address.parse::<Address>() {
        Ok(parsed) => is_host_name(parsed.domain()),
        Err(_) => false,
    }
}

/// Two or more letter/digit/hyphen labels, none starting or ending with `-`
fn is_host_name(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_addresses() {
        for address in ["ada@example.com", "first.last+tag@mail.example.co.uk", "x@a.io"] {
            assert!(is_valid_address(address), "{}", address);
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        for address in ["", "not-an-email", "@example.com", "ada@", "ada@localhost", "a b@example.com", "a@b@example.com", "ada@.com", "ada@example-.com"] {
            assert!(!is_valid_address(address), "{}", address);
        }
    }

    #[test]
    fn rejects_addresses_outside_rfc_5322() {
        for address in [
            "a..b@example.com",
            "<ada>@example.com",
            "ada@exa!mple.com",
            ".ada@example.com",
            "ada\"x@example.com",
            "ada.@example.com",
            "Ada <ada@example.com>",
        ] {
            assert!(!is_valid_address(address), "{}", address);
        }
    }

    #[test]
    fn validate_reports_invalid_recipient() {
        let notification = Notification::new("not-an-email", "Welcome", "Hi");
        assert_eq!(
            notification.validate(),
            Err(MailError::InvalidRecipient("not-an-email".to_string()))
        );
        assert!(Notification::new("ada@example.com", " ", "Hi").validate().is_err());
        assert!(Notification::new("ada@example.com", "Welcome", "Hi").validate().is_ok());
    }

    #[test]
    fn content_type_serializes_as_mime() {
        let json = serde_json::to_value(Notification::new("a@b.io", "s", "b").html()).unwrap();
        assert_eq!(json["content_type"], "text/html");
    }
}
