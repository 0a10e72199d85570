//! # dog-mail: Notification Dispatch
//!
//! Sends one email per call through a transactional-email provider and
//! classifies failures as retryable or permanent, leaving retries to the
//! job queue that invoked it.
//!
//! ```rust,no_run
//! use dog_mail::{EmailProvider, HttpEmailConfig, HttpEmailProvider, Notification};
//!
//! # async fn run() -> dog_mail::MailResult<()> {
//! let provider = HttpEmailProvider::new(HttpEmailConfig::from_env()?)?;
//! let notification = Notification::new("ada@example.com", "Welcome!", "Glad to have you, Ada.");
//!
//! match provider.send(&notification).await {
//!     Ok(sent) => println!("accepted as {:?}", sent.message_id),
//!     Err(e) if e.is_retryable() => println!("try again later: {}", e),
//!     Err(e) => println!("giving up: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod notification;
pub mod provider;

pub use error::{MailError, MailResult};
pub use notification::{is_valid_address, ContentType, Notification};
pub use provider::{EmailProvider, HttpEmailConfig, HttpEmailProvider, RecordingProvider, SentEmail};
