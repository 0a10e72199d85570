pub mod ids;
pub mod message;
pub mod record;
pub mod events;

pub use ids::{JobId, LeaseToken, WorkerId};
pub use message::{JobMessage, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE};
pub use record::{JobRecord, JobStatus, LeasedJob};
pub use events::JobEvent;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `at + duration`, saturating at the latest representable instant
pub(crate) fn later_by(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
