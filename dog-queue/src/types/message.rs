use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue used when a job does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget used when a job does not set one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job message - immutable submission data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Name of the registered handler that executes this job
    pub handler: String,

    /// Positional arguments passed to the handler
    pub args: Vec<Value>,

    /// Target queue name
    pub queue: String,

    /// Number of retries after the first attempt
    pub max_retries: u32,

    /// Earliest instant the job may be leased; `None` means immediately
    pub run_at: Option<DateTime<Utc>>,
}

impl JobMessage {
    /// Create a new job message for the default queue
    pub fn new(handler: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            handler: handler.into(),
            args,
            queue: DEFAULT_QUEUE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            run_at: None,
        }
    }

    /// Set the target queue
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the maximum retry attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay visibility until the given instant
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Delay visibility by a duration from now.
    ///
    /// Delays past the end of the calendar saturate, so the job never becomes visible.
    pub fn with_delay(self, delay: std::time::Duration) -> Self {
        self.with_run_at(super::later_by(Utc::now(), delay))
    }

    /// When the job first becomes visible to workers
    pub fn visible_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.run_at {
            Some(run_at) if run_at > now => run_at,
            _ => now,
        }
    }
}
