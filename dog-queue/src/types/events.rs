use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Minimal stable event protocol for structured observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job was enqueued
    Enqueued {
        job_id: JobId,
        queue: String,
        handler: String,
        at: DateTime<Utc>,
    },

    /// Job was leased by a worker
    Leased {
        job_id: JobId,
        worker: WorkerId,
        attempt: u32,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Attempt failed, job will become visible again at `retry_at`
    Retrying {
        job_id: JobId,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Finished {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Job moved to the dead-letter list
    DeadLettered {
        job_id: JobId,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job was cancelled before being leased
    Cancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// An expired lease was taken back by the reaper
    Reclaimed {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Leased { .. } => "leased",
            Self::Retrying { .. } => "retrying",
            Self::Finished { .. } => "finished",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Cancelled { .. } => "cancelled",
            Self::Reclaimed { .. } => "reclaimed",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Leased { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Finished { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::Reclaimed { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Leased { at, .. }
            | Self::Retrying { at, .. }
            | Self::Finished { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Reclaimed { at, .. } => at,
        }
    }
}
