use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobMessage, LeaseToken, WorkerId};

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is pending and waiting to be leased
    Queued,

    /// Job is leased by a worker
    Running,

    /// Job completed successfully
    Finished,

    /// Last attempt failed; the job is pending again until its retry becomes visible
    Failed,

    /// Retry budget exhausted or permanent failure; parked for manual inspection
    DeadLettered,

    /// Removed from the pending set before any worker leased it
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::DeadLettered | Self::Cancelled)
    }

    /// Check if the job sits in the pending set
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Failed)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Job record - mutable runtime state stored by backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier
    pub job_id: JobId,

    /// Enqueue order within the store, breaks ties between equal `visible_at`
    pub seq: u64,

    /// Immutable job message data
    pub message: JobMessage,

    /// Current job status
    pub status: JobStatus,

    /// Number of times the job has been leased
    pub attempts: u32,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the job was last updated
    pub updated_at: DateTime<Utc>,

    /// When the job becomes (or became) eligible for leasing
    pub visible_at: DateTime<Utc>,

    /// Last error message (if any)
    pub last_error: Option<String>,

    /// Current lease token (if running)
    pub lease_token: Option<LeaseToken>,

    /// When the current lease expires (if running)
    pub lease_until: Option<DateTime<Utc>>,

    /// Worker holding the current lease
    pub leased_by: Option<WorkerId>,
}

impl JobRecord {
    /// Create a new queued job record
    pub fn new(job_id: JobId, seq: u64, message: JobMessage, now: DateTime<Utc>) -> Self {
        let visible_at = message.visible_at(now);

        Self {
            job_id,
            seq,
            message,
            status: JobStatus::Queued,
            attempts: 0,
            created_at: now,
            updated_at: now,
            visible_at,
            last_error: None,
            lease_token: None,
            lease_until: None,
            leased_by: None,
        }
    }

    /// Whether one more transient failure may still be retried
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.message.max_retries
    }

    /// Check if the lease has expired
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.lease_until) {
            (JobStatus::Running, Some(lease_until)) => lease_until < now,
            _ => false,
        }
    }

    /// Whether `token` is the live lease on this job
    pub fn holds_lease(&self, token: &LeaseToken) -> bool {
        self.status == JobStatus::Running && self.lease_token.as_ref() == Some(token)
    }

    /// Start processing with a lease
    pub fn start_processing(
        &mut self,
        worker: WorkerId,
        lease_token: LeaseToken,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.lease_token = Some(lease_token);
        self.lease_until = Some(lease_until);
        self.leased_by = Some(worker);
        self.updated_at = now;
    }

    /// Complete the job successfully
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Finished;
        self.clear_lease();
        self.updated_at = now;
    }

    /// Put the job back in the pending set with a delayed visibility
    pub fn schedule_retry(&mut self, error: String, visible_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.visible_at = visible_at;
        self.last_error = Some(error);
        self.clear_lease();
        self.updated_at = now;
    }

    /// Park the job in the dead-letter list
    pub fn dead_letter(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::DeadLettered;
        self.last_error = Some(error);
        self.clear_lease();
        self.updated_at = now;
    }

    /// Cancel the job
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.clear_lease();
        self.updated_at = now;
    }

    /// Bring a dead-lettered job back with a fresh retry budget
    pub fn redrive(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.attempts = 0;
        self.visible_at = now;
        self.clear_lease();
        self.updated_at = now;
    }

    fn clear_lease(&mut self) {
        self.lease_token = None;
        self.lease_until = None;
        self.leased_by = None;
    }
}

/// A job that has been leased for processing
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The job record as of lease time
    pub record: JobRecord,

    /// Lease token for acknowledgment
    pub lease_token: LeaseToken,

    /// When the lease expires
    pub lease_until: DateTime<Utc>,
}

impl LeasedJob {
    /// Create a new leased job
    pub fn new(record: JobRecord, lease_token: LeaseToken, lease_until: DateTime<Utc>) -> Self {
        Self {
            record,
            lease_token,
            lease_until,
        }
    }

    /// Get the job ID
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    /// Get the job message
    pub fn message(&self) -> &JobMessage {
        &self.record.message
    }

    /// Attempt number of this lease, starting at 1
    pub fn attempt(&self) -> u32 {
        self.record.attempts
    }

    /// Check if the lease is still valid
    pub fn lease_valid(&self, now: DateTime<Utc>) -> bool {
        self.lease_until > now
    }
}
