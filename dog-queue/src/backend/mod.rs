pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    QueueResult, JobId, JobMessage, JobStatus, JobRecord, LeasedJob, JobEvent,
    types::{LeaseToken, WorkerId},
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// What the store should do with a job whose attempt failed.
///
/// Decided by [`crate::JobQueue`] (backoff policy lives there), applied atomically by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Return the job to the pending set, invisible until `visible_at`
    Retry { visible_at: DateTime<Utc> },
    /// Park the job in the dead-letter list
    DeadLetter,
}

/// Backend trait for queue storage primitives.
///
/// Every method is a single atomic operation against the store; workers share
/// nothing in-process except a handle to the backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a job to its queue and payload store
    async fn enqueue(&self, message: JobMessage) -> QueueResult<JobId>;

    /// Atomically pop the earliest visible job of `queue` and mark it running.
    /// Never blocks; `None` when nothing is visible.
    async fn lease(
        &self,
        queue: &str,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>>;

    /// Mark a leased job finished
    async fn acknowledge(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()>;

    /// Report a failed attempt; returns the status the job ended up in
    async fn fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        disposition: FailDisposition,
    ) -> QueueResult<JobStatus>;

    /// Extend a live lease; returns the new expiry
    async fn heartbeat(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        extra_time: Duration,
    ) -> QueueResult<DateTime<Utc>>;

    /// Remove a job from the pending set. `false` once it has been leased or finished.
    async fn cancel(&self, job_id: &JobId) -> QueueResult<bool>;

    /// Full job record
    async fn get_record(&self, job_id: &JobId) -> QueueResult<JobRecord>;

    /// Number of pending (queued or awaiting retry) jobs in `queue`
    async fn pending_count(&self, queue: &str) -> QueueResult<usize>;

    /// Number of jobs currently leased from `queue`
    async fn running_count(&self, queue: &str) -> QueueResult<usize>;

    /// Dead-lettered jobs of `queue`, oldest first
    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<JobRecord>>;

    /// Move a dead-lettered job back to pending with a fresh retry budget
    async fn requeue_dead(&self, job_id: &JobId) -> QueueResult<()>;

    /// Return jobs with expired leases to pending (or dead-letter them when
    /// their budget is spent). Returns how many leases were reclaimed.
    async fn reclaim_expired(&self) -> QueueResult<usize>;

    /// Event stream for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<JobEvent>;
}
