use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn, error, instrument};

use crate::{
    QueueResult, QueueError, JobError, JobId, JobMessage, JobRecord, JobStatus, LeasedJob, JobEvent,
    backend::{BoxStream, FailDisposition, QueueBackend, memory::MemoryBackend},
    backoff::BackoffPolicy,
    observability::LiveMetrics,
    types::{later_by, WorkerId, DEFAULT_QUEUE},
};

/// Configuration for a job queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name jobs are routed to
    pub name: String,
    /// Visibility timeout: how long a lease stays valid without a heartbeat
    pub lease_duration: Duration,
    /// Retry delay policy for transient failures
    pub backoff: BackoffPolicy,
    /// How often a blocked lease re-checks the store for jobs enqueued elsewhere
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE.to_string(),
            lease_duration: Duration::from_secs(300), // 5 minutes
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Durable queue of pending jobs with lease-based, at-least-once delivery.
///
/// Cheap to clone; clones share the backend, the wake-up signal and the metrics.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    job_available: Arc<Notify>,
    metrics: Arc<LiveMetrics>,
}

impl JobQueue {
    /// Create a queue over `backend` with default configuration
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_config(backend, QueueConfig::default())
    }

    /// Create a queue with custom configuration
    pub fn with_config(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            job_available: Arc::new(Notify::new()),
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// In-process queue backed by [`MemoryBackend`]
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::with_config(Arc::new(MemoryBackend::new()), config)
    }

    /// Share metrics with another collector
    pub fn with_metrics(mut self, metrics: Arc<LiveMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get backend reference
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Get live metrics
    pub fn metrics(&self) -> &Arc<LiveMetrics> {
        &self.metrics
    }

    /// Enqueue a job for `handler` with positional `args`
    pub async fn enqueue(&self, handler: impl Into<String>, args: Vec<Value>) -> QueueResult<JobId> {
        self.enqueue_message(JobMessage::new(handler, args)).await
    }

    /// Enqueue a fully specified job. The job is routed to this queue regardless of `message.queue`.
    #[instrument(skip(self, message), fields(queue = %self.config.name, handler = %message.handler))]
    pub async fn enqueue_message(&self, mut message: JobMessage) -> QueueResult<JobId> {
        if message.handler.trim().is_empty() {
            return Err(QueueError::InvalidJob("handler name must not be empty".to_string()));
        }
        message.queue = self.config.name.clone();
        let handler = message.handler.clone();

        let job_id = self.backend.enqueue(message).await?;

        self.metrics.increment_jobs_enqueued(&handler);
        self.job_available.notify_waiters();

        info!(job_id = %job_id, "Enqueued job");
        Ok(job_id)
    }

    /// Lease the earliest visible job, waiting up to `timeout` for one to appear.
    ///
    /// `Ok(None)` after the timeout leaves the store untouched.
    pub async fn lease(&self, worker: &WorkerId, timeout: Duration) -> QueueResult<Option<LeasedJob>> {
        self.lease_or_stop(worker, timeout, std::future::pending()).await
    }

    /// [`lease`](Self::lease) that also stops waiting once `stop` resolves.
    ///
    /// `stop` only interrupts the wait between probes; a backend call that may
    /// already have popped a job always runs to completion.
    pub(crate) async fn lease_or_stop<F>(
        &self,
        worker: &WorkerId,
        timeout: Duration,
        stop: F,
    ) -> QueueResult<Option<LeasedJob>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let deadline = Instant::now().checked_add(timeout);

        loop {
            // Register interest before probing so an enqueue in between is not missed
            let notified = self.job_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(leased) = self
                .backend
                .lease(&self.config.name, worker, self.config.lease_duration)
                .await?
            {
                debug!(
                    job_id = %leased.job_id(),
                    worker = %worker,
                    attempt = leased.attempt(),
                    "Leased job"
                );
                return Ok(Some(leased));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.config.poll_interval.min(deadline - now)
                }
                None => self.config.poll_interval,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = &mut stop => return Ok(None),
            }
        }
    }

    /// Mark a leased job finished
    #[instrument(skip(self, leased), fields(job_id = %leased.job_id()))]
    pub async fn acknowledge(&self, leased: &LeasedJob) -> QueueResult<()> {
        self.backend
            .acknowledge(leased.job_id(), &leased.lease_token)
            .await?;

        self.metrics.increment_jobs_finished(&leased.message().handler);
        info!("Job finished");
        Ok(())
    }

    /// Report a failed attempt. Returns the status the job ended up in:
    /// `Failed` (pending again, retry scheduled) or `DeadLettered`.
    #[instrument(skip(self, leased, job_error), fields(job_id = %leased.job_id(), attempt = leased.attempt()))]
    pub async fn fail(&self, leased: &LeasedJob, job_error: &JobError) -> QueueResult<JobStatus> {
        let disposition = self.disposition(&leased.record, job_error, Utc::now());

        let status = self
            .backend
            .fail(leased.job_id(), &leased.lease_token, job_error.to_string(), disposition)
            .await?;

        let handler = &leased.message().handler;
        match disposition {
            FailDisposition::Retry { visible_at } => {
                self.metrics.increment_jobs_retried(handler);
                warn!(retry_at = %visible_at, "Job failed, will retry: {}", job_error);
            }
            FailDisposition::DeadLetter => {
                self.metrics.increment_jobs_dead_lettered(handler);
                error!("Job failed permanently: {}", job_error);
            }
        }
        Ok(status)
    }

    /// Decide between retry and dead-letter for a failed attempt
    fn disposition(&self, record: &JobRecord, job_error: &JobError, now: DateTime<Utc>) -> FailDisposition {
        if job_error.is_retryable() && record.can_retry() {
            let delay = self.config.backoff.delay_for(record.attempts);
            FailDisposition::Retry {
                visible_at: later_by(now, delay),
            }
        } else {
            FailDisposition::DeadLetter
        }
    }

    /// Extend a live lease by `extra_time`; returns the new expiry
    pub async fn heartbeat(&self, leased: &LeasedJob, extra_time: Duration) -> QueueResult<DateTime<Utc>> {
        let lease_until = self
            .backend
            .heartbeat(leased.job_id(), &leased.lease_token, extra_time)
            .await?;
        debug!(job_id = %leased.job_id(), lease_until = %lease_until, "Extended lease");
        Ok(lease_until)
    }

    /// Cancel a job that no worker has leased yet. `false` if it is running or done.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &JobId) -> QueueResult<bool> {
        let cancelled = self.backend.cancel(job_id).await?;
        if cancelled {
            self.metrics.increment_jobs_cancelled();
            info!("Cancelled job");
        }
        Ok(cancelled)
    }

    /// Full job record
    pub async fn record(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.backend.get_record(job_id).await
    }

    /// Current job status
    pub async fn status(&self, job_id: &JobId) -> QueueResult<JobStatus> {
        Ok(self.backend.get_record(job_id).await?.status)
    }

    /// Jobs waiting in this queue, including those whose retry is not yet visible
    pub async fn pending_count(&self) -> QueueResult<usize> {
        self.backend.pending_count(&self.config.name).await
    }

    /// Jobs currently leased from this queue
    pub async fn running_count(&self) -> QueueResult<usize> {
        self.backend.running_count(&self.config.name).await
    }

    /// Dead-lettered jobs of this queue, oldest first
    pub async fn dead_letters(&self) -> QueueResult<Vec<JobRecord>> {
        self.backend.dead_letters(&self.config.name).await
    }

    /// Move a dead-lettered job back to pending with a fresh retry budget
    #[instrument(skip(self))]
    pub async fn requeue_dead(&self, job_id: &JobId) -> QueueResult<()> {
        self.backend.requeue_dead(job_id).await?;
        self.job_available.notify_waiters();
        info!("Requeued dead-lettered job");
        Ok(())
    }

    /// Take back expired leases across all queues of the backend
    pub async fn reclaim_expired(&self) -> QueueResult<usize> {
        let reclaimed = self.backend.reclaim_expired().await?;
        if reclaimed > 0 {
            self.metrics.add_leases_reclaimed(reclaimed);
            self.job_available.notify_waiters();
            info!(reclaimed, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Lifecycle events of every job in the backend
    pub fn events(&self) -> BoxStream<JobEvent> {
        self.backend.event_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> JobQueue {
        JobQueue::in_memory(QueueConfig::new("emails"))
    }

    #[tokio::test]
    async fn enqueue_routes_to_queue_name() {
        let queue = queue();
        let message = JobMessage::new("sendWelcomeEmail", vec![json!("a@b.c")]).with_queue("elsewhere");
        let job_id = queue.enqueue_message(message).await.unwrap();

        let record = queue.record(&job_id).await.unwrap();
        assert_eq!(record.message.queue, "emails");
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert_eq!(queue.metrics().jobs_enqueued(), 1);
    }

    #[tokio::test]
    async fn empty_handler_is_rejected() {
        let err = queue().enqueue("  ", vec![]).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_times_out_without_side_effects() {
        let queue = queue();
        let worker = WorkerId::from("w-1");

        let leased = queue.lease(&worker, Duration::from_secs(2)).await.unwrap();
        assert!(leased.is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert_eq!(queue.running_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocked_lease_wakes_on_enqueue() {
        let queue = queue();
        let consumer = queue.clone();

        let waiter = tokio::spawn(async move {
            consumer.lease(&WorkerId::from("w-1"), Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = queue.enqueue("noop", vec![]).await.unwrap();

        let leased = waiter.await.unwrap().unwrap().expect("woken with a job");
        assert_eq!(leased.job_id(), &job_id);
    }

    #[tokio::test]
    async fn transient_failure_schedules_backoff() {
        let config = QueueConfig::new("emails")
            .with_backoff(BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(60)));
        let queue = JobQueue::in_memory(config);
        let worker = WorkerId::from("w-1");
        let job_id = queue.enqueue("flaky", vec![]).await.unwrap();

        let leased = queue.lease(&worker, Duration::ZERO).await.unwrap().unwrap();
        let before = Utc::now();
        let status = queue.fail(&leased, &JobError::transient("timeout")).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let record = queue.record(&job_id).await.unwrap();
        assert!(record.visible_at >= before + chrono::Duration::seconds(10));
        assert_eq!(record.last_error.as_deref(), Some("Transient error: timeout"));

        // Not visible yet
        assert!(queue.lease(&worker, Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 1);
        assert_eq!(queue.metrics().jobs_retried(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let queue = queue();
        let worker = WorkerId::from("w-1");
        let job_id = queue.enqueue("broken", vec![]).await.unwrap();

        let leased = queue.lease(&worker, Duration::ZERO).await.unwrap().unwrap();
        let status = queue.fail(&leased, &JobError::permanent("bad input")).await.unwrap();
        assert_eq!(status, JobStatus::DeadLettered);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, job_id);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_dead_makes_job_leasable_again() {
        let queue = queue();
        let worker = WorkerId::from("w-1");
        let job_id = queue.enqueue("broken", vec![]).await.unwrap();
        let leased = queue.lease(&worker, Duration::ZERO).await.unwrap().unwrap();
        queue.fail(&leased, &JobError::permanent("bad input")).await.unwrap();

        queue.requeue_dead(&job_id).await.unwrap();
        assert!(queue.dead_letters().await.unwrap().is_empty());

        let leased = queue.lease(&worker, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(leased.job_id(), &job_id);
        assert_eq!(leased.attempt(), 1);
    }
}
