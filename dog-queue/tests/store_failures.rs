//! Worker pool behavior when the job store misbehaves
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tracing_test::traced_test;

use dog_queue::prelude::*;
use dog_queue::{
    BoxStream, FailDisposition, JobEvent, JobMessage, JobRecord, LeaseToken, LeasedJob, MemoryBackend,
    QueueBackend, WorkerId,
};

/// In-memory store that can be switched offline, or made to hold a popped
/// job for a while before handing it back
#[derive(Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    offline: AtomicBool,
    lease_delay: Option<Duration>,
}

impl FlakyBackend {
    fn offline() -> Self {
        let backend = Self::default();
        backend.set_offline(true);
        backend
    }

    fn with_lease_delay(delay: Duration) -> Self {
        Self {
            lease_delay: Some(delay),
            ..Self::default()
        }
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> QueueResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::QueueUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FlakyBackend {
    async fn enqueue(&self, message: JobMessage) -> QueueResult<JobId> {
        self.check()?;
        self.inner.enqueue(message).await
    }

    async fn lease(
        &self,
        queue: &str,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>> {
        self.check()?;
        let leased = self.inner.lease(queue, worker, lease_duration).await?;
        if let (Some(_), Some(delay)) = (&leased, self.lease_delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(leased)
    }

    async fn acknowledge(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        self.check()?;
        self.inner.acknowledge(job_id, lease_token).await
    }

    async fn fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        disposition: FailDisposition,
    ) -> QueueResult<JobStatus> {
        self.check()?;
        self.inner.fail(job_id, lease_token, error, disposition).await
    }

    async fn heartbeat(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        extra_time: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        self.check()?;
        self.inner.heartbeat(job_id, lease_token, extra_time).await
    }

    async fn cancel(&self, job_id: &JobId) -> QueueResult<bool> {
        self.check()?;
        self.inner.cancel(job_id).await
    }

    async fn get_record(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.check()?;
        self.inner.get_record(job_id).await
    }

    async fn pending_count(&self, queue: &str) -> QueueResult<usize> {
        self.check()?;
        self.inner.pending_count(queue).await
    }

    async fn running_count(&self, queue: &str) -> QueueResult<usize> {
        self.check()?;
        self.inner.running_count(queue).await
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<JobRecord>> {
        self.check()?;
        self.inner.dead_letters(queue).await
    }

    async fn requeue_dead(&self, job_id: &JobId) -> QueueResult<()> {
        self.check()?;
        self.inner.requeue_dead(job_id).await
    }

    async fn reclaim_expired(&self) -> QueueResult<usize> {
        self.check()?;
        self.inner.reclaim_expired().await
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        self.inner.event_stream()
    }
}

fn counting_registry() -> HandlerRegistry<AtomicU32> {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("count", |calls: Arc<AtomicU32>, _job: JobInvocation| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), JobError>(())
        })
        .unwrap();
    registry
}

fn fast_workers(concurrency: usize) -> WorkerConfig {
    WorkerConfig::new("flaky")
        .with_concurrency(concurrency)
        .with_lease_wait(Duration::from_millis(50))
        .with_error_backoff(Duration::from_millis(10))
        .without_reaper()
}

async fn wait_for_status(queue: &JobQueue, job_id: &JobId, expected: JobStatus) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if queue.status(job_id).await.ok() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "job {} never reached {}", job_id, expected);
}

#[tokio::test]
async fn test_enqueue_surfaces_unavailable_store() {
    let backend = Arc::new(FlakyBackend::offline());
    let queue = JobQueue::with_config(backend.clone(), QueueConfig::new("emails"));

    let result = queue.enqueue("count", vec![]).await;
    assert!(matches!(result, Err(QueueError::QueueUnavailable(_))), "{:?}", result);
    assert!(result.unwrap_err().is_unavailable());
    assert_eq!(queue.metrics().jobs_enqueued(), 0);

    backend.set_offline(false);
    queue.enqueue("count", vec![]).await.unwrap();
    assert_eq!(queue.pending_count().await.unwrap(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_pool_survives_store_outage() {
    let backend = Arc::new(FlakyBackend::offline());
    let queue = JobQueue::with_config(backend.clone(), QueueConfig::new("emails"));
    let calls = Arc::new(AtomicU32::new(0));

    let pool = WorkerPool::start(queue.clone(), counting_registry(), calls.clone(), fast_workers(2));

    // Several failed lease rounds while the store is down
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(logs_contain("Error leasing job"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    backend.set_offline(false);
    let job_id = queue.enqueue("count", vec![]).await.unwrap();
    wait_for_status(&queue, &job_id, JobStatus::Finished).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_during_lease_keeps_popped_job() {
    let backend = Arc::new(FlakyBackend::with_lease_delay(Duration::from_millis(200)));
    let queue = JobQueue::with_config(backend, QueueConfig::new("emails"));
    let calls = Arc::new(AtomicU32::new(0));

    let pool = WorkerPool::start(queue.clone(), counting_registry(), calls.clone(), fast_workers(1));
    let job_id = queue.enqueue("count", vec![]).await.unwrap();

    // The worker has popped the job but its lease call has not returned yet
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.status(&job_id).await.unwrap(), JobStatus::Running);
    pool.shutdown().await.unwrap();

    assert_eq!(queue.status(&job_id).await.unwrap(), JobStatus::Finished);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.running_count().await.unwrap(), 0);
}
