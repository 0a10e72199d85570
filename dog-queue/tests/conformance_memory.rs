use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::json;
use tokio_stream::StreamExt;

use dog_queue::{
    BackoffPolicy, BoxStream, JobError, JobEvent, JobId, JobQueue, JobStatus, LeaseToken,
    MemoryBackend, QueueConfig, QueueError, WorkerId,
};

/// Test factory functions
fn create_test_queue() -> (JobQueue, MemoryBackend) {
    create_queue_with(QueueConfig::new("default"))
}

fn create_queue_with(config: QueueConfig) -> (JobQueue, MemoryBackend) {
    let backend = MemoryBackend::new();
    let queue = JobQueue::with_config(Arc::new(backend.clone()), config);
    (queue, backend)
}

/// Retries become visible immediately so a test can walk the whole budget
fn no_backoff() -> QueueConfig {
    QueueConfig::new("default").with_backoff(BackoffPolicy::new(Duration::ZERO, Duration::ZERO))
}

fn worker(name: &str) -> WorkerId {
    WorkerId::from(name)
}

async fn receive_next_event(stream: &mut BoxStream<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended")
}

/// A1. Lease Is Exclusive
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_leased_by_exactly_one_worker() {
    let (queue, _) = create_test_queue();

    // Arrange: 50 jobs
    let mut enqueued = HashSet::new();
    for i in 0..50 {
        enqueued.insert(queue.enqueue("count", vec![json!(i)]).await.unwrap());
    }

    // Act: 8 workers drain the queue concurrently
    let mut tasks = Vec::new();
    for w in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let id = WorkerId::new("drain", w);
            let mut leased_ids = Vec::new();
            while let Some(leased) = queue.lease(&id, Duration::ZERO).await.unwrap() {
                leased_ids.push(leased.job_id().clone());
                queue.acknowledge(&leased).await.unwrap();
            }
            leased_ids
        }));
    }
    let mut all: Vec<JobId> = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    // Assert: no job lost, none leased twice
    let unique: HashSet<JobId> = all.iter().cloned().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique, enqueued);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert_eq!(queue.running_count().await.unwrap(), 0);
}

/// A2. Lease Marks Job Running
#[tokio::test]
async fn test_lease_marks_job_running() {
    let (queue, _) = create_test_queue();
    let job_id = queue.enqueue("sendWelcomeEmail", vec![json!("a@b.c"), json!("Ada")]).await.unwrap();

    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();

    assert_eq!(leased.job_id(), &job_id);
    assert_eq!(leased.attempt(), 1);
    assert!(leased.lease_until > Utc::now());

    let record = queue.record(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert_eq!(record.lease_token, Some(leased.lease_token.clone()));
    assert_eq!(record.leased_by, Some(worker("w-1")));
    assert_eq!(queue.pending_count().await.unwrap(), 0);
}

/// A3. Only Lease Holder Can Ack
#[tokio::test]
async fn test_only_lease_holder_can_ack() {
    let (queue, _) = create_test_queue();
    queue.enqueue("noop", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();

    let mut forged = leased.clone();
    forged.lease_token = LeaseToken::from("invalid_token");
    let result = queue.acknowledge(&forged).await;
    assert!(matches!(result, Err(QueueError::LeaseExpired(_))));

    // The real holder is unaffected
    queue.acknowledge(&leased).await.unwrap();
}

/// A4. Lease Expiry Race → LeaseExpired
#[tokio::test]
async fn test_ack_after_lease_expiry_is_rejected() {
    let (queue, backend) = create_test_queue();
    queue.enqueue("noop", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();

    backend.force_lease_expiry(leased.job_id());

    let result = queue.acknowledge(&leased).await;
    assert!(matches!(result, Err(QueueError::LeaseExpired(_))));
}

/// A5. Re-Acknowledge Is UnknownJob
#[tokio::test]
async fn test_reacknowledge_is_unknown_job() {
    let (queue, _) = create_test_queue();
    let job_id = queue.enqueue("noop", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();

    queue.acknowledge(&leased).await.unwrap();
    let second = queue.acknowledge(&leased).await;

    assert!(matches!(second, Err(QueueError::UnknownJob(id)) if id == job_id));
    assert_eq!(queue.status(&job_id).await.unwrap(), JobStatus::Finished);
}

/// A6. Unknown Job Ids Are Reported, Not Panicked On
#[tokio::test]
async fn test_unknown_job_id() {
    let (queue, _) = create_test_queue();
    let missing = JobId::from("missing");

    assert!(matches!(queue.status(&missing).await, Err(QueueError::UnknownJob(_))));
    assert!(matches!(queue.cancel(&missing).await, Err(QueueError::UnknownJob(_))));
    assert!(matches!(queue.requeue_dead(&missing).await, Err(QueueError::UnknownJob(_))));
}

/// B1. max_retries + 1 Transient Failures → Dead Letter
#[tokio::test]
async fn test_retry_budget_exhaustion_dead_letters() {
    let (queue, _) = create_queue_with(no_backoff());
    let job_id = queue.enqueue("flaky", vec![]).await.unwrap();
    let error = JobError::transient("connection reset");

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
        statuses.push(queue.fail(&leased, &error).await.unwrap());
    }

    assert_eq!(
        statuses,
        vec![JobStatus::Failed, JobStatus::Failed, JobStatus::Failed, JobStatus::DeadLettered]
    );
    assert!(queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().is_none());

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, job_id);
    assert_eq!(dead[0].attempts, 4);
    assert_eq!(dead[0].last_error.as_deref(), Some("Transient error: connection reset"));
}

/// B2. Zero Retry Budget Allows Exactly One Attempt
#[tokio::test]
async fn test_zero_max_retries() {
    let (queue, _) = create_queue_with(no_backoff());
    let message = dog_queue::JobMessage::new("once", vec![]).with_max_retries(0);
    queue.enqueue_message(message).await.unwrap();

    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    let status = queue.fail(&leased, &JobError::transient("nope")).await.unwrap();
    assert_eq!(status, JobStatus::DeadLettered);
}

/// B3. Failed Retry Waits For Its Backoff
#[tokio::test]
async fn test_retry_respects_backoff() {
    let config = QueueConfig::new("default")
        .with_backoff(BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(10)));
    let (queue, _) = create_queue_with(config);
    let job_id = queue.enqueue("flaky", vec![]).await.unwrap();

    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    queue.fail(&leased, &JobError::transient("busy")).await.unwrap();

    // Not visible before the backoff elapses
    assert!(queue.lease(&worker("w-1"), Duration::from_millis(50)).await.unwrap().is_none());

    // A blocking lease picks it up once visible
    let retried = queue.lease(&worker("w-1"), Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(retried.job_id(), &job_id);
    assert_eq!(retried.attempt(), 2);
}

/// C1. Ordering Follows Visibility Then Enqueue Order
#[tokio::test]
async fn test_fifo_with_delayed_job() {
    let (queue, _) = create_test_queue();
    let delayed = dog_queue::JobMessage::new("later", vec![]).with_delay(Duration::from_secs(60));
    let delayed_id = queue.enqueue_message(delayed).await.unwrap();
    let first = queue.enqueue("first", vec![]).await.unwrap();
    let second = queue.enqueue("second", vec![]).await.unwrap();

    let a = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    let b = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    let none = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap();

    assert_eq!(a.job_id(), &first);
    assert_eq!(b.job_id(), &second);
    assert!(none.is_none());
    assert_eq!(queue.status(&delayed_id).await.unwrap(), JobStatus::Queued);
}

/// D1. Crashed Worker → Another Worker Completes The Job
#[tokio::test]
async fn test_expired_lease_becomes_eligible_again() {
    let config = QueueConfig::new("default").with_lease_duration(Duration::from_millis(50));
    let (queue, _) = create_queue_with(config);
    let job_id = queue.enqueue("sendWelcomeEmail", vec![json!("a@b.c"), json!("Ada")]).await.unwrap();

    // Arrange: worker A leases and goes silent
    let first_lease = queue.lease(&worker("crashed"), Duration::ZERO).await.unwrap().unwrap();

    // Still leased: nobody else can take it
    assert!(queue.lease(&worker("healthy"), Duration::ZERO).await.unwrap().is_none());

    // Act: visibility timeout passes, reaper runs
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(queue.reclaim_expired().await.unwrap(), 1);

    // Assert: worker B leases and completes it
    let second_lease = queue.lease(&worker("healthy"), Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second_lease.job_id(), &job_id);
    assert_eq!(second_lease.attempt(), 2);
    assert_ne!(second_lease.lease_token, first_lease.lease_token);
    queue.acknowledge(&second_lease).await.unwrap();

    // The crashed worker's late report is rejected
    assert!(queue.acknowledge(&first_lease).await.is_err());
    assert_eq!(queue.status(&job_id).await.unwrap(), JobStatus::Finished);
}

/// D2. Heartbeat Keeps A Long Job Leased
#[tokio::test]
async fn test_heartbeat_extends_lease() {
    let config = QueueConfig::new("default").with_lease_duration(Duration::from_millis(100));
    let (queue, _) = create_queue_with(config);
    queue.enqueue("slow", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();

    let extended = queue.heartbeat(&leased, Duration::from_secs(60)).await.unwrap();
    assert!(extended > leased.lease_until);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(queue.reclaim_expired().await.unwrap(), 0);
    queue.acknowledge(&leased).await.unwrap();
}

/// E1. Cancel Only Before Lease
#[tokio::test]
async fn test_cancel_only_before_lease() {
    let (queue, _) = create_test_queue();
    let pending = queue.enqueue("noop", vec![]).await.unwrap();
    assert!(queue.cancel(&pending).await.unwrap());
    assert_eq!(queue.status(&pending).await.unwrap(), JobStatus::Cancelled);
    assert!(queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().is_none());

    let running = queue.enqueue("noop", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    assert!(!queue.cancel(&running).await.unwrap());
    queue.acknowledge(&leased).await.unwrap();
    assert!(!queue.cancel(&running).await.unwrap());
}

/// F1. Lifecycle Events Are Published In Order
#[tokio::test]
async fn test_lifecycle_events() {
    let (queue, _) = create_test_queue();
    let mut events = queue.events();

    let job_id = queue.enqueue("noop", vec![]).await.unwrap();
    let leased = queue.lease(&worker("w-1"), Duration::ZERO).await.unwrap().unwrap();
    queue.acknowledge(&leased).await.unwrap();

    let names: Vec<&str> = vec![
        receive_next_event(&mut events).await,
        receive_next_event(&mut events).await,
        receive_next_event(&mut events).await,
    ]
    .iter()
    .map(|event| {
        assert_eq!(event.job_id(), &job_id);
        event.event_name()
    })
    .collect();
    assert_eq!(names, vec!["enqueued", "leased", "finished"]);
}
