use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    QueueResult, QueueError, JobId, JobMessage, JobRecord, JobStatus, LeasedJob, JobEvent,
    backend::{BoxStream, FailDisposition, QueueBackend},
    types::{later_by, LeaseToken, WorkerId},
};

/// Pending index key: visibility first, enqueue order second
type PendingKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueState {
    pending: BTreeMap<PendingKey, JobId>,
    running: HashSet<JobId>,
    dead: Vec<JobId>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Job records indexed by job_id
    jobs: HashMap<JobId, JobRecord>,

    /// queue_name -> indexes
    queues: HashMap<String, QueueState>,

    next_seq: u64,
}

impl MemoryState {
    /// Look up a job that `lease_token` currently holds, as of `now`
    fn leased_record(
        &mut self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> QueueResult<&mut JobRecord> {
        let record = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;

        if record.status != JobStatus::Running {
            return Err(QueueError::UnknownJob(job_id.clone()));
        }
        if !record.holds_lease(lease_token) || record.lease_expired(now) {
            return Err(QueueError::LeaseExpired(job_id.clone()));
        }
        Ok(record)
    }

    fn queue_mut(&mut self, queue: &str) -> &mut QueueState {
        self.queues.entry(queue.to_string()).or_default()
    }
}

/// In-memory backend for tests, development and single-process deployments.
///
/// One mutex guards the whole store, so every trait method is atomic.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,

    /// Event broadcaster for observability
    event_broadcaster: broadcast::Sender<JobEvent>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            event_broadcaster,
        }
    }

    fn emit(&self, events: Vec<JobEvent>) {
        for event in events {
            let _ = self.event_broadcaster.send(event);
        }
    }

    /// Force a lease to expire (test helper)
    pub fn force_lease_expiry(&self, job_id: &JobId) {
        let mut state = self.state.lock();
        if let Some(record) = state.jobs.get_mut(job_id) {
            if record.status == JobStatus::Running {
                record.lease_until = Some(Utc::now() - chrono::Duration::seconds(1));
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(&self, message: JobMessage) -> QueueResult<JobId> {
        let now = Utc::now();
        let job_id = JobId::new();

        let event = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;

            let record = JobRecord::new(job_id.clone(), seq, message, now);
            let key = (record.visible_at, record.seq);
            let queue = record.message.queue.clone();
            let handler = record.message.handler.clone();

            state.jobs.insert(job_id.clone(), record);
            state.queue_mut(&queue).pending.insert(key, job_id.clone());

            JobEvent::Enqueued {
                job_id: job_id.clone(),
                queue,
                handler,
                at: now,
            }
        };

        self.emit(vec![event]);
        Ok(job_id)
    }

    async fn lease(
        &self,
        queue: &str,
        worker: &WorkerId,
        lease_duration: Duration,
    ) -> QueueResult<Option<LeasedJob>> {
        let now = Utc::now();

        let leased = {
            let mut state = self.state.lock();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Ok(None);
            };

            // Ordered by visibility, so if the head is not visible nothing is
            let visible = matches!(queue_state.pending.first_key_value(), Some(((visible_at, _), _)) if *visible_at <= now);
            if !visible {
                return Ok(None);
            }
            let Some((_, job_id)) = queue_state.pending.pop_first() else {
                return Ok(None);
            };
            queue_state.running.insert(job_id.clone());

            let record = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| QueueError::Internal(format!("pending job {} has no record", job_id)))?;

            let lease_token = LeaseToken::new();
            let lease_until = later_by(now, lease_duration);
            record.start_processing(worker.clone(), lease_token.clone(), lease_until, now);

            LeasedJob::new(record.clone(), lease_token, lease_until)
        };

        self.emit(vec![JobEvent::Leased {
            job_id: leased.job_id().clone(),
            worker: worker.clone(),
            attempt: leased.attempt(),
            lease_until: leased.lease_until,
            at: now,
        }]);

        Ok(Some(leased))
    }

    async fn acknowledge(&self, job_id: &JobId, lease_token: &LeaseToken) -> QueueResult<()> {
        let now = Utc::now();

        {
            let mut state = self.state.lock();
            let record = state.leased_record(job_id, lease_token, now)?;
            record.finish(now);
            let queue = record.message.queue.clone();
            state.queue_mut(&queue).running.remove(job_id);
        }

        self.emit(vec![JobEvent::Finished {
            job_id: job_id.clone(),
            at: now,
        }]);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        error: String,
        disposition: FailDisposition,
    ) -> QueueResult<JobStatus> {
        let now = Utc::now();

        let (status, event) = {
            let mut state = self.state.lock();
            let record = state.leased_record(job_id, lease_token, now)?;
            let queue = record.message.queue.clone();

            match disposition {
                FailDisposition::Retry { visible_at } => {
                    record.schedule_retry(error.clone(), visible_at, now);
                    let key = (record.visible_at, record.seq);
                    let queue_state = state.queue_mut(&queue);
                    queue_state.running.remove(job_id);
                    queue_state.pending.insert(key, job_id.clone());

                    (JobStatus::Failed, JobEvent::Retrying {
                        job_id: job_id.clone(),
                        retry_at: visible_at,
                        error,
                        at: now,
                    })
                }
                FailDisposition::DeadLetter => {
                    record.dead_letter(error.clone(), now);
                    let queue_state = state.queue_mut(&queue);
                    queue_state.running.remove(job_id);
                    queue_state.dead.push(job_id.clone());

                    (JobStatus::DeadLettered, JobEvent::DeadLettered {
                        job_id: job_id.clone(),
                        error,
                        at: now,
                    })
                }
            }
        };

        self.emit(vec![event]);
        Ok(status)
    }

    async fn heartbeat(
        &self,
        job_id: &JobId,
        lease_token: &LeaseToken,
        extra_time: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let record = state.leased_record(job_id, lease_token, now)?;

        let lease_until = later_by(record.lease_until.unwrap_or(now), extra_time);
        record.lease_until = Some(lease_until);
        record.updated_at = now;
        Ok(lease_until)
    }

    async fn cancel(&self, job_id: &JobId) -> QueueResult<bool> {
        let now = Utc::now();

        {
            let mut state = self.state.lock();
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;

            if !record.status.is_pending() {
                return Ok(false);
            }

            let key = (record.visible_at, record.seq);
            let queue = record.message.queue.clone();
            record.cancel(now);
            state.queue_mut(&queue).pending.remove(&key);
        }

        self.emit(vec![JobEvent::Cancelled {
            job_id: job_id.clone(),
            at: now,
        }]);
        Ok(true)
    }

    async fn get_record(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        self.state
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))
    }

    async fn pending_count(&self, queue: &str) -> QueueResult<usize> {
        Ok(self.state.lock().queues.get(queue).map_or(0, |q| q.pending.len()))
    }

    async fn running_count(&self, queue: &str) -> QueueResult<usize> {
        Ok(self.state.lock().queues.get(queue).map_or(0, |q| q.running.len()))
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<JobRecord>> {
        let state = self.state.lock();
        let Some(queue_state) = state.queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(queue_state
            .dead
            .iter()
            .filter_map(|job_id| state.jobs.get(job_id).cloned())
            .collect())
    }

    async fn requeue_dead(&self, job_id: &JobId) -> QueueResult<()> {
        let now = Utc::now();

        let event = {
            let mut state = self.state.lock();
            let record = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;

            if record.status != JobStatus::DeadLettered {
                return Err(QueueError::InvalidJob(format!(
                    "job {} is {}, not dead-lettered",
                    job_id, record.status
                )));
            }

            record.redrive(now);
            let key = (record.visible_at, record.seq);
            let queue = record.message.queue.clone();
            let handler = record.message.handler.clone();

            let queue_state = state.queue_mut(&queue);
            queue_state.dead.retain(|id| id != job_id);
            queue_state.pending.insert(key, job_id.clone());

            JobEvent::Enqueued {
                job_id: job_id.clone(),
                queue,
                handler,
                at: now,
            }
        };

        self.emit(vec![event]);
        Ok(())
    }

    async fn reclaim_expired(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let mut events = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for queue_state in state.queues.values_mut() {
                let expired: Vec<JobId> = queue_state
                    .running
                    .iter()
                    .filter(|job_id| state.jobs.get(*job_id).is_some_and(|r| r.lease_expired(now)))
                    .cloned()
                    .collect();

                for job_id in expired {
                    let Some(record) = state.jobs.get_mut(&job_id) else {
                        continue;
                    };
                    queue_state.running.remove(&job_id);
                    events.push(JobEvent::Reclaimed {
                        job_id: job_id.clone(),
                        at: now,
                    });

                    if record.can_retry() {
                        record.schedule_retry("Lease expired".to_string(), now, now);
                        queue_state.pending.insert((record.visible_at, record.seq), job_id.clone());
                    } else {
                        let error = format!("Lease expired after {} attempts", record.attempts);
                        record.dead_letter(error.clone(), now);
                        queue_state.dead.push(job_id.clone());
                        events.push(JobEvent::DeadLettered {
                            job_id: job_id.clone(),
                            error,
                            at: now,
                        });
                    }
                    debug!(job_id = %job_id, "Reclaimed expired lease");
                }
            }
        }

        let reclaimed = events
            .iter()
            .filter(|event| matches!(event, JobEvent::Reclaimed { .. }))
            .count();
        self.emit(events);
        Ok(reclaimed)
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver)
            .filter_map(|result| result.ok());

        Box::pin(stream)
    }
}
