use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn, error, debug, info_span, Instrument};

use crate::{
    QueueResult, QueueError, JobError, JobQueue, LeasedJob,
    job::{HandlerRegistry, JobInvocation},
    reaper::LeaseReaper,
    types::WorkerId,
};

/// Configuration for a worker pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for worker ids
    pub name: String,
    /// Number of independent worker loops
    pub concurrency: usize,
    /// How long one lease call blocks waiting for a job
    pub lease_wait: Duration,
    /// Pause after a store error before leasing again
    pub error_backoff: Duration,
    /// Lease reaper period; `None` leaves reclaiming to another process
    pub reaper_interval: Option<Duration>,
    /// Extend the lease of running jobs this often; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 4,
            lease_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            reaper_interval: Some(Duration::from_secs(30)),
            heartbeat_interval: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease_wait(mut self, lease_wait: Duration) -> Self {
        self.lease_wait = lease_wait;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self
    }

    pub fn without_reaper(mut self) -> Self {
        self.reaper_interval = None;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

/// Handle for managing a running worker pool
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    worker_ids: Vec<WorkerId>,
}

impl WorkerPoolHandle {
    /// Ids of the worker loops in this pool
    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Stop leasing new jobs, let in-flight jobs finish, then wait for every loop to exit
    pub async fn shutdown(mut self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(true);

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
                first_error.get_or_insert(QueueError::Internal(format!("Worker join error: {}", e)));
            }
        }

        info!("Worker pool stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pool of worker loops pulling from one queue
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` worker loops (plus the lease reaper, if enabled).
    ///
    /// `context` is shared by every handler invocation.
    pub fn start<C>(
        queue: JobQueue,
        registry: HandlerRegistry<C>,
        context: Arc<C>,
        config: WorkerConfig,
    ) -> WorkerPoolHandle
    where
        C: Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(registry);
        let mut tasks = JoinSet::new();
        let mut worker_ids = Vec::with_capacity(config.concurrency);

        for index in 0..config.concurrency.max(1) {
            let worker = Worker {
                id: WorkerId::new(&config.name, index),
                queue: queue.clone(),
                registry: registry.clone(),
                context: context.clone(),
                config: config.clone(),
            };
            worker_ids.push(worker.id.clone());
            tasks.spawn(worker.run(shutdown_rx.clone()).in_current_span());
        }

        if let Some(interval) = config.reaper_interval {
            let reaper = LeaseReaper::with_interval(queue.clone(), interval);
            tasks.spawn(reaper.run(shutdown_rx.clone()).in_current_span());
        }

        info!(
            queue = %queue.name(),
            concurrency = worker_ids.len(),
            handlers = ?registry.registered_handlers(),
            "Started worker pool"
        );

        WorkerPoolHandle {
            shutdown_tx,
            tasks,
            worker_ids,
        }
    }
}

/// One worker loop: lease, dispatch, report
struct Worker<C: Send + Sync + 'static> {
    id: WorkerId,
    queue: JobQueue,
    registry: Arc<HandlerRegistry<C>>,
    context: Arc<C>,
    config: WorkerConfig,
}

impl<C: Send + Sync + 'static> Worker<C> {
    /// Run the worker loop
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, queue = %self.queue.name(), "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stop = async {
                let _ = shutdown.wait_for(|stopping| *stopping).await;
            };
            let leased = self.queue.lease_or_stop(&self.id, self.config.lease_wait, stop).await;

            // Pool handle dropped without a shutdown call
            if shutdown.has_changed().is_err() {
                if let Ok(Some(leased)) = leased {
                    self.process(leased).await;
                }
                break;
            }

            match leased {
                Ok(Some(leased)) => self.process(leased).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.id, "Error leasing job: {}", e);
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = %self.id, "Worker stopped");
    }

    /// Execute one leased job and report the outcome to the queue
    async fn process(&self, leased: LeasedJob) {
        let invocation = JobInvocation::from_leased(&leased, &self.id);
        let handler_name = invocation.handler.clone();
        let span = info_span!(
            "job",
            job_id = %leased.job_id(),
            handler = %handler_name,
            attempt = leased.attempt(),
            worker = %self.id,
        );

        async {
            debug!("Processing job");
            let started = Instant::now();
            let outcome = self.execute(&leased, invocation).await;
            self.queue
                .metrics()
                .record_execution_time(&handler_name, started.elapsed());

            let report = match &outcome {
                Ok(()) => self.queue.acknowledge(&leased).await,
                Err(job_error) => self.queue.fail(&leased, job_error).await.map(|_| ()),
            };

            match report {
                Ok(()) => {}
                Err(QueueError::LeaseExpired(_)) | Err(QueueError::UnknownJob(_)) => {
                    // Another worker owns (or already settled) the job now
                    warn!("Lease lost before the outcome was reported, discarding result");
                }
                Err(e) => error!("Failed to report job outcome: {}", e),
            }
        }
        .instrument(span)
        .await
    }

    /// Run the handler on its own task so a panic only fails this job
    async fn execute(&self, leased: &LeasedJob, invocation: JobInvocation) -> Result<(), JobError> {
        let handler = match self.registry.get(&invocation.handler) {
            Ok(handler) => handler,
            Err(e) => return Err(JobError::permanent(e.to_string())),
        };

        let context = self.context.clone();
        let mut task = tokio::spawn(
            async move { handler.handle(context, invocation).await }.in_current_span(),
        );

        let joined = match self.config.heartbeat_interval {
            None => task.await,
            Some(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        joined = &mut task => break joined,
                        _ = ticker.tick() => {
                            if let Err(e) = self.queue.heartbeat(leased, period).await {
                                warn!("Heartbeat failed: {}", e);
                            }
                        }
                    }
                }
            }
        };

        joined.unwrap_or_else(|e| Err(join_error_to_job_error(e)))
    }
}

fn join_error_to_job_error(err: JoinError) -> JobError {
    if err.is_panic() {
        JobError::transient(format!("Handler panicked: {}", panic_message(err.into_panic())))
    } else {
        JobError::transient(format!("Handler task cancelled: {}", err))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
