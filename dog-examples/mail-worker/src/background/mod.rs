//! Background email delivery for the application
//!
//! Builds the job queue from settings, registers the handlers and runs the worker pool.

pub mod jobs;

use anyhow::{Context, Result};
use dog_mail::{EmailProvider, HttpEmailProvider, RecordingProvider};
use dog_queue::prelude::*;
use dog_queue::RedisBackend;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::config::{MailTarget, QueueTarget, Settings};

pub use jobs::*;

/// Shared by every handler invocation
pub struct MailContext {
    pub provider: Arc<dyn EmailProvider>,
}

impl MailContext {
    pub fn new(provider: Arc<dyn EmailProvider>) -> Self {
        Self { provider }
    }
}

/// Open the queue named in `settings` on the configured store
pub async fn connect_queue(target: &QueueTarget, config: QueueConfig) -> Result<JobQueue> {
    match target {
        QueueTarget::Memory => Ok(JobQueue::in_memory(config)),
        QueueTarget::Redis(url) => {
            let backend = RedisBackend::connect(url)
                .await
                .with_context(|| format!("connecting to {}", url))?;
            Ok(JobQueue::with_config(Arc::new(backend), config))
        }
    }
}

/// Build the configured email provider
pub fn email_provider(target: &MailTarget) -> Result<Arc<dyn EmailProvider>> {
    match target {
        MailTarget::Recording => Ok(Arc::new(RecordingProvider::new())),
        MailTarget::Http(config) => Ok(Arc::new(HttpEmailProvider::new(config.clone())?)),
    }
}

/// Every handler this application runs
pub fn registry() -> QueueResult<HandlerRegistry<MailContext>> {
    let mut registry = HandlerRegistry::new();
    registry.register(SEND_WELCOME_EMAIL, WelcomeEmailHandler)?;
    Ok(registry)
}

/// Queue, producer and worker pool bundled together
pub struct BackgroundSystem {
    queue: JobQueue,
    producer: Producer,
    context: Arc<MailContext>,
    worker_config: WorkerConfig,
    pool: Option<WorkerPoolHandle>,
}

impl BackgroundSystem {
    pub fn new(queue: JobQueue, provider: Arc<dyn EmailProvider>, worker_config: WorkerConfig) -> Self {
        Self {
            producer: Producer::new(queue.clone()),
            queue,
            context: Arc::new(MailContext::new(provider)),
            worker_config,
            pool: None,
        }
    }

    /// Build everything `settings` describes
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let queue = connect_queue(&settings.queue_target, settings.queue.clone()).await?;
        let provider = email_provider(&settings.mail)?;
        Ok(Self::new(queue, provider, settings.worker.clone()))
    }

    /// Start the worker pool. Calling it twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }

        let pool = WorkerPool::start(
            self.queue.clone(),
            registry()?,
            self.context.clone(),
            self.worker_config.clone(),
        );
        info!(
            queue = %self.queue.name(),
            provider = self.context.provider.name(),
            workers = pool.worker_ids().len(),
            "Background email delivery started"
        );
        self.pool = Some(pool);
        Ok(())
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queue depth and job counters
    pub async fn stats(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "queue": self.queue.name(),
            "workers": self.pool.as_ref().map(|p| p.worker_ids().len()).unwrap_or(0),
            "pending": self.queue.pending_count().await?,
            "running": self.queue.running_count().await?,
            "dead_lettered": self.queue.dead_letters().await?.len(),
            "metrics": self.queue.metrics().snapshot(),
        }))
    }

    /// Stop leasing and wait for in-flight jobs
    pub async fn shutdown(self) -> Result<()> {
        if let Some(pool) = self.pool {
            pool.shutdown().await?;
        }
        info!("Background email delivery stopped");
        Ok(())
    }
}
