//! # dog-queue: Background Job Processing
//!
//! **Lease-based job queue with retries, dead-lettering and a worker pool**
//!
//! Producers enqueue named jobs with positional JSON arguments; workers lease
//! them, run the registered handler and report the outcome. Delivery is
//! at-least-once, so handlers must tolerate running twice.
//!
//! ## Features
//!
//! - **Exclusive leases**: a job is held by one worker at a time, guarded by a lease token
//! - **Visibility timeout**: a silent worker's lease lapses and the reaper hands the job to another
//! - **Exponential backoff**: transient failures retry after `base * 2^(attempt-1)`, capped
//! - **Dead-lettering**: permanent failures and exhausted budgets are parked for inspection and redrive
//! - **Backends**: in-memory (tests, single process) and Redis (feature `redis`)
//! - **Observability**: `tracing` spans, a job event stream and live metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_queue::prelude::*;
//! use serde_json::json;
//!
//! struct AppContext;
//!
//! # async fn run() -> QueueResult<()> {
//! let queue = JobQueue::in_memory(QueueConfig::new("emails"));
//!
//! let mut registry: HandlerRegistry<AppContext> = HandlerRegistry::new();
//! registry.register_fn("sendWelcomeEmail", |_ctx, job: JobInvocation| async move {
//!     let email: String = job.arg(0)?;
//!     println!("welcome, {}", email);
//!     Ok::<(), JobError>(())
//! })?;
//!
//! queue.enqueue("sendWelcomeEmail", vec![json!("ada@example.com"), json!("Ada")]).await?;
//!
//! let pool = WorkerPool::start(queue, registry, Arc::new(AppContext), WorkerConfig::default());
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod backoff;
pub mod backend;
pub mod job;
pub mod queue;
pub mod producer;
pub mod reaper;
pub mod worker;
pub mod observability;

// Core API exports
pub use types::{
    JobId, LeaseToken, WorkerId, JobMessage, JobRecord, JobStatus, LeasedJob, JobEvent,
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE,
};
pub use error::{QueueError, QueueResult, JobError};
pub use backoff::BackoffPolicy;
pub use backend::{QueueBackend, FailDisposition, BoxStream};
pub use backend::memory::MemoryBackend;
pub use job::{JobHandler, JobInvocation, HandlerRegistry};
pub use queue::{JobQueue, QueueConfig};
pub use producer::{IntoJob, Producer};
pub use reaper::LeaseReaper;
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolHandle};

// Observability exports
pub use observability::{LiveMetrics, MetricsSnapshot};

// Backend implementations
#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

/// Prelude for producers and workers
pub mod prelude {
    pub use crate::{
        JobQueue, QueueConfig, WorkerPool, WorkerConfig, WorkerPoolHandle, Producer, IntoJob,
    };

    pub use crate::{
        JobHandler, JobInvocation, HandlerRegistry,
    };

    pub use crate::{
        JobId, JobStatus, JobError, QueueError, QueueResult, BackoffPolicy,
    };

    pub use crate::LiveMetrics;

    pub use async_trait::async_trait;
}
