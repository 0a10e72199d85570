use std::time::Duration;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{QueueResult, JobId, JobMessage, JobQueue};

/// A domain event that turns into exactly one job.
///
/// ```rust
/// use dog_queue::{IntoJob, QueueResult};
/// use serde_json::{json, Value};
///
/// struct InvoiceIssued { invoice_id: u64 }
///
/// impl IntoJob for InvoiceIssued {
///     const HANDLER: &'static str = "renderInvoice";
///
///     fn args(&self) -> QueueResult<Vec<Value>> {
///         Ok(vec![json!(self.invoice_id)])
///     }
/// }
/// ```
pub trait IntoJob {
    /// Name of the handler that processes the job
    const HANDLER: &'static str;

    /// Positional handler arguments
    fn args(&self) -> QueueResult<Vec<Value>>;

    /// Retry budget override
    fn max_retries(&self) -> Option<u32> {
        None
    }

    /// Delay before the job first becomes visible
    fn delay(&self) -> Option<Duration> {
        None
    }

    fn to_message(&self) -> QueueResult<JobMessage> {
        let mut message = JobMessage::new(Self::HANDLER, self.args()?);
        if let Some(max_retries) = self.max_retries() {
            message = message.with_max_retries(max_retries);
        }
        if let Some(delay) = self.delay() {
            message = message.with_delay(delay);
        }
        Ok(message)
    }
}

/// Submits domain events to a queue. Never waits for the job to run.
#[derive(Clone)]
pub struct Producer {
    queue: JobQueue,
}

impl Producer {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue the job for `event`
    #[instrument(skip(self, event), fields(handler = E::HANDLER))]
    pub async fn submit<E: IntoJob>(&self, event: &E) -> QueueResult<JobId> {
        let message = event.to_message()?;
        let job_id = self.queue.enqueue_message(message).await?;
        debug!(job_id = %job_id, "Submitted event");
        Ok(job_id)
    }
}
