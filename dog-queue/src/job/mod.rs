pub mod registry;

pub use registry::HandlerRegistry;

use std::sync::Arc;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{JobError, JobId, LeasedJob, WorkerId};

/// Everything a handler learns about the job it runs
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub job_id: JobId,
    pub handler: String,
    pub args: Vec<Value>,
    /// 1-based attempt number
    pub attempt: u32,
    pub worker: WorkerId,
}

impl JobInvocation {
    pub fn from_leased(leased: &LeasedJob, worker: &WorkerId) -> Self {
        Self {
            job_id: leased.job_id().clone(),
            handler: leased.message().handler.clone(),
            args: leased.message().args.clone(),
            attempt: leased.attempt(),
            worker: worker.clone(),
        }
    }

    /// Decode the positional argument at `index`.
    ///
    /// A missing or malformed argument is a permanent failure: retrying cannot fix it.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self.args.get(index).ok_or_else(|| {
            JobError::permanent(format!(
                "{} expects argument {} but got {} arguments",
                self.handler,
                index,
                self.args.len()
            ))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Optional positional argument; `None` when absent or null
    pub fn opt_arg<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, JobError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }
}

/// Logic a worker invokes for jobs naming it.
///
/// `C` is the shared application context (clients, config) handed to every call.
/// Handlers may run more than once for the same job and must tolerate it.
#[async_trait]
pub trait JobHandler<C: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, ctx: Arc<C>, invocation: JobInvocation) -> Result<(), JobError>;
}

/// Adapter so plain async closures can be registered as handlers
pub(crate) struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub(crate) fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<C, F, Fut> JobHandler<C> for FnHandler<F>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, JobInvocation) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: Arc<C>, invocation: JobInvocation) -> Result<(), JobError> {
        (self.f)(ctx, invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(args: Vec<Value>) -> JobInvocation {
        JobInvocation {
            job_id: JobId::new(),
            handler: "sendWelcomeEmail".to_string(),
            args,
            attempt: 1,
            worker: WorkerId::from("w"),
        }
    }

    #[test]
    fn decodes_positional_arguments() {
        let inv = invocation(vec![json!("user@example.com"), json!(3)]);
        let email: String = inv.arg(0).unwrap();
        let count: u32 = inv.arg(1).unwrap();
        assert_eq!(email, "user@example.com");
        assert_eq!(count, 3);
        assert_eq!(inv.opt_arg::<String>(2).unwrap(), None);
    }

    #[test]
    fn missing_or_mistyped_arguments_are_permanent() {
        let inv = invocation(vec![json!(42)]);
        assert!(matches!(inv.arg::<String>(0), Err(JobError::Permanent(_))));
        assert!(matches!(inv.arg::<String>(5), Err(JobError::Permanent(_))));
    }
}
