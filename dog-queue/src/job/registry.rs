use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::{
    QueueResult, QueueError, JobError,
    job::{FnHandler, JobHandler, JobInvocation},
};

/// Registry mapping handler names to handlers. Fixed once workers start.
pub struct HandlerRegistry<C: Send + Sync + 'static> {
    handlers: HashMap<String, Arc<dyn JobHandler<C>>>,
}

impl<C: Send + Sync + 'static> HandlerRegistry<C> {
    /// Create a new handler registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under `name`
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> QueueResult<()>
    where
        H: JobHandler<C> + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(QueueError::HandlerAlreadyRegistered(name));
        }

        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> QueueResult<()>
    where
        F: Fn(Arc<C>, JobInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(name, FnHandler::new(f))
    }

    /// Look up the handler for a job
    pub fn get(&self, name: &str) -> QueueResult<Arc<dyn JobHandler<C>>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotFound(name.to_string()))
    }

    /// Check if a handler is registered
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get all registered handler names, sorted
    pub fn registered_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<C: Send + Sync + 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
