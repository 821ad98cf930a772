//! Job Dispatcher
//!
//! A routing table from [`JobType`] to an async handler. The dispatcher holds no
//! state beyond that mapping: it parses the envelope, picks exactly one handler by
//! the `jobType` header and runs it. Unknown or unroutable job types are fatal.

use super::types::*;
use crate::error::{JobError, JobResult};
use crate::queue::types::Envelope;

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous job handler.
pub type JobHandlerFn =
    Arc<dyn Fn(ShardJob) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

pub struct JobDispatcher {
    handlers: DashMap<JobType, JobHandlerFn>,
}

impl JobDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
        })
    }

    /// Routes `job_type` to `handler`, replacing any previous route.
    pub fn register<F, Fut>(&self, job_type: JobType, handler: F)
    where
        F: Fn(ShardJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler_fn: JobHandlerFn = Arc::new(move |job: ShardJob| {
            Box::pin(handler(job)) as Pin<Box<dyn Future<Output = JobResult> + Send>>
        });

        self.handlers.insert(job_type, handler_fn);
        tracing::debug!("Registered job handler: {}", job_type);
    }

    /// Parses `envelope` and runs the handler registered for its job type.
    pub async fn dispatch(&self, envelope: &Envelope) -> JobResult {
        let job = ShardJob::from_envelope(envelope).inspect_err(|e| {
            tracing::error!("Rejecting unroutable message: {}", e);
        })?;

        let handler = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.value().clone(),
            None => {
                let error = format!("No handler registered for job type {}", job.job_type);
                tracing::error!("{}", error);
                return Err(JobError::Fatal(error));
            }
        };

        tracing::debug!(
            "Dispatching {} for run {} (shard: {:?})",
            job.job_type,
            job.run,
            job.shard_name
        );
        handler(job).await
    }

    pub fn has_handler(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for JobDispatcher {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
