//! Job Error Taxonomy
//!
//! Every job handler returns a [`JobResult`]. The variant decides what the worker
//! pool does with the message that triggered the handler:
//!
//! - **`NotFound`**: the input is gone (typically because an earlier delivery already
//!   finished and cleaned up). The message is acknowledged and a warning is logged.
//! - **`Retryable`**: transient failure. The message is released for redelivery.
//! - **`Fatal`**: the message can never succeed (unknown job type, missing headers).
//!   The message is dead-lettered.

use thiserror::Error;

pub type JobResult<T = ()> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("retryable failure: {0:#}")]
    Retryable(anyhow::Error),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        JobError::NotFound(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        JobError::Retryable(error)
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        JobError::Retryable(error.into())
    }
}
