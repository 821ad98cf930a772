use crate::dispatch::types::{HEADER_REFERENTIAL, HEADER_RUN_ID, HEADER_STATUS, ValidationRun};
use crate::queue::queue::MessageQueue;
use crate::queue::types::{Envelope, Topic};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Published on `status-notification`. `started` is advisory; a run is finished
/// once `ok` or `failed` has been published.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Ok,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Ok => "ok",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct StatusNotifier {
    queue: Arc<MessageQueue>,
}

impl StatusNotifier {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    pub fn publish(&self, run: &ValidationRun, status: RunStatus) -> Result<()> {
        let envelope = Envelope::new()
            .with_header(HEADER_RUN_ID, run.run_id.as_str())
            .with_header(HEADER_REFERENTIAL, run.referential.as_str())
            .with_header(HEADER_STATUS, status.as_str());

        self.queue.publish(Topic::StatusNotification, envelope)?;
        tracing::info!("Run {} status: {}", run, status);
        Ok(())
    }
}

/// What the HTTP surface reports for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Ok,
    Failed,
}
