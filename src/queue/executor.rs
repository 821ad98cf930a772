//! Worker Pool Implementation
//!
//! One pool of workers per job topic. Every worker continuously polls its topic,
//! claims a message, hands it to the [`JobDispatcher`], and settles the message
//! according to the handler's outcome.
//!
//! ## Responsibilities
//! - **Polling**: checking the topic for deliverable messages.
//! - **Deadline extension**: a sidecar task renews the message lease while the handler
//!   runs, so long validations are not redelivered mid-flight.
//! - **Settlement**: `Ok` and `NotFound` acknowledge, `Retryable` releases for
//!   redelivery, `Fatal` dead-letters.

use super::queue::{MessageQueue, ReleaseOutcome};
use super::types::*;
use crate::dispatch::dispatcher::JobDispatcher;
use crate::error::JobError;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct JobExecutor {
    queue: Arc<MessageQueue>,
    dispatcher: Arc<JobDispatcher>,
    workers_per_topic: usize,
    renew_interval: Duration,
    poll_interval: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(
        queue: Arc<MessageQueue>,
        dispatcher: Arc<JobDispatcher>,
        workers_per_topic: usize,
        renew_interval: Duration,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            dispatcher,
            workers_per_topic: workers_per_topic.max(1),
            renew_interval,
            poll_interval,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the worker pools and returns immediately.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for topic in Topic::JOB_TOPICS {
            for worker_id in 0..self.workers_per_topic {
                let executor = self.clone();
                handles.push(tokio::spawn(async move {
                    executor.worker_loop(topic, worker_id).await;
                }));
            }
        }

        tracing::info!(
            "Job executor started with {} workers on each of {} topics",
            self.workers_per_topic,
            Topic::JOB_TOPICS.len()
        );
    }

    /// Stops every worker. In-flight messages keep their lease and are redelivered
    /// once it lapses.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
        }
        tracing::info!("Job executor stopped");
    }

    async fn worker_loop(&self, topic: Topic, worker_id: usize) {
        tracing::debug!("Worker {} on {} started", worker_id, topic);

        loop {
            if !self.process_next(topic).await {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Claims and handles at most one message from `topic`.
    /// Returns `false` when nothing could be claimed.
    pub async fn process_next(&self, topic: Topic) -> bool {
        for (message_id, entry) in self.queue.available(topic) {
            match self.queue.try_claim(topic, &message_id) {
                Ok(true) => {
                    tracing::debug!(
                        "Claimed message {} on {} (jobType: {:?})",
                        message_id.0,
                        topic,
                        entry.envelope.header("jobType")
                    );
                    self.execute_with_lease(topic, &message_id, entry.envelope)
                        .await;
                    return true;
                }
                Ok(false) => {
                    tracing::trace!("Message {} already claimed by another worker", message_id.0);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Failed to claim message {}: {}", message_id.0, e);
                    continue;
                }
            }
        }

        false
    }

    /// Runs the handler while a sidecar task keeps extending the message lease.
    async fn execute_with_lease(&self, topic: Topic, message_id: &MessageId, envelope: Envelope) {
        let renewal_handle = self.spawn_lease_renewal(topic, message_id);

        let result = self.dispatcher.dispatch(&envelope).await;

        renewal_handle.abort();

        let settled = match result {
            Ok(()) => self.queue.ack(topic, message_id),
            Err(JobError::NotFound(what)) => {
                tracing::warn!(
                    "Message {} on {} refers to missing data ({}), treating as already processed",
                    message_id.0,
                    topic,
                    what
                );
                self.queue.ack(topic, message_id)
            }
            Err(JobError::Retryable(e)) => {
                let reason = format!("{:#}", e);
                match self.queue.release(topic, message_id, &reason) {
                    Ok(ReleaseOutcome::Requeued { deliveries }) => {
                        tracing::warn!(
                            "Message {} on {} failed (delivery {}), will be redelivered: {}",
                            message_id.0,
                            topic,
                            deliveries,
                            reason
                        );
                        Ok(())
                    }
                    Ok(ReleaseOutcome::DeadLettered) => {
                        tracing::error!(
                            "Message {} on {} dead-lettered after repeated failures: {}",
                            message_id.0,
                            topic,
                            reason
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(JobError::Fatal(reason)) => {
                tracing::error!(
                    "Fatal error handling message {} on {}, dead-lettering: {}",
                    message_id.0,
                    topic,
                    reason
                );
                self.queue.dead_letter(topic, message_id, &reason)
            }
        };

        if let Err(e) = settled {
            tracing::error!("Failed to settle message {}: {}", message_id.0, e);
        }
    }

    fn spawn_lease_renewal(&self, topic: Topic, message_id: &MessageId) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let message_id = message_id.clone();
        let interval = self.renew_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                if queue.renew_lease(topic, &message_id).is_err() {
                    tracing::trace!("Message {} no longer needs lease renewal", message_id.0);
                    break;
                }
            }
        })
    }
}
