//! Topic Queue
//!
//! An in-process message queue with at-least-once delivery. Each topic holds its
//! messages in a `DashMap`; workers poll for deliverable messages, claim one by
//! taking a lease, and finish it by acknowledging, releasing or dead-lettering.
//!
//! ## Responsibilities
//! - **Leasing**: A claimed message carries a lease. If its worker dies, the lease
//!   lapses and the message becomes deliverable again (redelivery to another worker).
//! - **Deadline extension**: Workers renew the lease while a long handler is running.
//! - **Dead-lettering**: Fatal messages, and messages that exhausted their delivery
//!   budget, are parked and never delivered again.
//! - **Retention**: Messages nothing removes (dead letters, and everything on a topic
//!   without workers) are capped per topic; the oldest are dropped first.

use super::types::*;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_RETENTION: usize = 1000;

/// What happened to a message handed back with [`MessageQueue::release`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Requeued { deliveries: u32 },
    DeadLettered,
}

pub struct MessageQueue {
    /// Structure: `Topic -> Message ID -> QueueEntry`.
    topics: Arc<DashMap<Topic, DashMap<MessageId, QueueEntry>>>,
    sequence: AtomicU64,
    lease: Duration,
    max_deliveries: u32,
    retention: usize,
}

impl MessageQueue {
    pub fn new(lease: Duration, max_deliveries: u32) -> Self {
        let topics = DashMap::new();
        for topic in Topic::ALL {
            topics.insert(topic, DashMap::new());
        }

        Self {
            topics: Arc::new(topics),
            sequence: AtomicU64::new(0),
            lease,
            max_deliveries: max_deliveries.max(1),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Appends a message to a topic.
    pub fn publish(&self, topic: Topic, envelope: Envelope) -> Result<MessageId> {
        let message_id = MessageId::new();
        let entry = QueueEntry {
            envelope,
            status: DeliveryStatus::Pending,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            deliveries: 0,
            published_at: now_ms(),
            lease_expires: None,
        };

        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;
        messages.insert(message_id.clone(), entry);
        drop(messages);

        tracing::debug!("Published message {} to {}", message_id.0, topic);
        if !topic.is_drained() {
            self.enforce_retention(topic);
        }
        Ok(message_id)
    }

    /// Messages a worker may claim, oldest first:
    /// 1. Status is `Pending`.
    /// 2. Status is `InFlight` BUT the lease has expired (worker crashed or stalled).
    pub fn available(&self, topic: Topic) -> Vec<(MessageId, QueueEntry)> {
        let mut messages: Vec<(MessageId, QueueEntry)> = match self.topics.get(&topic) {
            Some(entries) => entries
                .iter()
                .filter(|entry| is_deliverable(entry.value()))
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            None => Vec::new(),
        };

        messages.sort_by_key(|(_, entry)| entry.sequence);
        messages
    }

    /// Attempts to take the lease on a message. Returns `false` if another worker won.
    pub fn try_claim(&self, topic: Topic, message_id: &MessageId) -> Result<bool> {
        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;

        let Some(mut entry) = messages.get_mut(message_id) else {
            return Ok(false);
        };

        if !is_deliverable(&entry) {
            return Ok(false);
        }

        if entry.status == DeliveryStatus::InFlight {
            tracing::warn!(
                "Lease on message {} in {} expired, redelivering",
                message_id.0,
                topic
            );
        }

        entry.status = DeliveryStatus::InFlight;
        entry.deliveries += 1;
        entry.lease_expires = Some(now_ms() + self.lease.as_millis() as u64);

        tracing::debug!(
            "Claimed message {} in {} (delivery {})",
            message_id.0,
            topic,
            entry.deliveries
        );
        Ok(true)
    }

    /// Extends the lease of an in-flight message.
    pub fn renew_lease(&self, topic: Topic, message_id: &MessageId) -> Result<()> {
        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;

        let mut entry = messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        if entry.status != DeliveryStatus::InFlight {
            return Err(anyhow::anyhow!(
                "Message not in flight (status: {:?})",
                entry.status
            ));
        }

        entry.lease_expires = Some(now_ms() + self.lease.as_millis() as u64);
        tracing::trace!("Renewed lease for message {}", message_id.0);
        Ok(())
    }

    /// Removes a successfully handled message.
    pub fn ack(&self, topic: Topic, message_id: &MessageId) -> Result<()> {
        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;

        messages
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("Message not found"))
    }

    /// Hands a message back for redelivery, or dead-letters it once it has used up
    /// its delivery budget.
    pub fn release(
        &self,
        topic: Topic,
        message_id: &MessageId,
        error: &str,
    ) -> Result<ReleaseOutcome> {
        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;

        let mut entry = messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        entry.lease_expires = None;
        if entry.deliveries >= self.max_deliveries {
            entry.status = DeliveryStatus::DeadLettered {
                reason: format!(
                    "gave up after {} deliveries: {}",
                    entry.deliveries, error
                ),
            };
            drop(entry);
            drop(messages);
            self.enforce_retention(topic);
            return Ok(ReleaseOutcome::DeadLettered);
        }

        entry.status = DeliveryStatus::Pending;
        Ok(ReleaseOutcome::Requeued {
            deliveries: entry.deliveries,
        })
    }

    pub fn dead_letter(&self, topic: Topic, message_id: &MessageId, reason: &str) -> Result<()> {
        let messages = self
            .topics
            .get(&topic)
            .ok_or_else(|| anyhow::anyhow!("Unknown topic {}", topic))?;

        let mut entry = messages
            .get_mut(message_id)
            .ok_or_else(|| anyhow::anyhow!("Message not found"))?;

        entry.status = DeliveryStatus::DeadLettered {
            reason: reason.to_string(),
        };
        entry.lease_expires = None;
        drop(entry);
        drop(messages);

        self.enforce_retention(topic);
        Ok(())
    }

    /// Live (not dead-lettered) envelopes of a topic in publication order.
    pub fn messages(&self, topic: Topic) -> Vec<Envelope> {
        self.entries(topic)
            .into_iter()
            .filter(|entry| !matches!(entry.status, DeliveryStatus::DeadLettered { .. }))
            .map(|entry| entry.envelope)
            .collect()
    }

    /// Dead-lettered envelopes of a topic with the reason they were parked.
    pub fn dead_letters(&self, topic: Topic) -> Vec<(Envelope, String)> {
        self.entries(topic)
            .into_iter()
            .filter_map(|entry| match entry.status {
                DeliveryStatus::DeadLettered { reason } => Some((entry.envelope, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn stats(&self, topic: Topic) -> TopicStats {
        let mut stats = TopicStats::default();
        if let Some(messages) = self.topics.get(&topic) {
            for entry in messages.iter() {
                match entry.status {
                    DeliveryStatus::Pending => stats.pending += 1,
                    DeliveryStatus::InFlight => stats.in_flight += 1,
                    DeliveryStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                }
            }
        }
        stats
    }

    /// `true` when no job topic has pending or in-flight work.
    pub fn is_idle(&self) -> bool {
        Topic::JOB_TOPICS.iter().all(|topic| {
            let stats = self.stats(*topic);
            stats.pending == 0 && stats.in_flight == 0
        })
    }

    /// Drops the oldest retained messages of a topic beyond the retention bound.
    /// Returns how many were dropped.
    fn enforce_retention(&self, topic: Topic) -> usize {
        let Some(messages) = self.topics.get(&topic) else {
            return 0;
        };

        let drained = topic.is_drained();
        let mut retained: Vec<(u64, MessageId)> = messages
            .iter()
            .filter(|entry| {
                !drained || matches!(entry.status, DeliveryStatus::DeadLettered { .. })
            })
            .map(|entry| (entry.sequence, entry.key().clone()))
            .collect();
        if retained.len() <= self.retention {
            return 0;
        }

        retained.sort_by_key(|(sequence, _)| *sequence);
        let excess = retained.len() - self.retention;
        for (_, message_id) in retained.into_iter().take(excess) {
            messages.remove(&message_id);
        }

        tracing::debug!("Dropped {} retained messages from {}", excess, topic);
        excess
    }

    fn entries(&self, topic: Topic) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = match self.topics.get(&topic) {
            Some(messages) => messages.iter().map(|entry| entry.value().clone()).collect(),
            None => Vec::new(),
        };
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }
}

fn is_deliverable(entry: &QueueEntry) -> bool {
    match entry.status {
        DeliveryStatus::Pending => true,
        DeliveryStatus::InFlight => entry
            .lease_expires
            .map(|lease| now_ms() > lease)
            .unwrap_or(false),
        DeliveryStatus::DeadLettered { .. } => false,
    }
}
