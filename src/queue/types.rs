use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for one published message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// The named queues of the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    DatasetSubmitted,
    SplitJob,
    ValidateShardJob,
    AggregateCommonFiles,
    AggregateSchemaValidation,
    AggregateReports,
    StatusNotification,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::DatasetSubmitted,
        Topic::SplitJob,
        Topic::ValidateShardJob,
        Topic::AggregateCommonFiles,
        Topic::AggregateSchemaValidation,
        Topic::AggregateReports,
        Topic::StatusNotification,
    ];

    /// Topics drained by the job worker pool. Status notifications are consumed
    /// by the submitting system, not by this cluster.
    pub const JOB_TOPICS: [Topic; 6] = [
        Topic::DatasetSubmitted,
        Topic::SplitJob,
        Topic::ValidateShardJob,
        Topic::AggregateCommonFiles,
        Topic::AggregateSchemaValidation,
        Topic::AggregateReports,
    ];

    /// `true` when workers remove this topic's messages once handled.
    pub fn is_drained(&self) -> bool {
        Self::JOB_TOPICS.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DatasetSubmitted => "dataset-submitted",
            Topic::SplitJob => "split-job",
            Topic::ValidateShardJob => "validate-shard-job",
            Topic::AggregateCommonFiles => "aggregate-common-files",
            Topic::AggregateSchemaValidation => "aggregate-schema-validation",
            Topic::AggregateReports => "aggregate-reports",
            Topic::StatusNotification => "status-notification",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message on the wire: string metadata headers plus a JSON body.
///
/// Immutable once published. The same envelope may be delivered more than once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }
}

/// Delivery state of a message inside its topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeliveryStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker. Accompanied by a `lease_expires` timestamp in `QueueEntry`;
    /// once the lease lapses the message is deliverable again.
    InFlight,
    /// Moved aside after a fatal error or too many deliveries.
    DeadLettered { reason: String },
}

/// The queue's bookkeeping around one envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub envelope: Envelope,
    pub status: DeliveryStatus,
    /// Publication order within the queue.
    pub sequence: u64,
    /// How many times the message has been handed to a worker.
    pub deliveries: u32,
    /// Timestamp (ms) when the message was published.
    pub published_at: u64,
    /// Timestamp (ms) when the current lease expires.
    pub lease_expires: Option<u64>,
}

/// Per-topic counters, exposed by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicStats {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
