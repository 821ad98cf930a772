//! HTTP Protocol
//!
//! Endpoints and DTOs of the node's HTTP surface: dataset submission, run status and
//! report lookup, queue statistics and the stop place cache refresh trigger.

use crate::pipeline::status::RunState;
use crate::queue::types::TopicStats;
use crate::report::types::ValidationReport;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ENDPOINT_SUBMIT_DATASET: &str = "/datasets/:referential";
pub const ENDPOINT_RUN_STATUS: &str = "/runs/:referential/:run_id";
pub const ENDPOINT_RUN_REPORT: &str = "/runs/:referential/:run_id/report";
pub const ENDPOINT_QUEUE_STATS: &str = "/queue/stats";
pub const ENDPOINT_REFRESH_STOP_PLACES: &str = "/cache/stop-places/refresh";

/// Query string of a submission: `?profile=<name>`. The default profile applies
/// when absent.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitParams {
    pub profile: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: Option<String>,
    pub referential: String,
    pub profile: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunStatusResponse {
    pub run_id: String,
    pub referential: String,
    /// `None` for a run this node has never seen.
    pub state: Option<RunState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportResponse {
    pub report: Option<ValidationReport>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub topics: BTreeMap<String, TopicStats>,
    pub idle: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub run_id: Option<String>,
}
