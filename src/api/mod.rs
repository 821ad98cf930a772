//! HTTP API
//!
//! The node's public surface. Submitting a dataset only stores the archive and
//! queues the run; everything else happens on the worker pool, and clients poll the
//! run status or wait for the status notification.

pub mod handlers;
pub mod protocol;

use crate::pipeline::context::Pipeline;
use handlers::*;
use protocol::*;

use axum::{
    Extension, Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;

/// Upper bound on a submitted archive.
pub const MAX_ARCHIVE_BYTES: usize = 512 * 1024 * 1024;

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route(ENDPOINT_SUBMIT_DATASET, post(handle_submit_dataset))
        .route(ENDPOINT_RUN_STATUS, get(handle_get_run_status))
        .route(ENDPOINT_RUN_REPORT, get(handle_get_run_report))
        .route(ENDPOINT_QUEUE_STATS, get(handle_queue_stats))
        .route(ENDPOINT_REFRESH_STOP_PLACES, post(handle_refresh_stop_places))
        .layer(DefaultBodyLimit::max(MAX_ARCHIVE_BYTES))
        .layer(Extension(pipeline))
}
