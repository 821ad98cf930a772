use super::protocol::*;
use crate::dispatch::types::{JobType, ShardJob, ValidationRun};
use crate::pipeline::context::Pipeline;
use crate::queue::types::Topic;
use crate::storage::blob::paths;

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query},
    http::StatusCode,
};
use std::sync::Arc;

/// Referential used for maintenance jobs that belong to no tenant.
pub const SYSTEM_REFERENTIAL: &str = "system";

pub async fn handle_submit_dataset(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path(referential): Path<String>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> (StatusCode, Json<SubmitResponse>) {
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitResponse {
                run_id: None,
                referential,
                profile: params.profile,
                error: Some("Empty request body, expected a zip archive".to_string()),
            }),
        );
    }

    match pipeline
        .accept_submission(&referential, params.profile.as_deref(), body.to_vec())
        .await
    {
        Ok(run) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                run_id: Some(run.run_id),
                referential: run.referential,
                profile: Some(run.profile),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Rejected dataset for {}: {:#}", referential, e);
            (
                StatusCode::BAD_REQUEST,
                Json(SubmitResponse {
                    run_id: None,
                    referential,
                    profile: params.profile,
                    error: Some(format!("{:#}", e)),
                }),
            )
        }
    }
}

pub async fn handle_get_run_status(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path((referential, run_id)): Path<(String, String)>,
) -> (StatusCode, Json<RunStatusResponse>) {
    let state = match pipeline.run_state(&referential, &run_id).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to read state of run {}/{}: {:#}", referential, run_id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunStatusResponse {
                    run_id,
                    referential,
                    state: None,
                }),
            );
        }
    };

    let code = if state.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        code,
        Json(RunStatusResponse {
            run_id,
            referential,
            state,
        }),
    )
}

pub async fn handle_get_run_report(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Path((referential, run_id)): Path<(String, String)>,
) -> (StatusCode, Json<ReportResponse>) {
    match pipeline
        .load_report(&paths::final_report(&referential, &run_id))
        .await
    {
        Ok(Some(report)) => (StatusCode::OK, Json(ReportResponse { report: Some(report) })),
        Ok(None) => {
            tracing::debug!("No final report for run {}/{}", referential, run_id);
            (StatusCode::NOT_FOUND, Json(ReportResponse { report: None }))
        }
        Err(e) => {
            tracing::error!("Failed to load report of run {}/{}: {}", referential, run_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ReportResponse { report: None }),
            )
        }
    }
}

pub async fn handle_queue_stats(
    Extension(pipeline): Extension<Arc<Pipeline>>,
) -> (StatusCode, Json<QueueStatsResponse>) {
    let topics = Topic::ALL
        .iter()
        .map(|topic| (topic.as_str().to_string(), pipeline.queue.stats(*topic)))
        .collect();

    (
        StatusCode::OK,
        Json(QueueStatsResponse {
            topics,
            idle: pipeline.queue.is_idle(),
        }),
    )
}

/// Queues a stop place cache refresh. It runs under a synthetic run of its own.
pub async fn handle_refresh_stop_places(
    Extension(pipeline): Extension<Arc<Pipeline>>,
) -> (StatusCode, Json<RefreshResponse>) {
    let run = ValidationRun::new(SYSTEM_REFERENTIAL, "");

    match pipeline.publish(ShardJob::new(JobType::RefreshStopPlaceCache, &run)) {
        Ok(()) => {
            tracing::info!("Stop place cache refresh queued as {}", run);
            (
                StatusCode::ACCEPTED,
                Json(RefreshResponse {
                    run_id: Some(run.run_id),
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to queue stop place cache refresh: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RefreshResponse { run_id: None }),
            )
        }
    }
}
