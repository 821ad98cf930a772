//! Job Routes
//!
//! Binds every [`JobType`] to its stage handler on a [`JobDispatcher`].

use super::context::Pipeline;
use crate::dispatch::dispatcher::JobDispatcher;
use crate::dispatch::types::{JobType, ShardJob};
use crate::error::JobResult;

use std::future::Future;
use std::sync::Arc;

/// A dispatcher with a route for every job type.
pub fn dispatcher_for(pipeline: &Arc<Pipeline>) -> Arc<JobDispatcher> {
    let dispatcher = JobDispatcher::new();
    register_routes(pipeline, &dispatcher);
    dispatcher
}

pub fn register_routes(pipeline: &Arc<Pipeline>, dispatcher: &JobDispatcher) {
    route(dispatcher, pipeline, JobType::Submit, |p, job| async move {
        p.submit(job).await
    });
    route(dispatcher, pipeline, JobType::Split, |p, job| async move {
        p.split(job).await
    });
    route(dispatcher, pipeline, JobType::ValidateSchema, |p, job| async move {
        p.validate_schema(job).await
    });
    route(dispatcher, pipeline, JobType::ScheduleValidation, |p, job| async move {
        p.schedule_validation(job).await
    });
    route(dispatcher, pipeline, JobType::ValidateShard, |p, job| async move {
        p.validate_shard(job).await
    });
    route(dispatcher, pipeline, JobType::ScheduleLineFiles, |p, job| async move {
        p.schedule_line_files(job).await
    });
    for signal in [
        JobType::AggregateSchema,
        JobType::AggregateCommonFiles,
        JobType::AggregateReports,
    ] {
        route(dispatcher, pipeline, signal, |p, job| async move {
            p.aggregate(job).await
        });
    }
    route(dispatcher, pipeline, JobType::ValidateDataset, |p, job| async move {
        p.validate_dataset(job).await
    });
    route(dispatcher, pipeline, JobType::CompleteValidation, |p, job| async move {
        p.complete_validation(job).await
    });
    route(dispatcher, pipeline, JobType::RefreshStopPlaceCache, |p, job| async move {
        p.refresh_stop_place_cache(job).await
    });

    tracing::info!("Registered {} job routes", dispatcher.handler_count());
}

fn route<F, Fut>(dispatcher: &JobDispatcher, pipeline: &Arc<Pipeline>, job_type: JobType, stage: F)
where
    F: Fn(Arc<Pipeline>, ShardJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    let pipeline = pipeline.clone();
    dispatcher.register(job_type, move |job| stage(pipeline.clone(), job));
}
