//! Validation Pipeline Module
//!
//! The stage handlers behind every job type, wired onto the [`JobDispatcher`].
//!
//! ## Overview
//! A run flows through the pipeline as a chain of jobs:
//!
//! 1. **`submit`**: publishes `started` once, then `split`.
//! 2. **`split`**: extracts the archive into shards and fans out schema validation,
//!    common-file validation or full validation depending on the profile.
//! 3. **`validateSchema` / `aggregateSchema` / `scheduleValidation`**: the optional
//!    schema stage and its barrier.
//! 4. **`validateShard` / `aggregateCommonFiles` / `scheduleLineFiles`**: per-shard
//!    validation, common files before line files.
//! 5. **`aggregateReports` / `validateDataset`**: fan-in of shard reports, dataset
//!    validators.
//! 6. **`completeValidation`**: persists the final report, publishes `ok`/`failed`
//!    and purges the run.
//!
//! Every handler may run more than once for the same job and is written to be
//! idempotent under redelivery.
//!
//! ## Submodules
//! - **`context`**: The [`Pipeline`](context::Pipeline) holding every shared component.
//! - **`splitter`**: Archive extraction and fan-out.
//! - **`stages`**: Schema, shard, dataset and completion handlers.
//! - **`validators`**: The pluggable shard and dataset validator capabilities.
//! - **`status`**: Run status notifications.
//! - **`routes`**: Job type to handler wiring.
//!
//! [`JobDispatcher`]: crate::dispatch::dispatcher::JobDispatcher

pub mod context;
pub mod routes;
pub mod splitter;
pub mod stages;
pub mod status;
pub mod validators;

#[cfg(test)]
mod tests;
