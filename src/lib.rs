//! Distributed Dataset Validation Cluster Library
//!
//! Validates timetable datasets submitted as zip archives of XML files. A dataset is
//! split into shards, the shards are validated in parallel by a pool of queue workers,
//! and barriers join the fan-outs back together until one merged report remains.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`queue`**: At-least-once topic queue with leases, lease renewal and dead letters,
//!   plus the worker pool draining it.
//! - **`dispatch`**: Job types, the job envelope and the job type to handler routing table.
//! - **`storage`**: The accumulator store (sets, hashes, markers, locks) shared by all
//!   workers and the blob store holding archives, shards and reports.
//! - **`ids`**: Id and reference extraction from shards, and the run-wide id repository
//!   that detects duplicates across shards.
//! - **`references`**: The resolver chain deciding which unresolved references are
//!   acceptable, including the stop place registry cache.
//! - **`report`**: Findings, reports and report merging.
//! - **`barrier`**: Generic per-run barriers that fire a follow-up job once every shard
//!   of a stage has reported, or once the stage timed out.
//! - **`pipeline`**: The stage handlers tying everything into a validation run.
//! - **`api`**: The HTTP surface.

pub mod api;
pub mod barrier;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod pipeline;
pub mod queue;
pub mod references;
pub mod report;
pub mod storage;
