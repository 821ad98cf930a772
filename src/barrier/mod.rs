//! Barrier Aggregator Module
//!
//! The fan-in half of the pipeline. Shards are validated independently; a barrier
//! waits until a declared number of distinct shards has reported for a stage of a
//! run, then publishes exactly one follow-up job.
//!
//! ## Core Concepts
//! - **Distinct membership**: completion counts shard names, never messages, so a
//!   redelivered signal can neither complete a barrier early nor complete it twice.
//! - **Last write wins**: a shard's payload is replaced, never added, on redelivery.
//! - **Wall-clock timeout**: a barrier that never fills up completes anyway after the
//!   configured timeout with whatever it has, flagged as timed out.
//!
//! ## Submodules
//! - **`aggregator`**: The barrier state machine and per-stage merge functions.

pub mod aggregator;

#[cfg(test)]
mod tests;
