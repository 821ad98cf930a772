//! ID Consistency Module
//!
//! Cross-shard identity checks for one validation run.
//!
//! ## Overview
//! Every shard defines elements (`id` attributes) and references others (`ref`
//! attributes). Shards are validated by independent workers, so detecting an id that
//! was already defined by another shard needs shared state: the accumulated id set of
//! the run, kept in the [`AccumulatorStore`](crate::storage::accumulator::AccumulatorStore).
//!
//! ## Submodules
//! - **`types`**: The `(id, version)` identity model and the structural ignore-list.
//! - **`extract`**: Streaming extraction of definitions and references from a shard.
//! - **`repository`**: Atomic check-and-register of accumulated ids, common ids.

pub mod extract;
pub mod repository;
pub mod types;
