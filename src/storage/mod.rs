//! Storage Module
//!
//! The two persistence seams of the pipeline.
//!
//! ## Core Concepts
//! - **Accumulator Store**: cross-worker mutable state (id sets, markers, barrier
//!   membership, run properties) with atomic per-key updates and TTL-bounded locks.
//! - **Blob Store**: immutable, path-addressed content (archives, shard files, reports).

pub mod accumulator;
pub mod blob;
