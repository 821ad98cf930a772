//! Job Dispatch Module
//!
//! Maps every delivered message to exactly one stage handler by its `jobType`
//! header.
//!
//! ## Submodules
//! - **`types`**: Job types, header names, [`types::ValidationRun`] and the typed
//!   [`types::ShardJob`] view of an envelope.
//! - **`dispatcher`**: The routing table.

pub mod dispatcher;
pub mod types;
