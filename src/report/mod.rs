//! Validation Report Module
//!
//! The result model shared by every stage of the pipeline.
//!
//! ## Overview
//! A [`types::ValidationReport`] is produced per shard, persisted to the blob store,
//! and folded into one dataset report once every shard has reported in.
//!
//! ## Submodules
//! - **`types`**: Findings, severities, locations and the report itself.
//! - **`merger`**: Concatenating reports and capping the number of entries per rule.

pub mod merger;
pub mod types;
