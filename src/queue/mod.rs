//! Message Queue Module
//!
//! The at-least-once transport that drives the whole pipeline.
//!
//! ## Architecture Overview
//! The queue follows a **Pull-based** model with **Lease** management:
//! 1. **Publication**: Jobs are appended to a named topic.
//! 2. **Claiming**: A worker "claims" a message by taking a lease on it.
//! 3. **Execution**: The worker dispatches the message while renewing the lease.
//! 4. **Redelivery**: If the worker dies, the lease expires and another worker
//!    receives the same message again. Handlers must therefore be idempotent.
//!
//! ## Submodules
//! - **`types`**: Topics, envelopes and delivery bookkeeping.
//! - **`queue`**: The topic store with claim / renew / ack / release / dead-letter.
//! - **`executor`**: The per-topic worker pools.

pub mod executor;
pub mod queue;
pub mod types;

#[cfg(test)]
mod tests;
