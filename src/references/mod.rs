//! External Reference Resolution Module
//!
//! Decides which references of a shard point to something that exists.
//!
//! ## Overview
//! A reference is resolved locally when the shard itself defines it, or when a common
//! shard of the run defines its bare id. Whatever is left goes through an ordered
//! chain of resolvers; each resolver vouches for the references it recognizes and the
//! rest moves on to the next one. References nobody vouches for become errors.
//!
//! ## Submodules
//! - **`resolver`**: The resolver capability and the chain.
//! - **`resolvers`**: Built-in resolvers (journey and interchange ignorers, rolling
//!   stock codespace, stop place registry).
//! - **`registry`**: The stop place / quay whitelist and its loaders.

pub mod registry;
pub mod resolver;
pub mod resolvers;
