//! ID Consistency Repository
//!
//! Per-run id bookkeeping on top of the shared accumulator:
//!
//! - `ids:{run}:accumulated`: bare ids of every shard processed so far.
//! - `ids:{run}:common`: bare ids defined by common shards.
//! - `ids:{run}:processed:{shard}`: marker set once a shard has been registered.
//! - `ids:{run}:lock`: run-scoped lock around check-and-register.
//!
//! The lock covers only the intersection, the union and the marker write. A shard
//! that is validated again after a retry finds its marker and reports nothing, so it
//! never flags itself as a duplicate of its own earlier delivery.

use super::types::*;
use crate::storage::accumulator::AccumulatorStore;

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct IdRepository {
    store: Arc<AccumulatorStore>,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl IdRepository {
    pub fn new(store: Arc<AccumulatorStore>, lock_ttl: Duration, lock_wait: Duration) -> Self {
        Self {
            store,
            lock_ttl,
            lock_wait,
        }
    }

    /// Returns the bare ids of `local_ids` that an earlier shard of the run already
    /// defined, then adds them to the run's accumulated set. A shard that was already
    /// registered gets an empty set back and changes nothing.
    pub async fn check_and_register_duplicates(
        &self,
        run_id: &str,
        shard_name: &str,
        local_ids: &HashSet<IdVersion>,
    ) -> Result<HashSet<String>> {
        let ids: HashSet<String> = local_ids
            .iter()
            .filter(|id| !is_ignorable(&id.element_name))
            .map(|id| id.id.clone())
            .collect();

        let _guard = self
            .store
            .lock(&lock_key(run_id), self.lock_ttl, self.lock_wait)
            .await?;

        let marker = processed_key(run_id, shard_name);
        if self.store.exists(&marker) {
            tracing::debug!(
                "Shard {} of run {} already registered, skipping duplicate check",
                shard_name,
                run_id
            );
            return Ok(HashSet::new());
        }

        let accumulated = accumulated_key(run_id);
        let duplicates = self.store.sinter(&accumulated, &ids);
        self.store.sadd(&accumulated, ids);
        self.store.set(&marker, "1");

        if !duplicates.is_empty() {
            tracing::info!(
                "Shard {} of run {} redefines {} ids",
                shard_name,
                run_id,
                duplicates.len()
            );
        }
        Ok(duplicates)
    }

    /// Adds the definitions of a common shard to the run's common id set.
    pub fn register_common_ids(&self, run_id: &str, ids: &HashSet<IdVersion>) -> usize {
        let added = self
            .store
            .sadd(&common_key(run_id), ids.iter().map(|id| id.id.clone()));
        tracing::debug!("Registered {} common ids for run {}", added, run_id);
        added
    }

    /// Filled when the dataset is split, before any shard is validated.
    pub fn get_common_ids(&self, run_id: &str) -> HashSet<String> {
        self.store.smembers(&common_key(run_id))
    }

    pub fn accumulated_ids(&self, run_id: &str) -> HashSet<String> {
        self.store.smembers(&accumulated_key(run_id))
    }

    /// Drops every id set, marker and lock of the run.
    pub fn clear(&self, run_id: &str) -> usize {
        self.store.delete_prefix(&format!("ids:{}:", run_id))
    }
}

fn accumulated_key(run_id: &str) -> String {
    format!("ids:{}:accumulated", run_id)
}

fn common_key(run_id: &str) -> String {
    format!("ids:{}:common", run_id)
}

fn processed_key(run_id: &str, shard_name: &str) -> String {
    format!("ids:{}:processed:{}", run_id, shard_name)
}

fn lock_key(run_id: &str) -> String {
    format!("ids:{}:lock", run_id)
}
