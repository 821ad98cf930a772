//! Shared Accumulator Store
//!
//! A Redis-shaped key-value store holding every piece of cross-worker mutable state:
//! accumulated id sets, per-shard markers, barrier membership and run properties.
//!
//! ## Guarantees
//! - **Atomic read-modify-write per key**: set unions, hash writes and conditional
//!   inserts run while holding the key's `DashMap` shard lock, so concurrent callers
//!   never lose each other's writes.
//! - **TTL-bounded mutual exclusion**: `lock` hands out a guard that releases on drop.
//!   A lock whose holder crashed (guard never dropped, lease never released) expires
//!   after its TTL and can be taken over.

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Process-wide accumulator. Cloned by `Arc` into every component that needs it.
pub struct AccumulatorStore {
    sets: DashMap<String, HashSet<String>>,
    hashes: DashMap<String, HashMap<String, serde_json::Value>>,
    values: DashMap<String, StoredValue>,
    locks: DashMap<String, LockEntry>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Proof of holding a lock. Dropping it releases the lock if it is still ours.
pub struct LockGuard<'a> {
    store: &'a AccumulatorStore,
    key: String,
    owner: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let released = self
            .store
            .locks
            .remove_if(&self.key, |_, entry| entry.owner == self.owner)
            .is_some();

        if released {
            tracing::trace!("Released lock {}", self.key);
        } else {
            tracing::warn!("Lock {} expired before release (held too long)", self.key);
        }
    }
}

impl AccumulatorStore {
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
            hashes: DashMap::new(),
            values: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    // --- Sets ---

    /// Unions `items` into the set at `key`. Returns the set size afterwards.
    pub fn sadd<I>(&self, key: &str, items: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = self.sets.entry(key.to_string()).or_default();
        set.extend(items);
        set.len()
    }

    /// Returns the members of `items` that are already in the set at `key`.
    pub fn sinter(&self, key: &str, items: &HashSet<String>) -> HashSet<String> {
        match self.sets.get(key) {
            Some(set) => items
                .iter()
                .filter(|item| set.contains(*item))
                .cloned()
                .collect(),
            None => HashSet::new(),
        }
    }

    pub fn smembers(&self, key: &str) -> HashSet<String> {
        self.sets
            .get(key)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn scard(&self, key: &str) -> usize {
        self.sets.get(key).map(|set| set.len()).unwrap_or(0)
    }

    // --- Hashes ---

    /// Writes `field = value` into the hash at `key` (last write wins per field)
    /// and returns the number of distinct fields afterwards.
    pub fn hset(&self, key: &str, field: &str, value: serde_json::Value) -> usize {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        hash.insert(field.to_string(), value);
        hash.len()
    }

    /// Snapshot of the hash, ordered by field name.
    pub fn hgetall(&self, key: &str) -> BTreeMap<String, serde_json::Value> {
        self.hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn hlen(&self, key: &str) -> usize {
        self.hashes.get(key).map(|hash| hash.len()).unwrap_or(0)
    }

    // --- Plain values and markers ---

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .filter(|stored| !stored.is_expired())
            .map(|stored| stored.value.clone())
    }

    /// Inserts the value only when the key is absent (or expired).
    /// Returns `true` when this call created it.
    pub fn set_nx(&self, key: &str, value: impl Into<String>, ttl: Option<Duration>) -> bool {
        let stored = StoredValue {
            value: value.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };

        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired() {
                    entry.insert(stored);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(stored);
                true
            }
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Removes a plain value or marker.
    pub fn delete(&self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Removes every set, hash, value and lock whose key starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let before = self.key_count();

        self.sets.retain(|key, _| !key.starts_with(prefix));
        self.hashes.retain(|key, _| !key.starts_with(prefix));
        self.values.retain(|key, _| !key.starts_with(prefix));
        self.locks.retain(|key, _| !key.starts_with(prefix));

        before.saturating_sub(self.key_count())
    }

    pub fn key_count(&self) -> usize {
        self.sets.len() + self.hashes.len() + self.values.len() + self.locks.len()
    }

    /// Removes values whose TTL has passed and locks whose holder's TTL has lapsed.
    /// Reads already ignore both; this releases the keys. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let values = self.values.len();
        let locks = self.locks.len();

        self.values.retain(|_, stored| !stored.is_expired());
        self.locks.retain(|_, lock| lock.expires_at > now);

        values.saturating_sub(self.values.len()) + locks.saturating_sub(self.locks.len())
    }

    // --- Locks ---

    /// Takes the lock at `key` if it is free or its holder's TTL has lapsed.
    pub fn try_lock(&self, key: &str, ttl: Duration) -> Option<LockGuard<'_>> {
        let owner = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let entry = LockEntry {
            owner: owner.clone(),
            expires_at: now + ttl,
        };

        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().expires_at <= now {
                    tracing::warn!(
                        "Taking over stale lock {} (previous holder {})",
                        key,
                        existing.get().owner
                    );
                    existing.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        };

        acquired.then(|| LockGuard {
            store: self,
            key: key.to_string(),
            owner,
        })
    }

    /// Waits up to `wait` for the lock at `key`, backing off with jitter between attempts.
    pub async fn lock(&self, key: &str, ttl: Duration, wait: Duration) -> Result<LockGuard<'_>> {
        let started = Instant::now();
        let mut delay_ms = 5u64;

        loop {
            if let Some(guard) = self.try_lock(key, ttl) {
                tracing::trace!("Acquired lock {}", key);
                return Ok(guard);
            }

            if started.elapsed() >= wait {
                return Err(anyhow::anyhow!(
                    "Timed out after {:?} waiting for lock {}",
                    wait,
                    key
                ));
            }

            let jitter = rand::random::<u64>() % 5;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(200);
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

impl Default for AccumulatorStore {
    fn default() -> Self {
        Self::new()
    }
}
