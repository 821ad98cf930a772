//! Node configuration.
//!
//! Loaded from a TOML file passed with `--config`. Every field has a default so a
//! missing file (or a partial one) still yields a runnable single-node setup backed
//! by in-memory stores.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_workers_per_topic")]
    pub workers_per_topic: usize,
    /// Visibility timeout: a claimed message becomes deliverable again once its lease lapses.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_lease_renew_secs")]
    pub lease_renew_secs: u64,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-topic bound on messages no worker removes: dead letters and status notifications.
    #[serde(default = "default_retained_messages")]
    pub retained_messages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory of the filesystem blob store. In-memory when unset.
    #[serde(default)]
    pub blob_root: Option<PathBuf>,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    /// Period of the sweep that evicts expired markers, tombstones and stale locks.
    #[serde(default = "default_housekeeping_secs")]
    pub housekeeping_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    #[serde(default = "default_common_file_prefix")]
    pub common_file_prefix: String,
    #[serde(default = "default_max_entries_per_rule")]
    pub max_entries_per_rule: usize,
    #[serde(default = "default_barrier_timeout_secs")]
    pub barrier_timeout_secs: u64,
    #[serde(default = "default_terminated_run_ttl_secs")]
    pub terminated_run_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub stop_place_url: Option<String>,
    #[serde(default)]
    pub stop_place_file: Option<PathBuf>,
    #[serde(default = "default_rolling_stock_codespace")]
    pub rolling_stock_codespace: String,
}

/// A named selection of validators. Submissions pick one with `?profile=`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    pub name: String,
    #[serde(default)]
    pub schema_validation: bool,
    #[serde(default)]
    pub schema_validators: Vec<String>,
    #[serde(default)]
    pub rule_validators: Vec<String>,
    #[serde(default)]
    pub dataset_validators: Vec<String>,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_workers_per_topic() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    30
}

fn default_lease_renew_secs() -> u64 {
    10
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_retained_messages() -> usize {
    1000
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_lock_wait_secs() -> u64 {
    30
}

fn default_housekeeping_secs() -> u64 {
    300
}

fn default_common_file_prefix() -> String {
    "_".to_string()
}

fn default_max_entries_per_rule() -> usize {
    100
}

fn default_barrier_timeout_secs() -> u64 {
    1800
}

fn default_terminated_run_ttl_secs() -> u64 {
    86_400
}

fn default_rolling_stock_codespace() -> String {
    "NRS".to_string()
}

fn default_profiles() -> Vec<ProfileSettings> {
    vec![
        ProfileSettings {
            name: "full".to_string(),
            schema_validation: true,
            schema_validators: vec!["well-formed-xml".to_string()],
            rule_validators: vec!["versioned-definitions".to_string()],
            dataset_validators: vec!["missing-shard-reports".to_string()],
        },
        ProfileSettings {
            name: "no-schema".to_string(),
            schema_validation: false,
            schema_validators: Vec::new(),
            rule_validators: vec!["versioned-definitions".to_string()],
            dataset_validators: vec!["missing-shard-reports".to_string()],
        },
    ]
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            queue: QueueSettings::default(),
            storage: StorageSettings::default(),
            validation: ValidationSettings::default(),
            registry: RegistrySettings::default(),
            profiles: default_profiles(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers_per_topic: default_workers_per_topic(),
            lease_secs: default_lease_secs(),
            lease_renew_secs: default_lease_renew_secs(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            retained_messages: default_retained_messages(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            blob_root: None,
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_secs: default_lock_wait_secs(),
            housekeeping_secs: default_housekeeping_secs(),
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            common_file_prefix: default_common_file_prefix(),
            max_entries_per_rule: default_max_entries_per_rule(),
            barrier_timeout_secs: default_barrier_timeout_secs(),
            terminated_run_ttl_secs: default_terminated_run_ttl_secs(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            stop_place_url: None,
            stop_place_file: None,
            rolling_stock_codespace: default_rolling_stock_codespace(),
        }
    }
}

impl ClusterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn profile(&self, name: &str) -> Option<&ProfileSettings> {
        self.profiles.iter().find(|profile| profile.name == name)
    }
}

impl QueueSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lease_renewal(&self) -> Duration {
        Duration::from_secs(self.lease_renew_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StorageSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_secs.max(1))
    }
}

impl ValidationSettings {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.barrier_timeout_secs)
    }

    pub fn terminated_run_ttl(&self) -> Duration {
        Duration::from_secs(self.terminated_run_ttl_secs)
    }
}
