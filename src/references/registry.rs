//! Stop Place Registry
//!
//! An in-memory whitelist of valid stop place and quay ids. Readers take a cheap
//! `Arc` snapshot; a refresh builds a complete new snapshot and swaps it in, so a
//! lookup never observes a half-loaded registry.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopPlaceSnapshot {
    #[serde(default)]
    pub stop_places: HashSet<String>,
    #[serde(default)]
    pub quays: HashSet<String>,
}

pub struct StopPlaceRegistry {
    snapshot: RwLock<Arc<StopPlaceSnapshot>>,
    http_client: reqwest::Client,
}

impl StopPlaceRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(StopPlaceSnapshot::default())),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_snapshot(snapshot: StopPlaceSnapshot) -> Self {
        let registry = Self::new();
        registry.replace(snapshot);
        registry
    }

    pub fn snapshot(&self) -> Arc<StopPlaceSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn replace(&self, snapshot: StopPlaceSnapshot) {
        tracing::info!(
            "Stop place registry updated: {} stop places, {} quays",
            snapshot.stop_places.len(),
            snapshot.quays.len()
        );
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn has_quay(&self, id: &str) -> bool {
        self.snapshot.read().quays.contains(id)
    }

    pub fn has_stop_place(&self, id: &str) -> bool {
        self.snapshot.read().stop_places.contains(id)
    }

    /// Reloads from `url` when given, else from `file`. Returns `false` when neither
    /// source is configured and the current snapshot was kept.
    pub async fn refresh(&self, url: Option<&str>, file: Option<&Path>) -> Result<bool> {
        let snapshot = match (url, file) {
            (Some(url), _) => self.fetch(url).await?,
            (None, Some(file)) => Self::load_file(file).await?,
            (None, None) => {
                tracing::debug!("No stop place source configured, keeping current registry");
                return Ok(false);
            }
        };

        self.replace(snapshot);
        Ok(true)
    }

    pub async fn load_file(path: &Path) -> Result<StopPlaceSnapshot> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read stop place file {}", path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Invalid stop place file {}", path.display()))
    }

    async fn fetch(&self, url: &str) -> Result<StopPlaceSnapshot> {
        let response = self
            .get_with_retry(url, Duration::from_secs(30), 3)
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Stop place registry request failed {}",
                response.status()
            ));
        }

        let snapshot: StopPlaceSnapshot = response.json().await?;
        Ok(snapshot)
    }

    async fn get_with_retry(
        &self,
        url: &str,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self.http_client.get(url).timeout(timeout).send().await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    tracing::warn!("Stop place registry fetch failed (attempt {}): {}", attempt + 1, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

impl Default for StopPlaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
