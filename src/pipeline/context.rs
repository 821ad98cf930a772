//! Pipeline Context
//!
//! [`Pipeline`] owns every component a stage handler touches and the helpers the
//! stages share: job publication, report persistence, run properties and the end of
//! a run's life (final report, terminal status, purge).
//!
//! Run properties live in the accumulator under `run:{run}:`:
//! - `run:{run}:shards`: every shard name of the archive.
//! - `run:{run}:common_shards`: the common subset.
//! - `run:{run}:started`: set once `started` was published.

use super::status::{RunState, RunStatus, StatusNotifier};
use super::validators::ValidatorRegistry;
use crate::barrier::aggregator::{BarrierAggregator, BarrierStage, collect_errors};
use crate::config::{ClusterConfig, ProfileSettings};
use crate::dispatch::types::{ShardJob, ValidationRun};
use crate::error::{JobError, JobResult};
use crate::ids::repository::IdRepository;
use crate::queue::queue::MessageQueue;
use crate::references::registry::StopPlaceRegistry;
use crate::references::resolver::ResolverChain;
use crate::report::types::ValidationReport;
use crate::storage::accumulator::AccumulatorStore;
use crate::storage::blob::{BlobStore, paths};

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DEFAULT_PROFILE: &str = "full";

pub struct Pipeline {
    pub config: Arc<ClusterConfig>,
    pub queue: Arc<MessageQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub store: Arc<AccumulatorStore>,
    pub ids: Arc<IdRepository>,
    pub registry: Arc<StopPlaceRegistry>,
    pub resolvers: Arc<ResolverChain>,
    pub barrier: Arc<BarrierAggregator>,
    pub validators: ValidatorRegistry,
    pub status: StatusNotifier,
}

impl Pipeline {
    /// Wires every component from `config`. Fails when a profile names an unknown
    /// validator.
    pub fn new(
        config: ClusterConfig,
        blobs: Arc<dyn BlobStore>,
        validators: ValidatorRegistry,
    ) -> Result<Arc<Self>> {
        for profile in &config.profiles {
            validators
                .check_profile(profile)
                .with_context(|| format!("Invalid validation profile {}", profile.name))?;
        }

        let queue = Arc::new(
            MessageQueue::new(config.queue.lease(), config.queue.max_deliveries)
                .with_retention(config.queue.retained_messages),
        );
        let store = Arc::new(AccumulatorStore::new());
        let ids = Arc::new(IdRepository::new(
            store.clone(),
            config.storage.lock_ttl(),
            config.storage.lock_wait(),
        ));
        let registry = Arc::new(StopPlaceRegistry::new());
        let resolvers = Arc::new(ResolverChain::standard(
            &config.registry.rolling_stock_codespace,
            registry.clone(),
        ));
        let barrier = Arc::new(
            BarrierAggregator::new(
                store.clone(),
                queue.clone(),
                config.validation.barrier_timeout(),
            )
            .with_merge(BarrierStage::SchemaValidation, collect_errors),
        );

        tracing::info!(
            "Pipeline ready: {} profiles, resolvers {:?}",
            config.profiles.len(),
            resolvers.names()
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            status: StatusNotifier::new(queue.clone()),
            queue,
            blobs,
            store,
            ids,
            registry,
            resolvers,
            barrier,
            validators,
        }))
    }

    pub fn profile(&self, run: &ValidationRun) -> JobResult<&ProfileSettings> {
        self.config.profile(&run.profile).ok_or_else(|| {
            JobError::fatal(format!(
                "Unknown validation profile {} for run {}",
                run.profile, run
            ))
        })
    }

    pub fn is_common(&self, shard_name: &str) -> bool {
        shard_name.starts_with(&self.config.validation.common_file_prefix)
    }

    pub fn publish(&self, job: ShardJob) -> JobResult {
        self.queue.publish(job.job_type.topic(), job.to_envelope())?;
        Ok(())
    }

    /// `NotFound` once the run has finished, so late jobs end as no-ops.
    pub fn ensure_active(&self, run: &ValidationRun) -> JobResult {
        if self.barrier.is_terminated(&run.run_id) {
            return Err(JobError::not_found(format!("run {} already finished", run)));
        }
        Ok(())
    }

    pub async fn load_report(&self, path: &str) -> JobResult<Option<ValidationReport>> {
        match self.blobs.get(path).await? {
            Some(content) => Ok(Some(ValidationReport::from_json(&content)?)),
            None => Ok(None),
        }
    }

    pub async fn store_report(&self, path: &str, report: &ValidationReport) -> JobResult {
        self.blobs.put(path, report.to_json()?).await?;
        Ok(())
    }

    /// Missing shard content means an earlier delivery already finished the run.
    pub async fn download_shard(&self, run: &ValidationRun, shard_name: &str) -> JobResult<Vec<u8>> {
        let path = paths::shard(&run.referential, &run.run_id, shard_name);
        self.blobs
            .get(&path)
            .await?
            .ok_or_else(|| JobError::not_found(format!("shard {}", path)))
    }

    pub fn record_shards(&self, run: &ValidationRun, shards: &[String]) {
        self.store.sadd(&shards_key(&run.run_id), shards.iter().cloned());
        self.store.sadd(
            &common_shards_key(&run.run_id),
            shards.iter().filter(|shard| self.is_common(shard)).cloned(),
        );
    }

    /// All shard names and the common ones, both sorted.
    pub fn run_shards(&self, run_id: &str) -> (Vec<String>, BTreeSet<String>) {
        let all: BTreeSet<String> = self.store.smembers(&shards_key(run_id)).into_iter().collect();
        let common: BTreeSet<String> = self
            .store
            .smembers(&common_shards_key(run_id))
            .into_iter()
            .collect();
        (all.into_iter().collect(), common)
    }

    /// Publishes `started` unless this run already did.
    pub fn mark_started(&self, run: &ValidationRun) -> JobResult {
        let key = started_key(&run.run_id);
        if !self.store.set_nx(&key, "1", None) {
            tracing::debug!("Run {} already announced as started", run);
            return Ok(());
        }

        if let Err(e) = self.status.publish(run, RunStatus::Started) {
            self.store.delete(&key);
            return Err(e.into());
        }
        Ok(())
    }

    /// Persists the final report (first writer wins), publishes the terminal status
    /// once and purges the run.
    pub async fn finish_run(
        &self,
        run: &ValidationRun,
        report: ValidationReport,
    ) -> JobResult<RunStatus> {
        let final_path = paths::final_report(&run.referential, &run.run_id);
        let report = match self.load_report(&final_path).await? {
            Some(existing) => {
                tracing::info!("Final report of run {} already stored, keeping it", run);
                existing
            }
            None => {
                self.store_report(&final_path, &report).await?;
                report
            }
        };

        let status = if report.has_error() {
            RunStatus::Failed
        } else {
            RunStatus::Ok
        };

        let marker = paths::status_marker(&run.referential, &run.run_id);
        if self.blobs.exists(&marker).await? {
            tracing::debug!("Terminal status of run {} already published", run);
        } else {
            self.status.publish(run, status)?;
            self.blobs.put(&marker, Vec::new()).await?;
        }

        self.purge_run(run).await?;
        tracing::info!(
            "Run {} finished: {} ({} entries)",
            run,
            status,
            report.entries.len()
        );
        Ok(status)
    }

    /// Drops every piece of intermediate state of the run and leaves a tombstone
    /// so stragglers are ignored.
    pub async fn purge_run(&self, run: &ValidationRun) -> JobResult {
        self.barrier
            .terminate(&run.run_id, self.config.validation.terminated_run_ttl());

        let ids = self.ids.clear(&run.run_id);
        let barriers = self.barrier.clear(&run.run_id);
        let properties = self.store.delete_prefix(&format!("run:{}:", run.run_id));
        let blobs = self
            .blobs
            .delete_prefix(&paths::work_dir(&run.referential, &run.run_id))
            .await?;

        let expired = self.store.evict_expired();

        tracing::debug!(
            "Purged run {}: {} id keys, {} barrier keys, {} properties, {} blobs, {} expired keys",
            run,
            ids,
            barriers,
            properties,
            blobs,
            expired
        );
        Ok(())
    }

    /// Periodic sweep of state nothing else removes. Expired tombstones and markers
    /// leave the accumulator; queue retention is enforced on publication.
    pub fn housekeeping(&self) -> usize {
        let expired = self.store.evict_expired();
        if expired > 0 {
            tracing::debug!("Housekeeping evicted {} expired keys", expired);
        }
        expired
    }

    /// State of a run as seen from outside. `None` for unknown runs.
    pub async fn run_state(&self, referential: &str, run_id: &str) -> Result<Option<RunState>> {
        let final_path = paths::final_report(referential, run_id);
        if let Some(content) = self.blobs.get(&final_path).await? {
            let report = ValidationReport::from_json(&content)?;
            return Ok(Some(if report.has_error() {
                RunState::Failed
            } else {
                RunState::Ok
            }));
        }

        if self
            .blobs
            .exists(&paths::inbound_archive(referential, run_id))
            .await?
        {
            return Ok(Some(RunState::Pending));
        }
        Ok(None)
    }

    pub async fn refresh_stop_places(&self) -> Result<bool> {
        self.registry
            .refresh(
                self.config.registry.stop_place_url.as_deref(),
                self.config.registry.stop_place_file.as_deref(),
            )
            .await
    }
}

fn shards_key(run_id: &str) -> String {
    format!("run:{}:shards", run_id)
}

fn common_shards_key(run_id: &str) -> String {
    format!("run:{}:common_shards", run_id)
}

fn started_key(run_id: &str) -> String {
    format!("run:{}:started", run_id)
}
