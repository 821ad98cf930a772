use crate::dispatch::types::{JobType, ShardJob, ValidationRun};
use crate::error::{JobError, JobResult};
use crate::queue::queue::MessageQueue;
use crate::storage::accumulator::AccumulatorStore;

use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The three synchronization points of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierStage {
    /// Every shard passed schema validation.
    SchemaValidation,
    /// Every common shard registered its ids.
    CommonFiles,
    /// Every shard report is stored.
    Reports,
}

impl BarrierStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierStage::SchemaValidation => "schema",
            BarrierStage::CommonFiles => "common-files",
            BarrierStage::Reports => "reports",
        }
    }

    /// The stage a signal job feeds.
    pub fn for_signal(job_type: JobType) -> Option<Self> {
        match job_type {
            JobType::AggregateSchema => Some(BarrierStage::SchemaValidation),
            JobType::AggregateCommonFiles => Some(BarrierStage::CommonFiles),
            JobType::AggregateReports => Some(BarrierStage::Reports),
            _ => None,
        }
    }

    pub fn signal(&self) -> JobType {
        match self {
            BarrierStage::SchemaValidation => JobType::AggregateSchema,
            BarrierStage::CommonFiles => JobType::AggregateCommonFiles,
            BarrierStage::Reports => JobType::AggregateReports,
        }
    }

    /// The job published once the barrier completes.
    pub fn downstream(&self) -> JobType {
        match self {
            BarrierStage::SchemaValidation => JobType::ScheduleValidation,
            BarrierStage::CommonFiles => JobType::ScheduleLineFiles,
            BarrierStage::Reports => JobType::ValidateDataset,
        }
    }
}

impl fmt::Display for BarrierStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds one shard's payload into the accumulated payload:
/// `(accumulated, shard_name, payload) -> accumulated`.
pub type MergeFn = Arc<dyn Fn(Value, &str, &Value) -> Value + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Counted; the barrier is still short of its target.
    Waiting { received: usize, target: usize },
    /// This signal completed the barrier and the downstream job was published.
    Completed,
    /// The barrier had already completed.
    AlreadyComplete,
    /// The run is finished; late signals are dropped.
    RunTerminated,
}

pub struct BarrierAggregator {
    store: Arc<AccumulatorStore>,
    queue: Arc<MessageQueue>,
    timeout: Duration,
    merges: HashMap<BarrierStage, MergeFn>,
    timers: DashMap<String, JoinHandle<()>>,
}

impl BarrierAggregator {
    /// Every stage starts with [`collect_shard_names`] as its merge function.
    pub fn new(store: Arc<AccumulatorStore>, queue: Arc<MessageQueue>, timeout: Duration) -> Self {
        let mut merges: HashMap<BarrierStage, MergeFn> = HashMap::new();
        for stage in [
            BarrierStage::SchemaValidation,
            BarrierStage::CommonFiles,
            BarrierStage::Reports,
        ] {
            merges.insert(stage, Arc::new(collect_shard_names));
        }

        Self {
            store,
            queue,
            timeout,
            merges,
            timers: DashMap::new(),
        }
    }

    pub fn with_merge<F>(mut self, stage: BarrierStage, merge: F) -> Self
    where
        F: Fn(Value, &str, &Value) -> Value + Send + Sync + 'static,
    {
        self.merges.insert(stage, Arc::new(merge));
        self
    }

    /// Records one shard signal. Requires `shardName` and `totalShards`.
    pub fn signal(self: &Arc<Self>, job: &ShardJob) -> JobResult<SignalOutcome> {
        let stage = BarrierStage::for_signal(job.job_type).ok_or_else(|| {
            JobError::fatal(format!("{} is not a barrier signal", job.job_type))
        })?;
        let shard_name = job.require_shard()?;
        let target = job.require_total_shards()?;
        let run = &job.run;

        if self.is_terminated(&run.run_id) {
            tracing::debug!(
                "Ignoring {} signal from {} for terminated run {}",
                stage,
                shard_name,
                run
            );
            return Ok(SignalOutcome::RunTerminated);
        }

        if self.store.exists(&done_key(&run.run_id, stage)) {
            tracing::debug!(
                "Barrier {} of run {} already complete, ignoring {}",
                stage,
                run,
                shard_name
            );
            return Ok(SignalOutcome::AlreadyComplete);
        }

        let received = self
            .store
            .hset(&members_key(&run.run_id, stage), shard_name, job.body.clone());

        if received >= target {
            return self.complete(stage, run, target, false);
        }

        tracing::debug!(
            "Barrier {} of run {}: {}/{} shards",
            stage,
            run,
            received,
            target
        );
        self.arm_timer(stage, run, target);
        Ok(SignalOutcome::Waiting { received, target })
    }

    /// Number of distinct shards that have signalled `stage`.
    pub fn received(&self, run_id: &str, stage: BarrierStage) -> usize {
        self.store.hlen(&members_key(run_id, stage))
    }

    pub fn is_complete(&self, run_id: &str, stage: BarrierStage) -> bool {
        self.store.exists(&done_key(run_id, stage))
    }

    /// Drops all barrier state of a run and cancels its timers.
    pub fn clear(&self, run_id: &str) -> usize {
        let timer_prefix = format!("{}:", run_id);
        self.timers.retain(|key, handle| {
            if key.starts_with(&timer_prefix) {
                handle.abort();
                false
            } else {
                true
            }
        });
        self.store.delete_prefix(&format!("barrier:{}:", run_id))
    }

    /// Marks a run as finished for `ttl`. Signals arriving meanwhile are dropped.
    pub fn terminate(&self, run_id: &str, ttl: Duration) {
        self.store.set_nx(&terminated_key(run_id), "1", Some(ttl));
    }

    pub fn is_terminated(&self, run_id: &str) -> bool {
        self.store.exists(&terminated_key(run_id))
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn complete(
        &self,
        stage: BarrierStage,
        run: &ValidationRun,
        target: usize,
        timed_out: bool,
    ) -> JobResult<SignalOutcome> {
        let done = done_key(&run.run_id, stage);
        if !self.store.set_nx(&done, "1", None) {
            return Ok(SignalOutcome::AlreadyComplete);
        }

        let members = self.store.hgetall(&members_key(&run.run_id, stage));
        let received = members.len();
        let merged = match self.merges.get(&stage) {
            Some(merge) => members
                .iter()
                .fold(Value::Null, |acc, (shard, payload)| {
                    merge(acc, shard.as_str(), payload)
                }),
            None => Value::Null,
        };

        let downstream = ShardJob::new(stage.downstream(), run)
            .with_total_shards(target)
            .with_timed_out(timed_out)
            .with_body(merged);

        if let Err(e) = self
            .queue
            .publish(downstream.job_type.topic(), downstream.to_envelope())
        {
            // Let the next delivery try again.
            self.store.delete(&done);
            return Err(e.into());
        }

        if !timed_out
            && let Some((_, timer)) = self.timers.remove(&timer_key(&run.run_id, stage))
        {
            timer.abort();
        }

        if timed_out {
            tracing::warn!(
                "Barrier {} of run {} (referential {}) timed out with {}/{} shards",
                stage,
                run.run_id,
                run.referential,
                received,
                target
            );
        } else {
            tracing::info!(
                "Barrier {} of run {} complete with {} shards, published {}",
                stage,
                run,
                received,
                stage.downstream()
            );
        }
        Ok(SignalOutcome::Completed)
    }

    /// Starts the timeout of a waiting barrier. No-op once the barrier is complete.
    pub(crate) fn arm_timer(
        self: &Arc<Self>,
        stage: BarrierStage,
        run: &ValidationRun,
        target: usize,
    ) {
        let key = timer_key(&run.run_id, stage);
        if self.timers.contains_key(&key) || self.is_complete(&run.run_id, stage) {
            return;
        }

        let aggregator = self.clone();
        let timer_run = run.clone();
        let timeout = self.timeout;
        let own_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            aggregator.timers.remove(&own_key);

            if aggregator.is_terminated(&timer_run.run_id) {
                return;
            }
            if let Err(e) = aggregator.complete(stage, &timer_run, target, true) {
                tracing::error!("Failed to force barrier {} of run {}: {}", stage, timer_run, e);
            }
        });

        if let Some(previous) = self.timers.insert(key.clone(), timer) {
            // Lost a race with a concurrent signal; keep one timer only.
            previous.abort();
        }

        // A signal that completed the barrier meanwhile found no timer to cancel.
        if self.is_complete(&run.run_id, stage)
            && let Some((_, timer)) = self.timers.remove(&key)
        {
            timer.abort();
        }
    }
}

/// Default merge: `{"shards": [names...]}` in shard-name order.
pub fn collect_shard_names(accumulated: Value, shard_name: &str, _payload: &Value) -> Value {
    let mut shards = accumulated
        .get("shards")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    shards.push(Value::String(shard_name.to_string()));

    let mut merged = match accumulated {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    merged.insert("shards".to_string(), Value::Array(shards));
    Value::Object(merged)
}

/// Shard names plus `hasError`, true when any payload carries `"hasError": true`.
pub fn collect_errors(accumulated: Value, shard_name: &str, payload: &Value) -> Value {
    let had_error = accumulated
        .get("hasError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let has_error = payload
        .get("hasError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut merged = collect_shard_names(accumulated, shard_name, payload);
    if let Value::Object(map) = &mut merged {
        map.insert("hasError".to_string(), json!(had_error || has_error));
    }
    merged
}

fn members_key(run_id: &str, stage: BarrierStage) -> String {
    format!("barrier:{}:{}:members", run_id, stage)
}

fn done_key(run_id: &str, stage: BarrierStage) -> String {
    format!("barrier:{}:{}:done", run_id, stage)
}

fn timer_key(run_id: &str, stage: BarrierStage) -> String {
    format!("{}:{}", run_id, stage)
}

fn terminated_key(run_id: &str) -> String {
    format!("terminated:{}", run_id)
}
