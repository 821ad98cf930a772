//! Dataset Intake and Splitter
//!
//! Accepts an archive, announces the run, extracts the archive into one blob per
//! member file and fans out the first round of shard jobs. Every fan-out job carries
//! `totalShards` so the barrier receiving its result knows its target.

use super::context::{DEFAULT_PROFILE, Pipeline};
use crate::dispatch::types::{JobType, ShardJob, ValidationRun};
use crate::error::{JobError, JobResult};
use crate::ids::extract::extract_ids;
use crate::report::types::{Finding, ValidationReport, rules};
use crate::storage::blob::paths;

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

impl Pipeline {
    /// Stores a submitted archive and queues the run. Returns the new run.
    pub async fn accept_submission(
        &self,
        referential: &str,
        profile: Option<&str>,
        archive: Vec<u8>,
    ) -> Result<ValidationRun> {
        let profile = profile.unwrap_or(DEFAULT_PROFILE);
        if self.config.profile(profile).is_none() {
            return Err(anyhow::anyhow!("Unknown validation profile: {}", profile));
        }
        if referential.is_empty() {
            return Err(anyhow::anyhow!("Referential must not be empty"));
        }

        let run = ValidationRun::new(referential, profile);
        let path = paths::inbound_archive(&run.referential, &run.run_id);
        let size = archive.len();
        self.blobs.put(&path, archive).await?;

        let job = ShardJob::new(JobType::Submit, &run);
        self.queue.publish(job.job_type.topic(), job.to_envelope())?;

        tracing::info!(
            "Accepted dataset for run {} (profile {}, {} bytes)",
            run,
            run.profile,
            size
        );
        Ok(run)
    }

    pub async fn submit(&self, job: ShardJob) -> JobResult {
        self.ensure_active(&job.run)?;
        self.mark_started(&job.run)?;
        self.publish(ShardJob::new(JobType::Split, &job.run))
    }

    pub async fn split(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        let schema_validation = self.profile(run)?.schema_validation;

        let archive_path = paths::inbound_archive(&run.referential, &run.run_id);
        let Some(archive) = self.blobs.get(&archive_path).await? else {
            tracing::error!("Dataset {} of run {} not found", archive_path, run);
            return self
                .fail_run(
                    run,
                    rules::DATASET_NOT_FOUND,
                    format!("Dataset {} could not be downloaded", archive_path),
                )
                .await;
        };

        let extracted = tokio::task::spawn_blocking(move || extract_archive(&archive))
            .await
            .map_err(|e| anyhow::anyhow!("Archive extraction task failed: {}", e))?;
        let members = match extracted {
            Ok(members) => members,
            Err(e) => {
                tracing::error!("Dataset of run {} is not a readable archive: {:#}", run, e);
                return self
                    .fail_run(
                        run,
                        rules::SYSTEM_ERROR,
                        format!("Dataset archive could not be read: {:#}", e),
                    )
                    .await;
            }
        };

        if members.is_empty() {
            return self
                .fail_run(
                    run,
                    rules::EMPTY_DATASET,
                    "Dataset archive contains no XML files".to_string(),
                )
                .await;
        }

        self.register_common_definitions(run, &members);

        let shard_names: Vec<String> = members.keys().cloned().collect();
        for (shard_name, content) in members {
            let path = paths::shard(&run.referential, &run.run_id, &shard_name);
            self.blobs.put(&path, content).await?;
        }
        self.record_shards(run, &shard_names);

        let total = shard_names.len();
        let common = shard_names
            .iter()
            .filter(|shard| self.is_common(shard))
            .count();
        tracing::info!(
            "Split run {} into {} shards ({} common)",
            run,
            total,
            common
        );

        if schema_validation {
            for shard_name in &shard_names {
                self.publish(
                    ShardJob::new(JobType::ValidateSchema, run)
                        .with_shard(shard_name)
                        .with_total_shards(total),
                )?;
            }
            return Ok(());
        }

        self.schedule_shard_validation(run)
    }

    /// Common shards first when there are any, every shard otherwise.
    pub fn schedule_shard_validation(&self, run: &ValidationRun) -> JobResult {
        let (all, common) = self.run_shards(&run.run_id);
        if all.is_empty() {
            return Err(JobError::not_found(format!("shard list of run {}", run)));
        }

        let total = all.len();
        let first_round: Vec<&String> = if common.is_empty() {
            all.iter().collect()
        } else {
            common.iter().collect()
        };

        for shard_name in first_round {
            self.publish(
                ShardJob::new(JobType::ValidateShard, run)
                    .with_shard(shard_name)
                    .with_total_shards(total)
                    .with_body(json!({
                        "common": common.contains(shard_name),
                        "commonShards": common.len(),
                    })),
            )?;
        }

        tracing::debug!(
            "Scheduled {} shards of run {} for validation",
            if common.is_empty() { total } else { common.len() },
            run
        );
        Ok(())
    }

    /// Registers the definitions of every common file before any shard job runs,
    /// so common files can reference each other regardless of processing order.
    /// A file that cannot be read is left to the shard stage to report.
    fn register_common_definitions(
        &self,
        run: &ValidationRun,
        members: &BTreeMap<String, Vec<u8>>,
    ) {
        for (shard_name, content) in members.iter().filter(|(name, _)| self.is_common(name)) {
            match extract_ids(shard_name, content) {
                Ok(ids) => {
                    self.ids.register_common_ids(&run.run_id, &ids.local_ids);
                }
                Err(e) => tracing::warn!(
                    "Skipping common definitions of {} in run {}: {:#}",
                    shard_name,
                    run,
                    e
                ),
            }
        }
    }

    /// Ends a run that cannot be validated with a single error finding.
    async fn fail_run(&self, run: &ValidationRun, rule_code: &str, message: String) -> JobResult {
        let mut report = ValidationReport::new(&run.referential, &run.run_id);
        report.add(Finding::error(rule_code, message));
        self.finish_run(run, report).await?;
        Ok(())
    }
}

/// XML members of a zip archive keyed by file name. Directories are flattened:
/// only the last path segment names a shard.
pub fn extract_archive(archive: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    let mut members = BTreeMap::new();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }

        let shard_name = entry.name().rsplit('/').next().unwrap_or_default().to_string();
        if !shard_name.to_ascii_lowercase().ends_with(".xml") {
            tracing::debug!("Skipping non-XML archive entry {}", entry.name());
            continue;
        }

        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        if members.insert(shard_name.clone(), content).is_some() {
            tracing::warn!("Archive contains {} more than once, keeping the last", shard_name);
        }
    }

    Ok(members)
}
