//! Stage Handlers
//!
//! Schema validation, shard validation, the barrier follow-ups, dataset validation
//! and completion. Every handler checks first whether its work is already done, so a
//! redelivered job repeats only the cheap parts (re-signalling a barrier, re-publishing
//! a follow-up) and never produces a different result.

use super::context::Pipeline;
use super::validators::{DatasetContext, ShardContext, ShardValidator};
use crate::dispatch::types::{JobType, ShardJob, ValidationRun};
use crate::error::{JobError, JobResult};
use crate::ids::extract::extract_ids;
use crate::ids::types::ShardIds;
use crate::report::merger::{merge, truncate};
use crate::report::types::{Finding, Location, ValidationReport, rules};
use crate::storage::blob::paths;

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;

impl Pipeline {
    // --- Schema stage ---

    pub async fn validate_schema(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        let shard_name = job.require_shard()?;
        let total = job.require_total_shards()?;
        let profile = self.profile(run)?;
        let validators = self
            .validators
            .shard_validators(&profile.schema_validators)
            .map_err(|e| JobError::fatal(e.to_string()))?;

        let content = self.download_shard(run, shard_name).await?;
        let ids = ShardIds::default();
        let shard = ShardContext {
            run,
            shard_name,
            content: &content,
            ids: &ids,
            common: self.is_common(shard_name),
        };

        let mut report = ValidationReport::new(&run.referential, &run.run_id);
        report.add_all(run_shard_validators(&validators, &shard).await);
        truncate(&mut report, self.config.validation.max_entries_per_rule);
        self.store_report(
            &paths::schema_report(&run.referential, &run.run_id, shard_name),
            &report,
        )
        .await?;

        tracing::debug!(
            "Schema-validated {} of run {}: {} entries",
            shard_name,
            run,
            report.entries.len()
        );
        self.publish(
            ShardJob::new(JobType::AggregateSchema, run)
                .with_shard(shard_name)
                .with_total_shards(total)
                .with_body(json!({ "hasError": report.has_error() })),
        )
    }

    /// Schema barrier follow-up: stop the run on schema errors, otherwise start
    /// shard validation.
    pub async fn schedule_validation(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        if job.timed_out {
            tracing::warn!("Schema stage of run {} timed out, continuing", run);
        }

        let has_error = job
            .body
            .get("hasError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !has_error {
            return self.schedule_shard_validation(run);
        }

        let (shards, _) = self.run_shards(&run.run_id);
        let mut reports = Vec::with_capacity(shards.len());
        for shard_name in &shards {
            let path = paths::schema_report(&run.referential, &run.run_id, shard_name);
            if let Some(report) = self.load_report(&path).await? {
                reports.push(report);
            }
        }

        let merged = merge(&run.referential, &run.run_id, reports);
        self.store_report(
            &paths::dataset_report(&run.referential, &run.run_id),
            &merged,
        )
        .await?;

        tracing::info!(
            "Run {} failed schema validation, skipping shard validation",
            run
        );
        self.publish(ShardJob::new(JobType::CompleteValidation, run))
    }

    // --- Shard stage ---

    /// Ids, duplicates, references and rule validators for one shard, then the
    /// barrier signals. A shard whose report is already stored is only re-signalled.
    pub async fn validate_shard(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        let shard_name = job.require_shard()?;
        let total = job.require_total_shards()?;
        let common = job
            .body
            .get("common")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| self.is_common(shard_name));
        let common_total = job
            .body
            .get("commonShards")
            .and_then(Value::as_u64)
            .map(|count| count as usize);

        let report_path = paths::shard_report(&run.referential, &run.run_id, shard_name);
        if self.blobs.exists(&report_path).await? {
            tracing::info!(
                "Shard {} of run {} already validated, signalling again",
                shard_name,
                run
            );
            return self.signal_shard_done(run, shard_name, total, common, common_total);
        }

        let content = self.download_shard(run, shard_name).await?;
        let profile = self.profile(run)?;
        let validators = self
            .validators
            .shard_validators(&profile.rule_validators)
            .map_err(|e| JobError::fatal(e.to_string()))?;

        let mut report = ValidationReport::new(&run.referential, &run.run_id);

        let ids = match extract_ids(shard_name, &content) {
            Ok(ids) => ids,
            Err(e) => {
                report.add(
                    Finding::error(
                        rules::MALFORMED_XML,
                        format!("Could not read ids from {}: {:#}", shard_name, e),
                    )
                    .at(Location::in_file(shard_name)),
                );
                ShardIds::default()
            }
        };

        let duplicates = self
            .ids
            .check_and_register_duplicates(&run.run_id, shard_name, &ids.local_ids)
            .await?;
        report.add_all(duplicate_findings(shard_name, &ids, &duplicates));

        let common_ids = self.ids.get_common_ids(&run.run_id);
        report.add_all(self.resolvers.findings(&ids, &common_ids));

        let shard = ShardContext {
            run,
            shard_name,
            content: &content,
            ids: &ids,
            common,
        };
        report.add_all(run_shard_validators(&validators, &shard).await);

        truncate(&mut report, self.config.validation.max_entries_per_rule);
        self.store_report(&report_path, &report).await?;

        tracing::info!(
            "Validated shard {} of run {}: {} entries{}",
            shard_name,
            run,
            report.entries.len(),
            if report.has_error() { ", has errors" } else { "" }
        );
        self.signal_shard_done(run, shard_name, total, common, common_total)
    }

    /// Common-files barrier follow-up: validate the line files.
    pub async fn schedule_line_files(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        if job.timed_out {
            tracing::warn!("Common files of run {} timed out, validating line files anyway", run);
        }

        let (all, common) = self.run_shards(&run.run_id);
        let total = all.len();
        let line_files: Vec<&String> = all.iter().filter(|shard| !common.contains(*shard)).collect();

        for shard_name in &line_files {
            self.publish(
                ShardJob::new(JobType::ValidateShard, run)
                    .with_shard(shard_name)
                    .with_total_shards(total)
                    .with_body(json!({ "common": false, "commonShards": common.len() })),
            )?;
        }

        tracing::info!("Scheduled {} line files of run {}", line_files.len(), run);
        Ok(())
    }

    /// Forwards a barrier signal to the aggregator.
    pub async fn aggregate(&self, job: ShardJob) -> JobResult {
        let outcome = self.barrier.signal(&job)?;
        tracing::trace!("{} for run {}: {:?}", job.job_type, job.run, outcome);
        Ok(())
    }

    fn signal_shard_done(
        &self,
        run: &ValidationRun,
        shard_name: &str,
        total: usize,
        common: bool,
        common_total: Option<usize>,
    ) -> JobResult {
        self.publish(
            ShardJob::new(JobType::AggregateReports, run)
                .with_shard(shard_name)
                .with_total_shards(total),
        )?;

        if common {
            let common_total = common_total.unwrap_or_else(|| self.run_shards(&run.run_id).1.len());
            self.publish(
                ShardJob::new(JobType::AggregateCommonFiles, run)
                    .with_shard(shard_name)
                    .with_total_shards(common_total),
            )?;
        }
        Ok(())
    }

    // --- Dataset stage ---

    /// Reports barrier follow-up: merge shard reports in shard-name order and run the
    /// dataset validators.
    pub async fn validate_dataset(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        self.ensure_active(run)?;
        let profile = self.profile(run)?;
        let validators = self
            .validators
            .dataset_validators(&profile.dataset_validators)
            .map_err(|e| JobError::fatal(e.to_string()))?;

        let (expected, _) = self.run_shards(&run.run_id);
        let mut reports = Vec::with_capacity(expected.len());
        let mut reported = Vec::with_capacity(expected.len());
        for shard_name in &expected {
            let path = paths::shard_report(&run.referential, &run.run_id, shard_name);
            if let Some(report) = self.load_report(&path).await? {
                reported.push(shard_name.clone());
                reports.push(report);
            }
        }

        let mut merged = merge(&run.referential, &run.run_id, reports);
        if merged.creation_date.is_none() {
            merged.creation_date = Some(Utc::now());
        }

        let dataset = DatasetContext {
            run,
            expected_shards: &expected,
            reported_shards: &reported,
            timed_out: job.timed_out,
            report: &merged,
        };
        let mut findings = Vec::new();
        for validator in &validators {
            match validator.validate(&dataset).await {
                Ok(found) => findings.extend(found),
                Err(e) => {
                    tracing::error!(
                        "Dataset validator {} failed for run {}: {:#}",
                        validator.name(),
                        run,
                        e
                    );
                    findings.push(system_error(validator.name(), &e, None));
                }
            }
        }
        merged.add_all(findings);

        self.store_report(
            &paths::dataset_report(&run.referential, &run.run_id),
            &merged,
        )
        .await?;

        tracing::info!(
            "Merged {}/{} shard reports of run {}",
            reported.len(),
            expected.len(),
            run
        );
        self.publish(ShardJob::new(JobType::CompleteValidation, run))
    }

    // --- Completion ---

    pub async fn complete_validation(&self, job: ShardJob) -> JobResult {
        let run = &job.run;
        let dataset_path = paths::dataset_report(&run.referential, &run.run_id);
        let final_path = paths::final_report(&run.referential, &run.run_id);

        let report = match self.load_report(&dataset_path).await? {
            Some(report) => report,
            None => self
                .load_report(&final_path)
                .await?
                .ok_or_else(|| JobError::not_found(format!("report of run {}", run)))?,
        };

        self.finish_run(run, report).await?;
        Ok(())
    }

    pub async fn refresh_stop_place_cache(&self, _job: ShardJob) -> JobResult {
        self.refresh_stop_places().await?;
        Ok(())
    }
}

/// Runs every validator, turning a validator failure into a `SYSTEM_ERROR` finding.
async fn run_shard_validators(
    validators: &[Arc<dyn ShardValidator>],
    shard: &ShardContext<'_>,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for validator in validators {
        match validator.validate(shard).await {
            Ok(found) => findings.extend(found),
            Err(e) => {
                tracing::error!(
                    "Validator {} failed on {} of run {}: {:#}",
                    validator.name(),
                    shard.shard_name,
                    shard.run,
                    e
                );
                findings.push(system_error(validator.name(), &e, Some(shard.shard_name)));
            }
        }
    }
    findings
}

fn system_error(validator: &str, error: &anyhow::Error, shard_name: Option<&str>) -> Finding {
    let finding = Finding::error(
        rules::SYSTEM_ERROR,
        format!("Validator {} failed: {:#}", validator, error),
    );
    match shard_name {
        Some(shard_name) => finding.at(Location::in_file(shard_name)),
        None => finding,
    }
}

/// One error per duplicated id, located at its definition in this shard.
fn duplicate_findings(shard_name: &str, ids: &ShardIds, duplicates: &HashSet<String>) -> Vec<Finding> {
    let mut duplicates: Vec<&String> = duplicates.iter().collect();
    duplicates.sort();

    duplicates
        .into_iter()
        .map(|id| {
            let location = ids
                .local_ids
                .iter()
                .filter(|local| &local.id == id)
                .min_by_key(|local| (local.line, local.column))
                .map(|local| Location::at(shard_name, local.line, local.column, id))
                .unwrap_or_else(|| Location::in_file(shard_name));

            Finding::error(
                rules::DUPLICATE_ID,
                format!("Duplicate element identifier {}, already defined in another file", id),
            )
            .at(location)
        })
        .collect()
}
