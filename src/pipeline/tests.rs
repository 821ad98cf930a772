//! Pipeline Tests
//!
//! ## Test Scopes
//! - **End to end**: whole runs through the worker pool over the in-memory queue.
//! - **Failure paths**: missing archive, schema errors, crashing validators.
//! - **Redelivery**: repeated submit, shard validation and completion jobs.
//! - **Dataset stage**: shard reports missing after a barrier timeout.

#[cfg(test)]
mod tests {
    use crate::config::{ClusterConfig, ProfileSettings};
    use crate::dispatch::types::{JobType, ShardJob, ValidationRun};
    use crate::error::JobError;
    use crate::pipeline::context::Pipeline;
    use crate::pipeline::routes::dispatcher_for;
    use crate::pipeline::splitter::extract_archive;
    use crate::pipeline::status::RunState;
    use crate::pipeline::validators::{ShardContext, ShardValidator, ValidatorRegistry};
    use crate::queue::executor::JobExecutor;
    use crate::queue::types::Topic;
    use crate::references::registry::StopPlaceSnapshot;
    use crate::report::types::{Finding, Severity, ValidationReport, rules};
    use crate::storage::blob::{BlobStore, MemoryBlobStore, paths};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    // ============================================================
    // FIXTURES
    // ============================================================

    const COMMON_ORGANISATIONS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PublicationDelivery version="1.15">
  <dataObjects>
    <CompositeFrame id="RUT:CompositeFrame:1" version="1">
      <frames>
        <ResourceFrame id="RUT:ResourceFrame:1" version="1">
          <organisations>
            <Authority id="RUT:Authority:1" version="1"><Name>Ruter</Name></Authority>
            <Operator id="RUT:Operator:1" version="1"><Name>Ruter Drift</Name></Operator>
          </organisations>
        </ResourceFrame>
      </frames>
    </CompositeFrame>
  </dataObjects>
</PublicationDelivery>
"#;

    const COMMON_NETWORK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PublicationDelivery version="1.15">
  <dataObjects>
    <CompositeFrame id="RUT:CompositeFrame:1" version="1">
      <frames>
        <ServiceFrame id="RUT:ServiceFrame:shared" version="1">
          <Network id="RUT:Network:1" version="1"><Name>Oslo</Name></Network>
          <scheduledStopPoints>
            <ScheduledStopPoint id="RUT:ScheduledStopPoint:1" version="1"/>
          </scheduledStopPoints>
          <stopAssignments>
            <PassengerStopAssignment id="RUT:PassengerStopAssignment:1" version="1" order="1">
              <ScheduledStopPointRef ref="RUT:ScheduledStopPoint:1" version="1"/>
              <StopPlaceRef ref="NSR:StopPlace:1"/>
              <QuayRef ref="NSR:Quay:1"/>
            </PassengerStopAssignment>
          </stopAssignments>
        </ServiceFrame>
      </frames>
    </CompositeFrame>
  </dataObjects>
</PublicationDelivery>
"#;

    /// A common file that points into both other common files.
    const COMMON_FLEXIBLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PublicationDelivery version="1.15">
  <dataObjects>
    <CompositeFrame id="RUT:CompositeFrame:1" version="1">
      <frames>
        <ServiceFrame id="RUT:ServiceFrame:flexible" version="1">
          <lines>
            <FlexibleLine id="RUT:FlexibleLine:1" version="1">
              <AuthorityRef ref="RUT:Authority:1" version="1"/>
              <RepresentedByGroupRef ref="RUT:Network:1"/>
            </FlexibleLine>
          </lines>
        </ServiceFrame>
      </frames>
    </CompositeFrame>
  </dataObjects>
</PublicationDelivery>
"#;

    /// A line file defining `RUT:Line:{line}` and referencing the common files.
    fn line_file(file: usize, line: usize) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<PublicationDelivery version="1.15">
  <dataObjects>
    <CompositeFrame id="RUT:CompositeFrame:1" version="1">
      <frames>
        <ServiceFrame id="RUT:ServiceFrame:{file}" version="1">
          <lines>
            <Line id="RUT:Line:{line}" version="1">
              <RepresentedByGroupRef ref="RUT:Network:1"/>
              <OperatorRef ref="RUT:Operator:1" version="1"/>
            </Line>
          </lines>
          <routes>
            <Route id="RUT:Route:{file}" version="1">
              <LineRef ref="RUT:Line:{line}" version="1"/>
            </Route>
          </routes>
        </ServiceFrame>
        <TimetableFrame id="RUT:TimetableFrame:{file}" version="1">
          <vehicleJourneys>
            <ServiceJourney id="RUT:ServiceJourney:{file}" version="1">
              <VehicleTypeRef ref="NRS:VehicleType:1"/>
              <LineRef ref="RUT:Line:{line}" version="1"/>
            </ServiceJourney>
          </vehicleJourneys>
        </TimetableFrame>
      </frames>
    </CompositeFrame>
  </dataObjects>
</PublicationDelivery>
"#
        )
    }

    fn archive(files: &[(&str, String)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn standard_archive() -> Vec<u8> {
        archive(&[
            ("_RUT_shared_organisations.xml", COMMON_ORGANISATIONS.to_string()),
            ("_RUT_shared_network.xml", COMMON_NETWORK.to_string()),
            ("RUT_line_1.xml", line_file(1, 1)),
            ("RUT_line_2.xml", line_file(2, 2)),
            ("RUT_line_3.xml", line_file(3, 3)),
        ])
    }

    fn test_config() -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.queue.workers_per_topic = 2;
        config.queue.poll_interval_ms = 5;
        config.queue.lease_renew_secs = 1;
        config.storage.lock_wait_secs = 5;
        config
    }

    struct Exploding;

    #[async_trait::async_trait]
    impl ShardValidator for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn validate(&self, _shard: &ShardContext<'_>) -> anyhow::Result<Vec<Finding>> {
            Err(anyhow::anyhow!("validator crashed"))
        }
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        executor: Arc<JobExecutor>,
    }

    impl Harness {
        fn new(config: ClusterConfig, validators: ValidatorRegistry) -> Self {
            let pipeline =
                Pipeline::new(config, Arc::new(MemoryBlobStore::new()), validators).unwrap();
            pipeline.registry.replace(StopPlaceSnapshot {
                stop_places: ["NSR:StopPlace:1".to_string()].into_iter().collect(),
                quays: ["NSR:Quay:1".to_string()].into_iter().collect(),
            });

            let executor = JobExecutor::new(
                pipeline.queue.clone(),
                dispatcher_for(&pipeline),
                pipeline.config.queue.workers_per_topic,
                pipeline.config.queue.lease_renewal(),
                pipeline.config.queue.poll_interval(),
            );
            Self { pipeline, executor }
        }

        fn standard() -> Self {
            Self::new(test_config(), ValidatorRegistry::builtin())
        }

        fn statuses(&self) -> Vec<String> {
            self.pipeline
                .queue
                .messages(Topic::StatusNotification)
                .iter()
                .filter_map(|envelope| envelope.header("status").map(str::to_string))
                .collect()
        }

        /// Submits, drives the worker pool until the run is finished, returns the
        /// run and its final report.
        async fn run(&self, profile: &str, archive: Vec<u8>) -> (ValidationRun, ValidationReport) {
            let run = self
                .pipeline
                .accept_submission("RUT", Some(profile), archive)
                .await
                .unwrap();
            self.executor.start();

            for _ in 0..1000 {
                let finished = self
                    .statuses()
                    .iter()
                    .any(|status| status == "ok" || status == "failed");
                if finished && self.pipeline.queue.is_idle() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.executor.shutdown();

            let report = self
                .pipeline
                .load_report(&paths::final_report(&run.referential, &run.run_id))
                .await
                .unwrap()
                .expect("final report stored");
            (run, report)
        }
    }

    fn errors(report: &ValidationReport) -> Vec<&Finding> {
        report
            .entries
            .iter()
            .filter(|entry| entry.severity == Severity::Error)
            .collect()
    }

    // ============================================================
    // END TO END
    // ============================================================

    #[tokio::test]
    async fn test_clean_dataset_completes_ok() {
        // ARRANGE
        let harness = Harness::standard();

        // ACT
        let (run, report) = harness.run("full", standard_archive()).await;

        // ASSERT: one started, then exactly one ok
        assert_eq!(harness.statuses(), vec!["started", "ok"]);
        assert!(errors(&report).is_empty(), "unexpected errors: {:?}", errors(&report));
        assert_eq!(report.run_id, run.run_id);
        assert!(report.creation_date.is_some());

        let pipeline = &harness.pipeline;
        assert_eq!(
            pipeline.run_state("RUT", &run.run_id).await.unwrap(),
            Some(RunState::Ok)
        );
        assert!(
            pipeline
                .blobs
                .list(&paths::work_dir("RUT", &run.run_id))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(pipeline.ids.accumulated_ids(&run.run_id).is_empty());
        assert!(pipeline.barrier.is_terminated(&run.run_id));
        assert!(pipeline.queue.dead_letters(Topic::ValidateShardJob).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_across_line_files_fail_the_run() {
        let harness = Harness::standard();
        let dataset = archive(&[
            ("_RUT_shared_organisations.xml", COMMON_ORGANISATIONS.to_string()),
            ("_RUT_shared_network.xml", COMMON_NETWORK.to_string()),
            ("RUT_line_1.xml", line_file(1, 7)),
            ("RUT_line_2.xml", line_file(2, 7)),
        ]);

        let (_, report) = harness.run("no-schema", dataset).await;

        assert_eq!(harness.statuses(), vec!["started", "failed"]);
        let duplicates: Vec<&Finding> = report
            .entries
            .iter()
            .filter(|entry| entry.rule_code == rules::DUPLICATE_ID)
            .collect();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].location.element_id.as_deref(), Some("RUT:Line:7"));
        // Frames repeat in every file without being flagged.
        assert_eq!(errors(&report).len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_reported_with_location() {
        let harness = Harness::standard();
        let dataset = archive(&[
            ("_RUT_shared_network.xml", COMMON_NETWORK.to_string()),
            ("RUT_line_1.xml", line_file(1, 1)),
        ]);

        let (_, report) = harness.run("full", dataset).await;

        // The operator lives in the organisations file, which is absent.
        let unresolved: Vec<&Finding> = report
            .entries
            .iter()
            .filter(|entry| entry.rule_code == rules::UNRESOLVED_REFERENCE)
            .collect();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].location.file_name.as_deref(), Some("RUT_line_1.xml"));
        assert_eq!(unresolved[0].location.element_id.as_deref(), Some("RUT:Operator:1"));
        assert_eq!(harness.statuses(), vec!["started", "failed"]);
    }

    #[tokio::test]
    async fn test_common_files_may_reference_each_other() {
        // ARRANGE: the flexible file sorts first and refers to definitions in
        // both files that are validated after it
        let harness = Harness::standard();
        let dataset = archive(&[
            ("_RUT_flexible_shared.xml", COMMON_FLEXIBLE.to_string()),
            ("_RUT_shared_organisations.xml", COMMON_ORGANISATIONS.to_string()),
            ("_RUT_shared_network.xml", COMMON_NETWORK.to_string()),
            ("RUT_line_1.xml", line_file(1, 1)),
        ]);

        // ACT
        let (run, report) = harness.run("no-schema", dataset).await;

        // ASSERT
        let cross_common: Vec<&Finding> = report
            .entries
            .iter()
            .filter(|entry| {
                matches!(
                    entry.location.element_id.as_deref(),
                    Some("RUT:Authority:1") | Some("RUT:Network:1")
                )
            })
            .collect();
        assert!(cross_common.is_empty(), "unexpected findings: {:?}", cross_common);
        assert!(errors(&report).is_empty(), "unexpected errors: {:?}", errors(&report));
        assert_eq!(harness.statuses(), vec!["started", "ok"]);
        assert!(harness.pipeline.ids.get_common_ids(&run.run_id).is_empty());
    }

    // ============================================================
    // FAILURE PATHS
    // ============================================================

    #[tokio::test]
    async fn test_missing_archive_fails_without_emitting_jobs() {
        // ARRANGE: a run whose archive was never stored
        let harness = Harness::standard();
        let run = ValidationRun::new("RUT", "full");

        // ACT
        harness
            .pipeline
            .split(ShardJob::new(JobType::Split, &run))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(harness.statuses(), vec!["failed"]);
        assert!(harness.pipeline.queue.is_idle());

        let report = harness
            .pipeline
            .load_report(&paths::final_report("RUT", &run.run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].rule_code, rules::DATASET_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_errors_stop_before_shard_validation() {
        let harness = Harness::standard();
        let dataset = archive(&[
            ("RUT_line_1.xml", line_file(1, 1)),
            ("RUT_line_2.xml", "<PublicationDelivery><Line></PublicationDelivery>".to_string()),
        ]);

        let (_, report) = harness.run("full", dataset).await;

        assert_eq!(harness.statuses(), vec!["started", "failed"]);
        assert!(!report.entries.is_empty());
        assert!(
            report
                .entries
                .iter()
                .all(|entry| entry.rule_code == rules::MALFORMED_XML)
        );
        assert_eq!(
            report.entries[0].location.file_name.as_deref(),
            Some("RUT_line_2.xml")
        );
    }

    #[tokio::test]
    async fn test_crashing_validator_becomes_system_error() {
        // ARRANGE
        let mut config = test_config();
        config.profiles.push(ProfileSettings {
            name: "exploding".to_string(),
            schema_validation: false,
            schema_validators: Vec::new(),
            rule_validators: vec!["exploding".to_string()],
            dataset_validators: vec!["missing-shard-reports".to_string()],
        });
        let validators = ValidatorRegistry::builtin().with_shard_validator(Arc::new(Exploding));
        let harness = Harness::new(config, validators);

        // ACT
        let (_, report) = harness.run("exploding", standard_archive()).await;

        // ASSERT: one finding per shard, the run still completes
        let system_errors = report
            .entries
            .iter()
            .filter(|entry| entry.rule_code == rules::SYSTEM_ERROR)
            .count();
        assert_eq!(system_errors, 5);
        assert_eq!(harness.statuses(), vec!["started", "failed"]);
    }

    #[tokio::test]
    async fn test_unknown_validator_in_profile_is_rejected() {
        let mut config = test_config();
        config.profiles[0].rule_validators.push("does-not-exist".to_string());

        let result = Pipeline::new(
            config,
            Arc::new(MemoryBlobStore::new()),
            ValidatorRegistry::builtin(),
        );

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_profile_is_rejected_at_submission() {
        let harness = Harness::standard();

        let result = harness
            .pipeline
            .accept_submission("RUT", Some("nope"), standard_archive())
            .await;

        assert!(result.is_err());
        assert!(harness.pipeline.queue.is_idle());
    }

    // ============================================================
    // REDELIVERY
    // ============================================================

    #[tokio::test]
    async fn test_redelivered_submit_announces_once() {
        let harness = Harness::standard();
        let run = ValidationRun::new("RUT", "full");
        let submit = ShardJob::new(JobType::Submit, &run);

        harness.pipeline.submit(submit.clone()).await.unwrap();
        harness.pipeline.submit(submit).await.unwrap();

        assert_eq!(harness.statuses(), vec!["started"]);
        assert_eq!(harness.pipeline.queue.messages(Topic::SplitJob).len(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_shard_validation_only_resignals() {
        // ARRANGE: one recorded shard, validated once
        let harness = Harness::standard();
        let pipeline = &harness.pipeline;
        let run = ValidationRun::new("RUT", "no-schema");
        let shard = "RUT_line_1.xml";
        pipeline
            .blobs
            .put(&paths::shard("RUT", &run.run_id, shard), line_file(1, 1).into_bytes())
            .await
            .unwrap();
        pipeline.record_shards(&run, &[shard.to_string()]);
        let job = ShardJob::new(JobType::ValidateShard, &run)
            .with_shard(shard)
            .with_total_shards(2);

        pipeline.validate_shard(job.clone()).await.unwrap();
        let report_path = paths::shard_report("RUT", &run.run_id, shard);
        let first = pipeline.blobs.get(&report_path).await.unwrap().unwrap();

        // ACT
        pipeline.validate_shard(job).await.unwrap();

        // ASSERT
        let second = pipeline.blobs.get(&report_path).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(pipeline.queue.messages(Topic::AggregateReports).len(), 2);
        assert_eq!(pipeline.ids.accumulated_ids(&run.run_id).len(), 3);
    }

    #[tokio::test]
    async fn test_missing_shard_blob_is_not_found() {
        let harness = Harness::standard();
        let run = ValidationRun::new("RUT", "no-schema");
        let job = ShardJob::new(JobType::ValidateShard, &run)
            .with_shard("gone.xml")
            .with_total_shards(1);

        let result = harness.pipeline.validate_shard(job).await;

        assert!(matches!(result, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_redelivered_completion_keeps_report_and_status() {
        // ARRANGE
        let harness = Harness::standard();
        let (run, report) = harness.run("full", standard_archive()).await;

        // ACT: the completion job arrives again after the run was purged
        harness
            .pipeline
            .complete_validation(ShardJob::new(JobType::CompleteValidation, &run))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(harness.statuses(), vec!["started", "ok"]);
        let stored = harness
            .pipeline
            .load_report(&paths::final_report("RUT", &run.run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, report);

        let late = ShardJob::new(JobType::ValidateShard, &run)
            .with_shard("RUT_line_1.xml")
            .with_total_shards(5);
        assert!(matches!(
            harness.pipeline.validate_shard(late).await,
            Err(JobError::NotFound(_))
        ));
    }

    // ============================================================
    // DATASET STAGE
    // ============================================================

    #[tokio::test]
    async fn test_timed_out_reports_barrier_flags_missing_shards() {
        // ARRANGE: two shards, only one report stored
        let harness = Harness::standard();
        let pipeline = &harness.pipeline;
        let run = ValidationRun::new("RUT", "full");
        pipeline.record_shards(&run, &["a.xml".to_string(), "b.xml".to_string()]);
        let mut shard_report = ValidationReport::new("RUT", &run.run_id);
        shard_report.add(Finding::warning(rules::MISSING_VERSION, "minor"));
        pipeline
            .store_report(&paths::shard_report("RUT", &run.run_id, "a.xml"), &shard_report)
            .await
            .unwrap();

        // ACT
        pipeline
            .validate_dataset(
                ShardJob::new(JobType::ValidateDataset, &run)
                    .with_total_shards(2)
                    .with_timed_out(true),
            )
            .await
            .unwrap();

        // ASSERT
        let dataset = pipeline
            .load_report(&paths::dataset_report("RUT", &run.run_id))
            .await
            .unwrap()
            .unwrap();
        let missing: Vec<&Finding> = dataset
            .entries
            .iter()
            .filter(|entry| entry.rule_code == rules::MISSING_SHARD_REPORT)
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].location.file_name.as_deref(), Some("b.xml"));
        assert_eq!(dataset.count_for(rules::MISSING_VERSION), 1);
        assert_eq!(dataset.creation_date, shard_report.creation_date);

        let next = pipeline.queue.messages(Topic::ValidateShardJob);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].header("jobType"), Some("completeValidation"));
    }

    #[test]
    fn test_extract_archive_flattens_and_skips_non_xml() {
        let dataset = archive(&[
            ("nested/dir/RUT_line_1.xml", line_file(1, 1)),
            ("README.txt", "not a shard".to_string()),
            ("_RUT_shared_network.XML", COMMON_NETWORK.to_string()),
        ]);

        let members = extract_archive(&dataset).unwrap();

        let names: Vec<&String> = members.keys().collect();
        assert_eq!(names, vec!["RUT_line_1.xml", "_RUT_shared_network.XML"]);
    }

    #[test]
    fn test_extract_archive_rejects_garbage() {
        assert!(extract_archive(b"definitely not a zip").is_err());
    }
}
