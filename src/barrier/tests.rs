//! Barrier Aggregator Tests
//!
//! ## Test Scopes
//! - **Completion**: distinct-shard counting, single downstream emission.
//! - **Payloads**: last write wins per shard, merge functions.
//! - **Timeout and termination**: forced completion, dropped late signals, cleanup.

#[cfg(test)]
mod tests {
    use crate::barrier::aggregator::*;
    use crate::dispatch::types::{HEADER_TIMED_OUT, JobType, ShardJob, ValidationRun};
    use crate::queue::queue::MessageQueue;
    use crate::queue::types::{Envelope, Topic};
    use crate::storage::accumulator::AccumulatorStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn run() -> ValidationRun {
        ValidationRun {
            run_id: "run-1".to_string(),
            referential: "RUT".to_string(),
            profile: "full".to_string(),
        }
    }

    fn setup(timeout: Duration) -> (Arc<BarrierAggregator>, Arc<MessageQueue>, Arc<AccumulatorStore>) {
        let store = Arc::new(AccumulatorStore::new());
        let queue = Arc::new(MessageQueue::new(Duration::from_secs(30), 3));
        let aggregator = Arc::new(
            BarrierAggregator::new(store.clone(), queue.clone(), timeout)
                .with_merge(BarrierStage::SchemaValidation, collect_errors),
        );
        (aggregator, queue, store)
    }

    fn signal(stage: BarrierStage, shard: &str, total: usize) -> ShardJob {
        ShardJob::new(stage.signal(), &run())
            .with_shard(shard)
            .with_total_shards(total)
    }

    fn downstream(queue: &MessageQueue, job_type: JobType) -> Vec<Envelope> {
        queue
            .messages(Topic::ValidateShardJob)
            .into_iter()
            .filter(|envelope| envelope.header("jobType") == Some(job_type.as_str()))
            .collect()
    }

    // ============================================================
    // COMPLETION
    // ============================================================

    #[tokio::test]
    async fn test_completes_on_distinct_shard_count_only() {
        // ARRANGE
        let (aggregator, queue, _) = setup(Duration::from_secs(60));

        // ACT: five deliveries, two distinct shards
        for shard in ["a", "b", "a", "b", "a"] {
            let outcome = aggregator.signal(&signal(BarrierStage::Reports, shard, 3)).unwrap();
            assert!(matches!(outcome, SignalOutcome::Waiting { target: 3, .. }));
        }

        // ASSERT: nothing emitted yet
        assert_eq!(aggregator.received("run-1", BarrierStage::Reports), 2);
        assert!(downstream(&queue, JobType::ValidateDataset).is_empty());

        // ACT: third distinct shard, then more redeliveries
        let third = aggregator.signal(&signal(BarrierStage::Reports, "c", 3)).unwrap();
        let late = aggregator.signal(&signal(BarrierStage::Reports, "a", 3)).unwrap();

        // ASSERT: exactly one downstream event
        assert_eq!(third, SignalOutcome::Completed);
        assert_eq!(late, SignalOutcome::AlreadyComplete);
        let emitted = downstream(&queue, JobType::ValidateDataset);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].header("totalShards"), Some("3"));
        assert_eq!(emitted[0].header(HEADER_TIMED_OUT), None);
        assert_eq!(emitted[0].body, json!({"shards": ["a", "b", "c"]}));
        assert_eq!(aggregator.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_signals_complete_once() {
        let (aggregator, queue, _) = setup(Duration::from_secs(60));
        let mut handles = Vec::new();

        for i in 0..16 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                let shard = format!("shard-{:02}", i % 8);
                aggregator
                    .signal(&signal(BarrierStage::CommonFiles, &shard, 8))
                    .unwrap()
            }));
        }
        let mut completed = 0;
        for handle in handles {
            if handle.await.unwrap() == SignalOutcome::Completed {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(downstream(&queue, JobType::ScheduleLineFiles).len(), 1);
        assert!(aggregator.is_complete("run-1", BarrierStage::CommonFiles));
    }

    #[tokio::test]
    async fn test_stages_are_independent() {
        let (aggregator, queue, _) = setup(Duration::from_secs(60));

        aggregator.signal(&signal(BarrierStage::CommonFiles, "_common.xml", 1)).unwrap();
        aggregator.signal(&signal(BarrierStage::Reports, "_common.xml", 2)).unwrap();

        assert_eq!(downstream(&queue, JobType::ScheduleLineFiles).len(), 1);
        assert!(downstream(&queue, JobType::ValidateDataset).is_empty());
    }

    #[tokio::test]
    async fn test_signal_without_total_shards_is_fatal() {
        let (aggregator, _, _) = setup(Duration::from_secs(60));
        let job = ShardJob::new(JobType::AggregateReports, &run()).with_shard("a");

        let result = aggregator.signal(&job);

        assert!(matches!(result, Err(crate::error::JobError::Fatal(_))));
    }

    // ============================================================
    // PAYLOADS
    // ============================================================

    #[tokio::test]
    async fn test_redelivered_payload_replaces_previous() {
        let (aggregator, queue, _) = setup(Duration::from_secs(60));

        let failing = signal(BarrierStage::SchemaValidation, "a", 2).with_body(json!({"hasError": true}));
        let passing = signal(BarrierStage::SchemaValidation, "a", 2).with_body(json!({"hasError": false}));
        aggregator.signal(&failing).unwrap();
        aggregator.signal(&passing).unwrap();
        aggregator
            .signal(&signal(BarrierStage::SchemaValidation, "b", 2).with_body(json!({"hasError": false})))
            .unwrap();

        let emitted = downstream(&queue, JobType::ScheduleValidation);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].body["hasError"], json!(false));
        assert_eq!(emitted[0].body["shards"], json!(["a", "b"]));
    }

    #[test]
    fn test_collect_errors_is_sticky() {
        let merged = collect_errors(serde_json::Value::Null, "a", &json!({"hasError": true}));
        let merged = collect_errors(merged, "b", &json!({"hasError": false}));

        assert_eq!(merged, json!({"shards": ["a", "b"], "hasError": true}));
    }

    // ============================================================
    // TIMEOUT AND TERMINATION
    // ============================================================

    #[tokio::test]
    async fn test_timeout_forces_completion_with_partial_members() {
        // ARRANGE
        let (aggregator, queue, _) = setup(Duration::from_millis(50));
        aggregator.signal(&signal(BarrierStage::Reports, "a", 3)).unwrap();
        assert_eq!(aggregator.pending_timers(), 1);

        // ACT
        tokio::time::sleep(Duration::from_millis(200)).await;

        // ASSERT
        let emitted = downstream(&queue, JobType::ValidateDataset);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].header(HEADER_TIMED_OUT), Some("true"));
        assert_eq!(emitted[0].body, json!({"shards": ["a"]}));
        assert_eq!(aggregator.pending_timers(), 0);

        let late = aggregator.signal(&signal(BarrierStage::Reports, "b", 3)).unwrap();
        assert_eq!(late, SignalOutcome::AlreadyComplete);
        assert_eq!(downstream(&queue, JobType::ValidateDataset).len(), 1);
    }

    #[tokio::test]
    async fn test_terminated_run_drops_signals() {
        let (aggregator, queue, _) = setup(Duration::from_secs(60));
        aggregator.terminate("run-1", Duration::from_secs(60));

        let outcome = aggregator.signal(&signal(BarrierStage::Reports, "a", 1)).unwrap();

        assert_eq!(outcome, SignalOutcome::RunTerminated);
        assert!(downstream(&queue, JobType::ValidateDataset).is_empty());
    }

    #[tokio::test]
    async fn test_no_timer_is_armed_after_completion() {
        // ARRANGE: a slow signal reaches the timer only after the barrier completed
        let (aggregator, queue, _) = setup(Duration::from_millis(50));
        aggregator.signal(&signal(BarrierStage::Reports, "a", 1)).unwrap();
        assert!(aggregator.is_complete("run-1", BarrierStage::Reports));

        // ACT
        aggregator.arm_timer(BarrierStage::Reports, &run(), 2);

        // ASSERT
        assert_eq!(aggregator.pending_timers(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(downstream(&queue, JobType::ValidateDataset).len(), 1);
    }

    #[tokio::test]
    async fn test_expired_tombstone_is_evicted() {
        // ARRANGE
        let (aggregator, _, store) = setup(Duration::from_secs(60));
        aggregator.terminate("run-1", Duration::from_millis(20));
        assert!(aggregator.is_terminated("run-1"));
        assert_eq!(store.key_count(), 1);

        // ACT
        tokio::time::sleep(Duration::from_millis(40)).await;
        let evicted = store.evict_expired();

        // ASSERT
        assert_eq!(evicted, 1);
        assert_eq!(store.key_count(), 0);
        assert!(!aggregator.is_terminated("run-1"));
    }

    #[tokio::test]
    async fn test_clear_removes_state_and_timers() {
        let (aggregator, _, store) = setup(Duration::from_secs(60));
        aggregator.signal(&signal(BarrierStage::Reports, "a", 3)).unwrap();
        aggregator.signal(&signal(BarrierStage::CommonFiles, "_c.xml", 1)).unwrap();

        let removed = aggregator.clear("run-1");

        assert_eq!(removed, 3);
        assert_eq!(aggregator.pending_timers(), 0);
        assert_eq!(aggregator.received("run-1", BarrierStage::Reports), 0);
        assert_eq!(store.key_count(), 0);
    }
}
