//! Queue Module Tests
//!
//! ## Test Scopes
//! - **MessageQueue**: publication order, claim exclusivity, lease expiry and
//!   redelivery, delivery budget, dead-lettering.
//! - **JobExecutor**: settlement of each handler outcome and lease renewal while a
//!   handler is still running.

#[cfg(test)]
mod tests {
    use crate::dispatch::dispatcher::JobDispatcher;
    use crate::dispatch::types::{HEADER_SHARD_NAME, JobType, ShardJob, ValidationRun};
    use crate::error::JobError;
    use crate::queue::executor::JobExecutor;
    use crate::queue::queue::{MessageQueue, ReleaseOutcome};
    use crate::queue::types::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn envelope(shard: &str) -> Envelope {
        let run = ValidationRun {
            run_id: "run-1".to_string(),
            referential: "RUT".to_string(),
            profile: "full".to_string(),
        };
        ShardJob::new(JobType::ValidateShard, &run)
            .with_shard(shard)
            .to_envelope()
    }

    // ============================================================
    // MESSAGE QUEUE
    // ============================================================

    #[test]
    fn test_available_is_in_publication_order() {
        let queue = MessageQueue::new(Duration::from_secs(30), 3);

        for shard in ["a", "b", "c"] {
            queue.publish(Topic::ValidateShardJob, envelope(shard)).unwrap();
        }

        let shards: Vec<String> = queue
            .available(Topic::ValidateShardJob)
            .into_iter()
            .map(|(_, entry)| entry.envelope.header("shardName").unwrap().to_string())
            .collect();

        assert_eq!(shards, vec!["a", "b", "c"]);
        assert!(queue.available(Topic::SplitJob).is_empty());
    }

    #[test]
    fn test_claim_is_exclusive_while_leased() {
        let queue = MessageQueue::new(Duration::from_secs(30), 3);
        let id = queue.publish(Topic::ValidateShardJob, envelope("a")).unwrap();

        assert!(queue.try_claim(Topic::ValidateShardJob, &id).unwrap());
        assert!(!queue.try_claim(Topic::ValidateShardJob, &id).unwrap());
        assert!(queue.available(Topic::ValidateShardJob).is_empty());
        assert_eq!(queue.stats(Topic::ValidateShardJob).in_flight, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_makes_message_redeliverable() {
        let queue = MessageQueue::new(Duration::from_millis(20), 3);
        let id = queue.publish(Topic::ValidateShardJob, envelope("a")).unwrap();
        assert!(queue.try_claim(Topic::ValidateShardJob, &id).unwrap());

        // The worker "crashes": no ack, no renewal.
        tokio::time::sleep(Duration::from_millis(40)).await;

        let available = queue.available(Topic::ValidateShardJob);
        assert_eq!(available.len(), 1);
        assert!(queue.try_claim(Topic::ValidateShardJob, &id).unwrap());
        assert_eq!(queue.available(Topic::ValidateShardJob).len(), 0);
    }

    #[tokio::test]
    async fn test_renewed_lease_prevents_redelivery() {
        let queue = MessageQueue::new(Duration::from_millis(40), 3);
        let id = queue.publish(Topic::ValidateShardJob, envelope("a")).unwrap();
        queue.try_claim(Topic::ValidateShardJob, &id).unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.renew_lease(Topic::ValidateShardJob, &id).unwrap();
        }

        assert!(queue.available(Topic::ValidateShardJob).is_empty());
    }

    #[test]
    fn test_ack_removes_message() {
        let queue = MessageQueue::new(Duration::from_secs(30), 3);
        let id = queue.publish(Topic::ValidateShardJob, envelope("a")).unwrap();
        queue.try_claim(Topic::ValidateShardJob, &id).unwrap();

        queue.ack(Topic::ValidateShardJob, &id).unwrap();

        assert_eq!(queue.stats(Topic::ValidateShardJob), TopicStats::default());
        assert!(queue.renew_lease(Topic::ValidateShardJob, &id).is_err());
        assert!(queue.is_idle());
    }

    #[test]
    fn test_release_dead_letters_after_max_deliveries() {
        let queue = MessageQueue::new(Duration::from_secs(30), 2);
        let id = queue.publish(Topic::ValidateShardJob, envelope("a")).unwrap();

        queue.try_claim(Topic::ValidateShardJob, &id).unwrap();
        assert_eq!(
            queue.release(Topic::ValidateShardJob, &id, "boom").unwrap(),
            ReleaseOutcome::Requeued { deliveries: 1 }
        );

        queue.try_claim(Topic::ValidateShardJob, &id).unwrap();
        assert_eq!(
            queue.release(Topic::ValidateShardJob, &id, "boom").unwrap(),
            ReleaseOutcome::DeadLettered
        );

        assert!(queue.available(Topic::ValidateShardJob).is_empty());
        let dead = queue.dead_letters(Topic::ValidateShardJob);
        assert_eq!(dead.len(), 1);
        assert!(dead[0].1.contains("boom"));
    }

    // ============================================================
    // RETENTION
    // ============================================================

    #[test]
    fn test_undrained_topic_keeps_only_newest_messages() {
        // ARRANGE
        let queue = MessageQueue::new(Duration::from_secs(30), 3).with_retention(3);

        // ACT
        for i in 0..5 {
            queue
                .publish(Topic::StatusNotification, envelope(&format!("status-{}", i)))
                .unwrap();
        }

        // ASSERT
        let shards: Vec<String> = queue
            .messages(Topic::StatusNotification)
            .iter()
            .filter_map(|envelope| envelope.header(HEADER_SHARD_NAME).map(str::to_string))
            .collect();
        assert_eq!(shards, vec!["status-2", "status-3", "status-4"]);
    }

    #[test]
    fn test_job_topic_is_not_capped_while_pending() {
        let queue = MessageQueue::new(Duration::from_secs(30), 3).with_retention(2);

        for i in 0..5 {
            queue
                .publish(Topic::ValidateShardJob, envelope(&format!("shard-{}", i)))
                .unwrap();
        }

        assert_eq!(queue.available(Topic::ValidateShardJob).len(), 5);
    }

    #[test]
    fn test_dead_letters_are_capped_oldest_first() {
        // ARRANGE
        let queue = MessageQueue::new(Duration::from_secs(30), 1).with_retention(2);
        let ids: Vec<MessageId> = (0..3)
            .map(|i| {
                queue
                    .publish(Topic::ValidateShardJob, envelope(&format!("shard-{}", i)))
                    .unwrap()
            })
            .collect();
        let live = queue
            .publish(Topic::ValidateShardJob, envelope("shard-live"))
            .unwrap();

        // ACT: one exhausts its deliveries, two are parked as fatal
        queue.try_claim(Topic::ValidateShardJob, &ids[0]).unwrap();
        queue.release(Topic::ValidateShardJob, &ids[0], "boom").unwrap();
        queue.dead_letter(Topic::ValidateShardJob, &ids[1], "fatal").unwrap();
        queue.dead_letter(Topic::ValidateShardJob, &ids[2], "fatal").unwrap();

        // ASSERT
        let dead: Vec<String> = queue
            .dead_letters(Topic::ValidateShardJob)
            .iter()
            .filter_map(|(envelope, _)| envelope.header(HEADER_SHARD_NAME).map(str::to_string))
            .collect();
        assert_eq!(dead, vec!["shard-1", "shard-2"]);
        assert_eq!(queue.stats(Topic::ValidateShardJob).pending, 1);
        assert!(queue.try_claim(Topic::ValidateShardJob, &live).unwrap());
    }

    // ============================================================
    // JOB EXECUTOR
    // ============================================================

    fn executor_with(
        queue: Arc<MessageQueue>,
        dispatcher: Arc<JobDispatcher>,
        renew: Duration,
    ) -> Arc<JobExecutor> {
        JobExecutor::new(queue, dispatcher, 1, renew, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_executor_settles_each_outcome() {
        // ARRANGE: one handler per outcome, selected by shard name
        let queue = Arc::new(MessageQueue::new(Duration::from_secs(30), 5));
        let dispatcher = JobDispatcher::new();
        dispatcher.register(JobType::ValidateShard, |job| async move {
            match job.shard_name.as_deref() {
                Some("ok") => Ok(()),
                Some("missing") => Err(JobError::not_found("shard blob")),
                Some("flaky") => Err(JobError::Retryable(anyhow::anyhow!("timeout"))),
                _ => Err(JobError::fatal("bad metadata")),
            }
        });
        let executor = executor_with(queue.clone(), dispatcher, Duration::from_secs(10));

        for shard in ["ok", "missing", "flaky", "fatal"] {
            queue.publish(Topic::ValidateShardJob, envelope(shard)).unwrap();
        }

        // ACT: one pass over the four messages
        for _ in 0..4 {
            assert!(executor.process_next(Topic::ValidateShardJob).await);
        }

        // ASSERT: ok + missing acked, flaky requeued, fatal parked
        let stats = queue.stats(Topic::ValidateShardJob);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(
            queue.messages(Topic::ValidateShardJob)[0].header("shardName"),
            Some("flaky")
        );
        assert!(queue.dead_letters(Topic::ValidateShardJob)[0].1.contains("bad metadata"));
    }

    #[tokio::test]
    async fn test_executor_renews_lease_during_long_handler() {
        let queue = Arc::new(MessageQueue::new(Duration::from_millis(60), 5));
        let dispatcher = JobDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.register(JobType::ValidateShard, move |_job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(())
            }
        });
        let executor = executor_with(queue.clone(), dispatcher, Duration::from_millis(15));
        queue.publish(Topic::ValidateShardJob, envelope("slow")).unwrap();

        let worker = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.process_next(Topic::ValidateShardJob).await })
        };

        // Well past the original lease, the message must still be held.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.available(Topic::ValidateShardJob).is_empty());

        assert!(worker.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_started_pool_drains_topic() {
        let queue = Arc::new(MessageQueue::new(Duration::from_secs(30), 5));
        let dispatcher = JobDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher.register(JobType::ValidateShard, move |_job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let executor = executor_with(queue.clone(), dispatcher, Duration::from_secs(10));

        for i in 0..20 {
            queue
                .publish(Topic::ValidateShardJob, envelope(&format!("shard-{}", i)))
                .unwrap();
        }
        executor.start();

        for _ in 0..100 {
            if queue.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        executor.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert!(queue.is_idle());
    }
}
