//! Integration tests for the full redelivery pipeline.
//!
//! Tests: capture → store → sweep → handlers → resolve / reschedule / quarantine
//!
//! Verifies:
//! - Metrics are emitted per transition
//! - Retry ceilings and forced retries behave as documented
//! - Concurrent sweeps never lose an attempt or resolve a record twice

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;
    use serde_json::json;

    use uno_core::ManualClock;
    use uno_events::{DeadLetterReason, DeadLetterRecord, NewDeadLetter, handler_fn, sync_handler};
    use uno_observability::InMemoryMetrics;
    use uno_observability::metrics::{DEAD_LETTERED, ERROR, PROCESSED, QUARANTINED, RETRY};

    use crate::dlq::{
        BackoffPolicy, DeadLetterQueue, DeadLetterStore, FileDeadLetterStore,
        InMemoryDeadLetterStore, ProcessOptions, RecordFilter, RetryOutcome,
    };

    type Queue = DeadLetterQueue<Arc<InMemoryDeadLetterStore>>;

    fn setup() -> (Arc<Queue>, Arc<InMemoryMetrics>) {
        let metrics = InMemoryMetrics::arc();
        let queue = DeadLetterQueue::new(InMemoryDeadLetterStore::arc())
            .with_metrics(metrics.clone())
            .with_clock(Arc::new(ManualClock::starting_now()));
        (Arc::new(queue), metrics)
    }

    fn order_failure() -> NewDeadLetter {
        NewDeadLetter::new(
            json!({"order_id": "123", "amount": 100.0}),
            DeadLetterReason::HandlerFailed,
        )
        .with_error("boom")
        .with_subscription_id("payments")
        .with_attempt_count(1)
    }

    fn always_failing(calls: Arc<AtomicU32>) -> impl uno_events::DeadLetterHandler {
        sync_handler(move |_r: &DeadLetterRecord| {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("downstream unavailable")
        })
    }

    #[tokio::test]
    async fn capture_stores_one_record_and_counts_it() {
        let (queue, metrics) = setup();

        let id = queue.add(order_failure()).await.unwrap();

        let records = queue.list(&RecordFilter::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id(), id);
        assert_eq!(records[0].event_data(), &json!({"order_id": "123", "amount": 100.0}));
        assert_eq!(records[0].subscription_id(), Some("payments"));
        assert_eq!(metrics.count(DEAD_LETTERED, &[("reason", "HANDLER_FAILED")]), 1);
    }

    #[tokio::test]
    async fn record_recovers_on_third_sweep() {
        let (queue, metrics) = setup();
        queue.add_handler(sync_handler(|r: &DeadLetterRecord| {
            anyhow::ensure!(r.attempt_count() >= 3, "attempt {} too early", r.attempt_count());
            Ok(())
        }));
        let id = queue.add(order_failure()).await.unwrap();

        let options = || ProcessOptions::new().with_retry_delay(Duration::ZERO);
        for _ in 0..3 {
            queue.process_with(options()).await.unwrap();
        }

        assert!(queue.get(id).await.unwrap().is_none());
        assert_eq!(metrics.total(PROCESSED), 1);
        assert_eq!(metrics.total(RETRY), 2);
        assert_eq!(metrics.total(ERROR), 2);
    }

    #[tokio::test]
    async fn poison_message_is_quarantined_until_forced() {
        let (queue, metrics) = setup();
        queue.set_retry_policy(BackoffPolicy::immediate(2), 2);
        let calls = Arc::new(AtomicU32::new(0));
        queue.add_handler(always_failing(calls.clone()));
        let id = queue.add(order_failure()).await.unwrap();

        queue.process().await.unwrap();
        queue.process().await.unwrap();

        let stored = queue.get(id).await.unwrap().unwrap();
        assert!(stored.is_quarantined());
        assert_eq!(stored.attempt_count(), 2);
        let calls_before = calls.load(Ordering::SeqCst);

        let report = queue.process().await.unwrap();
        assert_eq!(report.attempted(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), calls_before);

        let outcome = queue.retry(id, true).await.unwrap();
        assert!(outcome.attempted());
        assert_eq!(calls.load(Ordering::SeqCst), calls_before + 1);
        assert_eq!(metrics.total(QUARANTINED), 2);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let (queue, _) = setup();
        for _ in 0..5 {
            queue.add(order_failure()).await.unwrap();
        }

        assert_eq!(queue.clear().await.unwrap(), 5);
        assert!(queue.list(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_on_empty_store_is_a_no_op() {
        let (queue, _) = setup();
        queue.add_handler(always_failing(Arc::new(AtomicU32::new(0))));

        let report = queue.replay(false).await.unwrap();

        assert!(report.is_empty());
        assert_eq!(report.summary.attempted(), 0);
    }

    #[tokio::test]
    async fn replay_skips_quarantined_unless_forced() {
        let (queue, _) = setup();
        queue.set_retry_policy(BackoffPolicy::immediate(2), 2);
        let calls = Arc::new(AtomicU32::new(0));
        queue.add_handler(always_failing(calls.clone()));

        let poisoned = queue.add(order_failure()).await.unwrap();
        queue.process().await.unwrap();
        queue.add(order_failure()).await.unwrap();
        calls.store(0, Ordering::SeqCst);

        let report = queue.replay(false).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.outcomes.iter().find(|(id, _)| *id == poisoned).map(|(_, o)| o.attempted()),
            Some(false)
        );

        let report = queue.replay(true).await.unwrap();
        assert_eq!(report.summary.attempted(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_do_not_lose_attempts() {
        let (queue, _) = setup();
        queue.set_retry_policy(BackoffPolicy::immediate(5), 5);
        queue.add_handler(handler_fn(|_r| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            anyhow::bail!("always fails")
        }));
        let id = queue.add(order_failure()).await.unwrap();

        let a = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process().await }
        });
        let b = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count(), 3);
        assert_eq!(stored.retry_errors().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_resolve_each_record_once() {
        let (queue, metrics) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = calls.clone();
            queue.add_handler(handler_fn(move |_r| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(())
                }
            }));
        }
        for _ in 0..10 {
            queue.add(order_failure()).await.unwrap();
        }

        let sweeps: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .process_with(ProcessOptions::new().with_max_concurrent(4))
                        .await
                })
            })
            .collect();
        for sweep in sweeps {
            sweep.await.unwrap().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(metrics.total(PROCESSED), 10);
        assert!(queue.list(&RecordFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_store_round_trips_through_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.json");

        let id = {
            let queue = DeadLetterQueue::new(FileDeadLetterStore::open(&path).await.unwrap());
            queue.set_retry_policy(BackoffPolicy::immediate(5), 5);
            queue.add_handler(always_failing(Arc::new(AtomicU32::new(0))));
            let id = queue.add(order_failure()).await.unwrap();
            queue.process().await.unwrap();
            id
        };

        let queue = DeadLetterQueue::new(FileDeadLetterStore::open(&path).await.unwrap());
        queue.add_handler(sync_handler(|_r: &DeadLetterRecord| Ok(())));
        let stored = queue.store().get(id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count(), 2);
        assert_eq!(stored.error(), Some("boom"));
        assert_eq!(stored.event_data(), &json!({"order_id": "123", "amount": 100.0}));

        let outcome = queue.retry(id, false).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Resolved { attempt_count: 2 });
        assert_eq!(queue.store().len().await.unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// n failing sweeps: attempts grow by one each until the ceiling,
        /// where the record is quarantined and stays put.
        #[test]
        fn failing_sweeps_climb_to_ceiling(max_attempts in 2u32..8, sweeps in 0u32..12) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (count, quarantined) = runtime.block_on(async {
                let (queue, _) = setup();
                queue.set_retry_policy(BackoffPolicy::immediate(max_attempts), max_attempts);
                queue.add_handler(always_failing(Arc::new(AtomicU32::new(0))));
                let id = queue.add(order_failure()).await.unwrap();

                for _ in 0..sweeps {
                    queue.process().await.unwrap();
                }
                let stored = queue.get(id).await.unwrap().unwrap();
                (stored.attempt_count(), stored.is_quarantined())
            });

            prop_assert_eq!(count, (1 + sweeps).min(max_attempts));
            prop_assert_eq!(quarantined, 1 + sweeps >= max_attempts);
        }
    }
}
