//! Integration tests for score worker invocations.

use std::sync::Arc;
use std::time::Duration;

use podium_core::{FacetSet, TableBackend, TimeGranularity, WriteCondition};
use podium_flow::config::{PodiumConfig, SemaphoreConfig, WorkerConfig};
use podium_flow::semaphore::{AdmissionDecision, EXPIRES_AT_ATTRIBUTE};
use podium_flow::worker::{StopReason, WorkBudget, WorkerOutcome, WorkerReport};
use podium_test_utils::{
    event_json, fixed_date, init_test_logging, score_event, tagged_event, TestContext,
    TracingTableBackend,
};

fn generous_budget() -> WorkBudget {
    WorkBudget::new(Duration::from_secs(300))
}

fn drained(outcome: WorkerOutcome) -> WorkerReport {
    match outcome {
        WorkerOutcome::Drained(report) => report,
        WorkerOutcome::AdmissionDenied { .. } => panic!("expected admission"),
    }
}

/// Test a worker without admission touches neither queue nor leaderboard.
#[tokio::test]
async fn denied_worker_does_nothing() {
    init_test_logging();
    let ctx = TestContext::new();
    ctx.enqueue(&[score_event("u1", 1)]);

    let outcome = ctx.worker().run(generous_budget()).await.unwrap();
    assert!(matches!(outcome, WorkerOutcome::AdmissionDenied { .. }));
    assert_eq!(ctx.queue.visible_len().unwrap(), 1);
    assert!(ctx.backend.items(&ctx.config.leaderboard.table).is_empty());
    assert_eq!(ctx.invoker.invocations(), 0);
}

/// Test a worker drains the queue and acknowledges what it processed.
#[tokio::test]
async fn worker_drains_and_acknowledges() {
    let ctx = TestContext::new();
    ctx.semaphore().add_tokens(2).await.unwrap();
    ctx.enqueue(&[tagged_event("u1", 50), score_event("u2", 10), score_event("u1", 5)]);
    ctx.queue.send("{not json").unwrap();

    let report = drained(ctx.worker().run(generous_budget()).await.unwrap());
    assert_eq!(report.batches, 1);
    assert_eq!(report.received, 4);
    assert_eq!(report.acknowledged, 3);
    assert_eq!(report.dropped_malformed, 1);
    assert_eq!(report.unacknowledged, 0);
    assert_eq!(report.stop, StopReason::QueueEmpty);
    // One spawn for the token left free after the first batch; none at the
    // end since the queue was seen empty.
    assert_eq!(report.spawned, 1);

    assert_eq!(ctx.queue.deleted_count().unwrap(), 4);
    assert_eq!(ctx.queue.in_flight_len().unwrap(), 0);
    assert_eq!(ctx.invoker.invocations(), 1);

    let facets = FacetSet::new().with_time(TimeGranularity::AllTime, fixed_date());
    let top = ctx.leaderboard().top_n(&facets, 10).await.unwrap();
    let ranked: Vec<_> = top.iter().map(|r| (r.user_id.as_str(), r.score)).collect();
    assert_eq!(ranked, [("u1", 55), ("u2", 10)]);

    // The token is free again once the worker is done.
    assert_eq!(ctx.semaphore().count_free().await.unwrap(), 2);
}

/// Test messages with failed updates stay on the queue for redelivery.
#[tokio::test]
async fn failed_messages_are_left_for_redelivery() {
    let ctx = TestContext::new();
    ctx.semaphore().add_tokens(1).await.unwrap();
    ctx.enqueue(&[score_event("u1", 1), score_event("u2", 2)]);
    ctx.queue.send("{}").unwrap();
    ctx.backend.inject_failure(ctx.config.leaderboard.table.clone());

    let report = drained(ctx.worker().run(generous_budget()).await.unwrap());
    assert_eq!(report.stop, StopReason::UnitsFailed);
    // A failed batch still means messages are waiting: a replacement is
    // spawned once the worker's own token is released.
    assert_eq!(report.spawned, 1);
    assert_eq!(ctx.invoker.invocations(), 1);
    assert_eq!(report.acknowledged, 0);
    assert_eq!(report.dropped_malformed, 1);
    assert_eq!(report.unacknowledged, 2);
    assert_eq!(ctx.queue.deleted_count().unwrap(), 1);
    assert_eq!(ctx.queue.in_flight_len().unwrap(), 2);

    // After the visibility timeout the same events are processed again.
    ctx.backend.clear_failures();
    assert_eq!(ctx.queue.expire_in_flight().unwrap(), 2);
    let report = drained(ctx.worker().run(generous_budget()).await.unwrap());
    assert_eq!(report.acknowledged, 2);
    assert_eq!(report.stop, StopReason::QueueEmpty);
}

/// Test a worker admitted with too little budget does no work.
#[tokio::test]
async fn budget_below_margin_processes_nothing() {
    let ctx = TestContext::new();
    ctx.semaphore().add_tokens(2).await.unwrap();
    ctx.enqueue(&[score_event("u1", 1)]);

    let report = drained(
        ctx.worker()
            .run(WorkBudget::new(Duration::from_secs(60)))
            .await
            .unwrap(),
    );
    assert_eq!(report.batches, 0);
    assert_eq!(report.stop, StopReason::BudgetExhausted);
    assert!(!report.more_work_likely());
    assert_eq!(report.spawned, 0);
    assert_eq!(ctx.queue.visible_len().unwrap(), 1);
}

/// Test running out of budget mid-stream fans out more workers.
#[tokio::test]
async fn exhausted_budget_spawns_more_workers() {
    let config = PodiumConfig {
        worker: WorkerConfig {
            receive_batch_size: 1,
            receive_rounds: 1,
            safety_margin_secs: 0,
        },
        ..PodiumConfig::default()
    };
    let mut ctx = TestContext::with_config(config);
    ctx.backend = Arc::new(TracingTableBackend::with_latency(Duration::from_millis(20)));
    ctx.semaphore().add_tokens(3).await.unwrap();
    for i in 0..50 {
        ctx.queue.send(event_json(&score_event(&format!("u{i}"), 1))).unwrap();
    }

    let report = drained(
        ctx.worker()
            .run(WorkBudget::new(Duration::from_millis(200)))
            .await
            .unwrap(),
    );
    assert_eq!(report.stop, StopReason::BudgetExhausted);
    assert!(report.batches > 0);
    assert!(report.batches < 50);
    assert_eq!(report.acknowledged, report.batches);
    assert!(report.more_work_likely());
    // Two while holding one of three tokens, three after releasing it.
    assert_eq!(report.spawned, 5);
    assert_eq!(ctx.invoker.invocations(), 5);
    assert_eq!(ctx.queue.visible_len().unwrap(), 50 - report.batches);
}

/// Test a worker draining past one lease term keeps its token to itself.
#[tokio::test]
async fn long_drain_renews_its_lease() {
    init_test_logging();
    let config = PodiumConfig {
        semaphore: SemaphoreConfig {
            lease_secs: 1,
            ..SemaphoreConfig::default()
        },
        worker: WorkerConfig {
            receive_batch_size: 1,
            receive_rounds: 1,
            safety_margin_secs: 0,
        },
        ..PodiumConfig::default()
    };
    let mut ctx = TestContext::with_config(config);
    ctx.backend = Arc::new(TracingTableBackend::with_latency(Duration::from_millis(20)));
    ctx.semaphore().add_tokens(1).await.unwrap();
    for i in 0..500 {
        ctx.queue.send(event_json(&score_event(&format!("u{i}"), 1))).unwrap();
    }

    let worker = ctx.worker();
    let rival = ctx.semaphore();
    let (outcome, rival_decision) = tokio::join!(
        worker.run(WorkBudget::new(Duration::from_secs(3))),
        async {
            // Well past the first lease term while the worker is still draining.
            tokio::time::sleep(Duration::from_millis(1500)).await;
            rival.obtain().await.unwrap()
        }
    );

    assert!(matches!(rival_decision, AdmissionDecision::Denied { .. }));
    let report = drained(outcome.unwrap());
    assert_eq!(report.stop, StopReason::BudgetExhausted);
    assert!(report.batches > 0);
    assert_eq!(ctx.semaphore().count_free().await.unwrap(), 1);
}

/// Test a worker whose token was taken over stops pulling work.
#[tokio::test]
async fn lost_lease_stops_the_drain() {
    let config = PodiumConfig {
        semaphore: SemaphoreConfig {
            lease_secs: 1,
            ..SemaphoreConfig::default()
        },
        worker: WorkerConfig {
            receive_batch_size: 1,
            receive_rounds: 1,
            safety_margin_secs: 0,
        },
        ..PodiumConfig::default()
    };
    let mut ctx = TestContext::with_config(config);
    ctx.backend = Arc::new(TracingTableBackend::with_latency(Duration::from_millis(20)));
    ctx.semaphore().add_tokens(1).await.unwrap();
    for i in 0..500 {
        ctx.queue.send(event_json(&score_event(&format!("u{i}"), 1))).unwrap();
    }

    let worker = ctx.worker();
    let semaphore = ctx.semaphore();
    let (outcome, ()) = tokio::join!(worker.run(WorkBudget::new(Duration::from_secs(3))), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Another holder overwrites the expiry, as if it had taken the token.
        let token = semaphore.tokens().await.unwrap().remove(0);
        let newer = chrono::Utc::now() + chrono::Duration::seconds(120);
        ctx.backend
            .update_attribute(
                &ctx.config.semaphore.table,
                &token.item_key(),
                EXPIRES_AT_ATTRIBUTE,
                serde_json::Value::from(newer.timestamp_millis()),
                WriteCondition::None,
            )
            .await
            .unwrap();
    });

    let report = drained(outcome.unwrap());
    assert_eq!(report.stop, StopReason::LeaseLost);
    assert!(report.batches > 0);
    assert!(ctx.queue.visible_len().unwrap() > 0);
    // The takeover's expiry survives the worker's release.
    assert_eq!(ctx.semaphore().count_free().await.unwrap(), 0);
}

/// Test a redelivered duplicate is counted again.
#[tokio::test]
async fn redelivered_duplicates_are_counted_again() {
    let ctx = TestContext::new();
    ctx.semaphore().add_tokens(1).await.unwrap();
    ctx.enqueue(&[score_event("u1", 3)]);

    let report = drained(ctx.worker().run(generous_budget()).await.unwrap());
    assert_eq!(report.acknowledged, 1);

    ctx.enqueue(&[score_event("u1", 3)]);
    drained(ctx.worker().run(generous_budget()).await.unwrap());

    let key = FacetSet::new()
        .with_time(TimeGranularity::AllTime, fixed_date())
        .canonical_key();
    let record = ctx
        .leaderboard()
        .get_user_score("u1", &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.score, 6);
}
