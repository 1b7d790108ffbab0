//! Delete runs: ordering, dedup, dry run and parallel execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use stale_sweeper::backends::{EngineError, EngineGateway, InstanceSeed, MemoryEngine};
use stale_sweeper::sweeper::classifier::apply;
use stale_sweeper::sweeper::{
    AuditKind, AuditSink, Candidate, ClassifierConfig, DeleteMode, DeletePolicy,
    DeleteResultCode, DeleteWorker, FailureTag, LinearBackoff, MemoryAuditSink, Orchestrator, PrefetchStrategy,
    Prefetcher, RunOptions, Scanner, ScannerConfig,
};

struct Harness {
    engine: MemoryEngine,
    audit: Arc<MemoryAuditSink>,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

impl Harness {
    fn new(engine: MemoryEngine) -> Self {
        let audit = Arc::new(MemoryAuditSink::new());
        let shared = Arc::new(engine.clone());
        let policy = DeletePolicy {
            backoff: LinearBackoff::new(1),
            ..DeletePolicy::default()
        };
        let shutdown = CancellationToken::new();
        let worker = DeleteWorker::new(shared.clone(), policy, shutdown.clone());
        let sink: Arc<dyn AuditSink> = audit.clone();
        let orchestrator = Orchestrator::new(shared, worker, sink, Duration::ZERO);
        Self {
            engine,
            audit,
            orchestrator,
            shutdown,
        }
    }

    async fn candidates(&self) -> Vec<Candidate> {
        let shared = Arc::new(self.engine.clone());
        let prefetcher = Prefetcher::new(shared.clone(), PrefetchStrategy::Batched, 1000);
        let scanner = Scanner::new(shared, prefetcher, ScannerConfig::default());
        let now = Utc::now();
        let mut candidates = scanner
            .scan(now - ChronoDuration::hours(6), now, None)
            .await
            .unwrap();
        for candidate in &mut candidates {
            apply(candidate, &ClassifierConfig::default());
        }
        candidates
    }
}

fn options(mode: DeleteMode) -> RunOptions {
    RunOptions {
        mode,
        dry_run: false,
        ..RunOptions::default()
    }
}

fn seed_old(engine: &MemoryEngine, seed: InstanceSeed, hours: i64) {
    engine.seed(seed.started_at(Utc::now() - ChronoDuration::hours(hours)));
}

#[tokio::test]
async fn test_children_are_deleted_before_parents() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("solo", "invoice"), 40);
    seed_old(&engine, InstanceSeed::new("grand", "order"), 30);
    seed_old(&engine, InstanceSeed::new("parent", "order").child_of("grand"), 29);
    seed_old(&engine, InstanceSeed::new("child", "order").child_of("parent"), 28);
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;
    assert_eq!(candidates.len(), 4);

    let outcomes = harness
        .orchestrator
        .run(&candidates, &options(DeleteMode::All))
        .await;

    assert!(outcomes.iter().all(|o| o.result == DeleteResultCode::Ok));
    assert_eq!(
        harness.engine.delete_calls(),
        vec!["child", "parent", "solo", "grand"]
    );
}

#[tokio::test]
async fn test_safe_mode_leaves_review_only_instances() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("idle", "invoice"), 20);
    let now = Utc::now();
    seed_old(
        &engine,
        InstanceSeed::new("waiting", "invoice").with_timer(Some(now + ChronoDuration::hours(3))),
        20,
    );
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;

    let outcomes = harness
        .orchestrator
        .run(&candidates, &options(DeleteMode::Safe))
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].instance_id, "idle");
    assert!(harness.engine.is_running("waiting"));
    assert_eq!(harness.audit.records_for("idle", AuditKind::Delete).len(), 1);
    let verify = harness.audit.records_for("idle", AuditKind::Verify);
    assert_eq!(verify.len(), 1);
    assert_eq!(verify[0].result, "OK");
    assert_eq!(verify[0].verify_process_instance_count, Some(0));
}

#[tokio::test]
async fn test_dry_run_prices_without_deleting() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("p1", "invoice"), 20);
    seed_old(&engine, InstanceSeed::new("p2", "invoice"), 20);
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;
    harness.engine.suspend_instance("p2").await.unwrap();

    let dry = RunOptions {
        mode: DeleteMode::All,
        dry_run: true,
        actor: Some("ops-oncall".to_string()),
        ..RunOptions::default()
    };
    let outcomes = harness.orchestrator.run(&candidates, &dry).await;

    assert!(harness.engine.delete_calls().is_empty());
    assert_eq!(outcomes[0].result, DeleteResultCode::DryRun);
    assert_eq!(outcomes[1].result, DeleteResultCode::Skipped);
    assert_eq!(
        outcomes[1].error.as_deref(),
        Some("Not eligible or not found")
    );

    let priced = harness.audit.records_for("p1", AuditKind::Delete);
    assert_eq!(priced.len(), 1);
    assert_eq!(priced[0].result, "DRY_RUN");
    assert_eq!(priced[0].user, "ops-oncall");
    assert_eq!(harness.audit.records_for("p2", AuditKind::Skip).len(), 1);
}

#[tokio::test]
async fn test_concurrent_delete_of_same_id_is_skipped() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("p1", "invoice"), 20);
    engine.set_delete_delay(Duration::from_millis(50));
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;
    let opts = options(DeleteMode::All);

    let (first, second) = tokio::join!(
        harness.orchestrator.delete_one(&candidates[0], &opts),
        harness.orchestrator.delete_one(&candidates[0], &opts),
    );

    assert_eq!(first.result, DeleteResultCode::Ok);
    assert_eq!(second.result, DeleteResultCode::Skipped);
    assert_eq!(second.error.as_deref(), Some("already in progress"));
    assert_eq!(harness.engine.delete_calls().len(), 1);
    assert!(harness.orchestrator.in_flight().is_empty());

    let skips = harness.audit.records_for("p1", AuditKind::Skip);
    assert_eq!(skips.len(), 1);
    assert_eq!(skips[0].error.as_deref(), Some("already in progress"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_run_reports_every_target() {
    let engine = MemoryEngine::new();
    for i in 0..6 {
        seed_old(&engine, InstanceSeed::new(format!("p{i}"), "invoice"), 20 + i);
    }
    engine.fail_deletes("p3", [EngineError::other("constraint violation")]);
    engine.set_delete_delay(Duration::from_millis(5));
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;

    let parallel = RunOptions {
        parallelism: 3,
        ..options(DeleteMode::All)
    };
    let outcomes = harness.orchestrator.run(&candidates, &parallel).await;

    assert_eq!(outcomes.len(), 6);
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.result == DeleteResultCode::Fail)
        .map(|o| o.instance_id.as_str())
        .collect();
    assert_eq!(failed, vec!["p3"]);
    assert_eq!(harness.engine.delete_calls().len(), 6);
    assert!(harness.engine.is_running("p3"));
    assert!(!harness.engine.is_running("p0"));
}

#[tokio::test]
async fn test_instance_gone_before_delete_is_skipped() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("p1", "invoice"), 20);
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;
    harness.engine.delete_instance("p1", "manual").await.unwrap();

    let outcomes = harness
        .orchestrator
        .run(&candidates, &options(DeleteMode::All))
        .await;

    assert_eq!(outcomes[0].result, DeleteResultCode::Skipped);
    assert_eq!(outcomes[0].error.as_deref(), Some("not active"));
    let skips = harness.audit.records_for("p1", AuditKind::Skip);
    assert_eq!(skips.len(), 1);
}

#[tokio::test]
async fn test_parallel_run_starts_children_before_parents() {
    let engine = MemoryEngine::new();
    seed_old(&engine, InstanceSeed::new("solo", "invoice"), 40);
    seed_old(&engine, InstanceSeed::new("grand", "order"), 30);
    seed_old(&engine, InstanceSeed::new("parent", "order").child_of("grand"), 29);
    seed_old(&engine, InstanceSeed::new("child", "order").child_of("parent"), 28);
    engine.set_delete_delay(Duration::from_millis(5));
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;

    let parallel = RunOptions {
        parallelism: 3,
        ..options(DeleteMode::All)
    };
    let outcomes = harness.orchestrator.run(&candidates, &parallel).await;

    assert!(outcomes.iter().all(|o| o.result == DeleteResultCode::Ok));
    let calls = harness.engine.delete_calls();
    let position = |id: &str| calls.iter().position(|call| call == id).unwrap();
    assert!(position("child") < position("parent"));
    assert!(position("parent") < position("grand"));
    let ids: Vec<&str> = outcomes.iter().map(|o| o.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["child", "parent", "solo", "grand"]);
}

async fn run_after_shutdown(parallelism: usize) {
    let engine = MemoryEngine::new();
    for i in 0..3 {
        seed_old(&engine, InstanceSeed::new(format!("p{i}"), "invoice"), 20 + i);
    }
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;
    harness.shutdown.cancel();

    let opts = RunOptions {
        parallelism,
        ..options(DeleteMode::All)
    };
    let outcomes = harness.orchestrator.run(&candidates, &opts).await;

    assert!(harness.engine.delete_calls().is_empty());
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        assert_eq!(outcome.result, DeleteResultCode::Fail);
        assert_eq!(outcome.tag, Some(FailureTag::Interrupted));
        assert!(harness.engine.is_running(&outcome.instance_id));
        let records = harness
            .audit
            .records_for(&outcome.instance_id, AuditKind::Delete);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, "FAIL");
    }
}

#[tokio::test]
async fn test_sequential_run_stops_after_shutdown() {
    run_after_shutdown(1).await;
}

#[tokio::test]
async fn test_parallel_run_stops_after_shutdown() {
    run_after_shutdown(3).await;
}

#[tokio::test]
async fn test_shutdown_mid_run_leaves_remaining_targets() {
    let engine = MemoryEngine::new();
    for i in 0..3 {
        seed_old(&engine, InstanceSeed::new(format!("p{i}"), "invoice"), 30 - i);
    }
    engine.set_delete_delay(Duration::from_millis(50));
    let harness = Harness::new(engine);
    let candidates = harness.candidates().await;

    let shutdown = harness.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
    });
    let outcomes = harness
        .orchestrator
        .run(&candidates, &options(DeleteMode::All))
        .await;

    assert_eq!(harness.engine.delete_calls(), vec!["p0"]);
    assert_eq!(outcomes[0].result, DeleteResultCode::Ok);
    assert_eq!(outcomes[1].tag, Some(FailureTag::Interrupted));
    assert_eq!(outcomes[2].tag, Some(FailureTag::Interrupted));
}
