//! Scanner behaviour against the in-memory engine.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use stale_sweeper::backends::{InstanceSeed, MemoryEngine};
use stale_sweeper::sweeper::{
    FilterCriteria, PrefetchStrategy, Prefetcher, Scanner, ScannerConfig,
};

fn scanner(engine: &MemoryEngine, config: ScannerConfig) -> Scanner {
    let engine = Arc::new(engine.clone());
    let prefetcher = Prefetcher::new(engine.clone(), PrefetchStrategy::Batched, 2);
    Scanner::new(engine, prefetcher, config)
}

fn hours_ago(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours)
}

fn ids(candidates: &[stale_sweeper::Candidate]) -> Vec<&str> {
    candidates
        .iter()
        .map(|c| c.process_instance_id.as_str())
        .collect()
}

#[tokio::test]
async fn test_scan_returns_only_old_live_instances() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.seed(InstanceSeed::new("old", "invoice").started_at(hours_ago(now, 30)));
    engine.seed(InstanceSeed::new("young", "invoice").started_at(hours_ago(now, 1)));
    engine.seed(
        InstanceSeed::new("history-only", "invoice")
            .started_at(hours_ago(now, 40))
            .history_only(),
    );

    let results = scanner(&engine, ScannerConfig::default())
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();

    assert_eq!(ids(&results), vec!["old"]);
    assert_eq!(results[0].hours_running, 30);
    assert!(!results[0].is_subprocess);
}

#[tokio::test]
async fn test_scan_collects_tasks_jobs_timers_and_starter() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.add_user("alice", Some("Alice"), Some("Smith"));
    engine.seed(
        InstanceSeed::new("p1", "invoice")
            .started_at(hours_ago(now, 48))
            .started_by("alice")
            .at_activity("approveInvoice")
            .with_task("Approve", Some("bob"), hours_ago(now, 10))
            .with_job(Some(hours_ago(now, 2)))
            .with_job(Some(now + Duration::hours(2)))
            .with_timer(Some(now + Duration::hours(1))),
    );

    let results = scanner(&engine, ScannerConfig::default())
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();

    let candidate = &results[0];
    assert_eq!(candidate.process_definition_key.as_deref(), Some("invoice"));
    assert_eq!(candidate.started_by_user_id.as_deref(), Some("alice"));
    assert_eq!(candidate.started_by_name.as_deref(), Some("Alice Smith"));
    assert_eq!(
        candidate.started_by_email.as_deref(),
        Some("alice@example.com")
    );
    assert_eq!(candidate.current_activity_ids, vec!["approveInvoice"]);
    assert_eq!(candidate.open_task_count(), 1);
    assert_eq!(candidate.open_tasks[0].age_hours, 10);
    assert_eq!(candidate.jobs, 2);
    assert_eq!(candidate.overdue_jobs, 1);
    assert_eq!(candidate.timers, 1);
    assert_eq!(candidate.overdue_timers, 0);
}

#[tokio::test]
async fn test_starter_falls_back_to_identity_link() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.add_user("carol", Some("Carol"), None);
    engine.seed(
        InstanceSeed::new("p1", "invoice")
            .started_at(hours_ago(now, 12))
            .starter_link("carol"),
    );

    let results = scanner(&engine, ScannerConfig::default())
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();

    assert_eq!(results[0].started_by_user_id.as_deref(), Some("carol"));
    assert_eq!(results[0].started_by_name.as_deref(), Some("Carol"));
}

#[tokio::test]
async fn test_scan_applies_key_lists_and_criteria() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    for (id, key, user) in [
        ("a", "invoice", "alice"),
        ("b", "invoice", "bob"),
        ("c", "payroll", "alice"),
        ("d", "legacy", "alice"),
    ] {
        engine.seed(
            InstanceSeed::new(id, key)
                .started_at(hours_ago(now, 20))
                .started_by(user),
        );
    }

    let mut config = ScannerConfig::default();
    config.deny_list.insert("legacy".to_string());
    let scanner = scanner(&engine, config);

    let all = scanner.scan(hours_ago(now, 6), now, None).await.unwrap();
    assert_eq!(ids(&all), vec!["a", "b", "c"]);

    let criteria = FilterCriteria {
        definition_key: Some("invoice".to_string()),
        started_by: Some("alice".to_string()),
        ..FilterCriteria::default()
    };
    let narrowed = scanner
        .scan(hours_ago(now, 6), now, Some(&criteria))
        .await
        .unwrap();
    assert_eq!(ids(&narrowed), vec!["a"]);
}

#[tokio::test]
async fn test_scan_stops_at_max_per_run_across_pages() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    for i in 0..7 {
        engine.seed(InstanceSeed::new(format!("p{i}"), "invoice").started_at(hours_ago(now, 20 + i)));
    }
    let config = ScannerConfig {
        max_per_run: 5,
        page_size: 2,
        ..ScannerConfig::default()
    };

    let results = scanner(&engine, config)
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();

    assert_eq!(results.len(), 5);
    // Oldest first.
    assert_eq!(results[0].process_instance_id, "p6");
    assert_eq!(engine.history_query_count(), 3);
}

#[tokio::test]
async fn test_subprocesses_are_linked_or_excluded() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.seed(InstanceSeed::new("parent", "order").started_at(hours_ago(now, 30)));
    engine.seed(
        InstanceSeed::new("child", "shipment")
            .started_at(hours_ago(now, 29))
            .child_of("parent"),
    );

    let linked = scanner(&engine, ScannerConfig::default())
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();
    let child = linked
        .iter()
        .find(|c| c.process_instance_id == "child")
        .unwrap();
    assert!(child.is_subprocess);
    assert_eq!(child.parent_instance_id.as_deref(), Some("parent"));

    let config = ScannerConfig {
        include_subprocesses: false,
        ..ScannerConfig::default()
    };
    let roots = scanner(&engine, config)
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();
    assert_eq!(ids(&roots), vec!["parent"]);
}

#[tokio::test]
async fn test_runtime_fallback_when_history_query_fails() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.seed(InstanceSeed::new("old", "invoice").started_at(hours_ago(now, 30)));
    engine.seed(InstanceSeed::new("young", "invoice").started_at(hours_ago(now, 1)));
    engine.fail_history_queries(true);

    let results = scanner(&engine, ScannerConfig::default())
        .scan(hours_ago(now, 6), now, None)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["old"]);
    assert_eq!(engine.history_query_count(), 1);
}

#[tokio::test]
async fn test_scan_selected_dedups_and_honours_force() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.seed(InstanceSeed::new("old", "invoice").started_at(hours_ago(now, 30)));
    engine.seed(InstanceSeed::new("young", "invoice").started_at(hours_ago(now, 1)));
    let scanner = scanner(&engine, ScannerConfig::default());
    let selected: Vec<String> = ["old", " old ", "", "young", "missing"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let normal = scanner
        .scan_selected(&selected, hours_ago(now, 6), now, false)
        .await
        .unwrap();
    assert_eq!(ids(&normal), vec!["old"]);

    let forced = scanner
        .scan_selected(&selected, hours_ago(now, 6), now, true)
        .await
        .unwrap();
    assert_eq!(ids(&forced), vec!["old", "young"]);
}

#[tokio::test]
async fn test_per_instance_strategy_counts_the_same() {
    let engine = MemoryEngine::new();
    let now = Utc::now();
    engine.seed(
        InstanceSeed::new("p1", "invoice")
            .started_at(hours_ago(now, 30))
            .with_job(Some(hours_ago(now, 1)))
            .with_timer(None),
    );
    let shared = Arc::new(engine.clone());
    let prefetcher = Prefetcher::new(shared.clone(), PrefetchStrategy::PerInstance, 1000);
    let scanner = Scanner::new(shared, prefetcher, ScannerConfig::default());

    let results = scanner.scan(hours_ago(now, 6), now, None).await.unwrap();
    assert_eq!(results[0].jobs, 1);
    assert_eq!(results[0].overdue_jobs, 1);
    assert_eq!(results[0].timers, 1);
    assert_eq!(results[0].overdue_timers, 0);
}
