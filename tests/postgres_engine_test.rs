//! Postgres gateway against a throwaway copy of the Flowable tables.
//!
//! Runs only when `SWEEPER_TEST_DATABASE_URL` is set. Each test creates its
//! tables under a fresh prefix and drops them afterwards.

use std::env;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, NaiveDateTime, Utc};
use serial_test::serial;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stale_sweeper::backends::{EngineErrorKind, EngineGateway, PostgresEngine};
use stale_sweeper::sweeper::{
    DeletePolicy, DeleteResultCode, DeleteWorker, LinearBackoff, PrefetchStrategy, Prefetcher,
    Scanner, ScannerConfig,
};

const TABLES: &[(&str, &str)] = &[
    (
        "RU_EXECUTION",
        "ID_ VARCHAR(64) PRIMARY KEY, REV_ INTEGER NOT NULL DEFAULT 1, PROC_INST_ID_ VARCHAR(64), \
         PARENT_ID_ VARCHAR(64), SUPER_EXEC_ VARCHAR(64), ACT_ID_ VARCHAR(255), \
         SUSPENSION_STATE_ INTEGER NOT NULL DEFAULT 1",
    ),
    (
        "RU_TASK",
        "ID_ VARCHAR(64) PRIMARY KEY, REV_ INTEGER NOT NULL DEFAULT 1, PROC_INST_ID_ VARCHAR(64), \
         NAME_ VARCHAR(255), ASSIGNEE_ VARCHAR(255), CREATE_TIME_ TIMESTAMP, \
         SUSPENSION_STATE_ INTEGER NOT NULL DEFAULT 1",
    ),
    ("RU_JOB", "ID_ VARCHAR(64) PRIMARY KEY, PROCESS_INSTANCE_ID_ VARCHAR(64), DUEDATE_ TIMESTAMP"),
    ("RU_TIMER_JOB", "ID_ VARCHAR(64) PRIMARY KEY, PROCESS_INSTANCE_ID_ VARCHAR(64), DUEDATE_ TIMESTAMP"),
    ("RU_SUSPENDED_JOB", "ID_ VARCHAR(64) PRIMARY KEY, PROCESS_INSTANCE_ID_ VARCHAR(64)"),
    ("RU_DEADLETTER_JOB", "ID_ VARCHAR(64) PRIMARY KEY, PROCESS_INSTANCE_ID_ VARCHAR(64)"),
    ("RU_EXTERNAL_JOB", "ID_ VARCHAR(64) PRIMARY KEY, PROCESS_INSTANCE_ID_ VARCHAR(64)"),
    (
        "RU_IDENTITYLINK",
        "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64), TASK_ID_ VARCHAR(64), \
         USER_ID_ VARCHAR(255), TYPE_ VARCHAR(255)",
    ),
    ("RU_VARIABLE", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    ("RU_EVENT_SUBSCR", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    ("RU_ACTINST", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    (
        "HI_PROCINST",
        "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64) UNIQUE, PROC_DEF_ID_ VARCHAR(64), \
         START_TIME_ TIMESTAMP, END_TIME_ TIMESTAMP, START_USER_ID_ VARCHAR(255), \
         DELETE_REASON_ VARCHAR(4000)",
    ),
    (
        "HI_ACTINST",
        "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64), PROC_DEF_ID_ VARCHAR(64), \
         ACT_ID_ VARCHAR(255), ACT_NAME_ VARCHAR(255)",
    ),
    ("HI_TASKINST", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    ("HI_VARINST", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    ("HI_IDENTITYLINK", "ID_ VARCHAR(64) PRIMARY KEY, PROC_INST_ID_ VARCHAR(64)"),
    ("RE_PROCDEF", "ID_ VARCHAR(64) PRIMARY KEY, KEY_ VARCHAR(255)"),
    (
        "ID_USER",
        "ID_ VARCHAR(64) PRIMARY KEY, FIRST_ VARCHAR(255), LAST_ VARCHAR(255), EMAIL_ VARCHAR(255)",
    ),
];

struct Fixture {
    engine: PostgresEngine,
    prefix: String,
}

impl Fixture {
    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    async fn exec(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(self.engine.pool()).await?;
        Ok(())
    }

    async fn teardown(self) -> Result<()> {
        for (name, _) in TABLES {
            self.exec(&format!("DROP TABLE IF EXISTS {}", self.table(name)))
                .await?;
        }
        Ok(())
    }

    /// Root execution plus history row for one instance.
    async fn seed_instance(&self, id: &str, started: NaiveDateTime, starter: Option<&str>) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (ID_, PROC_INST_ID_, SUSPENSION_STATE_) VALUES ($1, $1, 1)",
            self.table("RU_EXECUTION")
        ))
        .bind(id)
        .execute(self.engine.pool())
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (ID_, PROC_INST_ID_, PROC_DEF_ID_, START_TIME_, START_USER_ID_) VALUES ($1, $1, 'invoice:1', $2, $3)",
            self.table("HI_PROCINST")
        ))
        .bind(id)
        .bind(started)
        .bind(starter)
        .execute(self.engine.pool())
        .await?;
        Ok(())
    }
}

async fn setup() -> Option<Fixture> {
    let database_url = match env::var("SWEEPER_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: SWEEPER_TEST_DATABASE_URL not set");
            return None;
        }
    };
    let prefix = format!("t{}_", &Uuid::new_v4().simple().to_string()[..8]);
    let engine = PostgresEngine::connect(&database_url, &prefix, 4).await.ok()?;
    let fixture = Fixture { engine, prefix };
    for (name, columns) in TABLES {
        fixture
            .exec(&format!("CREATE TABLE {} ({columns})", fixture.table(name)))
            .await
            .ok()?;
    }
    fixture
        .exec(&format!(
            "INSERT INTO {} (ID_, KEY_) VALUES ('invoice:1', 'invoice')",
            fixture.table("RE_PROCDEF")
        ))
        .await
        .ok()?;
    Some(fixture)
}

#[tokio::test]
#[serial(postgres)]
async fn test_scan_and_verified_delete() -> Result<()> {
    let Some(fx) = setup().await else {
        return Ok(());
    };
    let now = Utc::now();
    let old = (now - Duration::hours(30)).naive_utc();
    let young = (now - Duration::hours(1)).naive_utc();

    fx.seed_instance("p-old", old, Some("alice")).await?;
    fx.seed_instance("p-young", young, None).await?;
    fx.exec(&format!(
        "INSERT INTO {} (ID_, FIRST_, LAST_, EMAIL_) VALUES ('alice', 'Alice', 'Smith', 'alice@example.com')",
        fx.table("ID_USER")
    ))
    .await?;
    fx.exec(&format!(
        "INSERT INTO {} (ID_, PROC_INST_ID_, PARENT_ID_, ACT_ID_) VALUES ('e-1', 'p-old', 'p-old', 'approve')",
        fx.table("RU_EXECUTION")
    ))
    .await?;
    sqlx::query(&format!(
        "INSERT INTO {} (ID_, PROC_INST_ID_, NAME_, CREATE_TIME_) VALUES ('t-1', 'p-old', 'Approve', $1)",
        fx.table("RU_TASK")
    ))
    .bind((now - Duration::hours(10)).naive_utc())
    .execute(fx.engine.pool())
    .await?;
    sqlx::query(&format!(
        "INSERT INTO {} (ID_, PROCESS_INSTANCE_ID_, DUEDATE_) VALUES ('j-1', 'p-old', $1)",
        fx.table("RU_JOB")
    ))
    .bind((now - Duration::hours(2)).naive_utc())
    .execute(fx.engine.pool())
    .await?;

    let engine: Arc<dyn EngineGateway> = Arc::new(fx.engine.clone());
    let prefetcher = Prefetcher::new(engine.clone(), PrefetchStrategy::Batched, 1000);
    let scanner = Scanner::new(engine.clone(), prefetcher, ScannerConfig::default());
    let candidates = scanner.scan(now - Duration::hours(6), now, None).await?;

    assert_eq!(candidates.len(), 1);
    let candidate = &candidates[0];
    assert_eq!(candidate.process_instance_id, "p-old");
    assert_eq!(candidate.process_definition_key.as_deref(), Some("invoice"));
    assert_eq!(candidate.started_by_name.as_deref(), Some("Alice Smith"));
    assert_eq!(candidate.current_activity_ids, vec!["approve"]);
    assert_eq!(candidate.open_task_count(), 1);
    assert_eq!(candidate.overdue_jobs, 1);

    let policy = DeletePolicy {
        backoff: LinearBackoff::new(1),
        ..DeletePolicy::default()
    };
    let worker = DeleteWorker::new(engine.clone(), policy, CancellationToken::new());
    let outcome = worker.delete_process("p-old", "Ops cleanup", true).await;
    assert_eq!(outcome.result, DeleteResultCode::Ok);
    assert!(outcome.verification.is_some_and(|s| s.is_deleted()));

    let reason: Option<String> = sqlx::query_scalar(&format!(
        "SELECT DELETE_REASON_ FROM {} WHERE PROC_INST_ID_ = 'p-old' AND END_TIME_ IS NOT NULL",
        fx.table("HI_PROCINST")
    ))
    .fetch_optional(fx.engine.pool())
    .await?;
    assert_eq!(reason.as_deref(), Some("Ops cleanup"));
    assert!(fx.engine.is_active("p-young").await?);

    fx.engine.delete_history("p-old").await?;
    let err = fx.engine.delete_history("p-old").await.unwrap_err();
    assert_eq!(err.kind, EngineErrorKind::NotFound);

    fx.teardown().await
}

#[tokio::test]
#[serial(postgres)]
async fn test_suspend_and_missing_instance() -> Result<()> {
    let Some(fx) = setup().await else {
        return Ok(());
    };
    let started = (Utc::now() - Duration::hours(30)).naive_utc();
    fx.seed_instance("p-1", started, None).await?;

    assert!(fx.engine.is_active("p-1").await?);
    fx.engine.suspend_instance("p-1").await?;
    assert!(!fx.engine.is_active("p-1").await?);
    assert_eq!(fx.engine.count_process_instances("p-1").await?, 1);

    let err = fx.engine.delete_instance("missing", "r").await.unwrap_err();
    assert_eq!(err.kind, EngineErrorKind::NotFound);
    let err = fx.engine.suspend_instance("missing").await.unwrap_err();
    assert_eq!(err.kind, EngineErrorKind::NotFound);

    let counts = fx.engine.query_counts();
    assert_eq!(counts.get("update:suspend_instance"), Some(&2));

    fx.teardown().await
}

#[tokio::test]
#[serial(postgres)]
async fn test_activity_names_come_from_history() -> Result<()> {
    let Some(fx) = setup().await else {
        return Ok(());
    };
    fx.exec(&format!(
        "INSERT INTO {} (ID_, PROC_INST_ID_, PROC_DEF_ID_, ACT_ID_, ACT_NAME_) VALUES \
         ('a-1', 'p-1', 'invoice:1', 'approve', 'Approve invoice'), \
         ('a-2', 'p-2', 'invoice:1', 'approve', 'Approve invoice'), \
         ('a-3', 'p-1', 'invoice:1', 'gateway', NULL), \
         ('a-4', 'p-3', 'payroll:1', 'pay', 'Pay')",
        fx.table("HI_ACTINST")
    ))
    .await?;

    let names = fx.engine.find_activity_names("invoice:1").await?;
    assert_eq!(names.len(), 1);
    assert_eq!(names.get("approve").map(String::as_str), Some("Approve invoice"));
    assert!(fx.engine.find_activity_names("missing:1").await?.is_empty());

    fx.teardown().await
}
