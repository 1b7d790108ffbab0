//! Append-only audit trail for every evaluate, delete, verify and skip.
//!
//! Sinks never fail the caller: write errors are logged and dropped.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;
use uuid::Uuid;

use super::model::{
    Candidate, Classification, DeleteOutcome, RecommendedAction, VerificationSnapshot, truncated,
};

/// Cap applied to list fields in each record.
pub const AUDIT_LIST_CAP: usize = 20;

pub const DEFAULT_AUDIT_TABLE: &str = "ops_cleanup_audit";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Evaluate,
    Delete,
    Verify,
    Skip,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluate => "EVALUATE",
            Self::Delete => "DELETE",
            Self::Verify => "VERIFY",
            Self::Skip => "SKIP",
        }
    }
}

/// One decision or action about one candidate.
#[derive(Clone, Debug)]
pub struct AuditEvent<'a> {
    pub kind: AuditKind,
    pub candidate: &'a Candidate,
    pub result: &'a str,
    pub attempt: Option<u32>,
    pub error: Option<&'a str>,
    pub reason: Option<&'a str>,
    pub verification: Option<&'a VerificationSnapshot>,
    /// Overrides the sink's default user.
    pub actor: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    pub fn evaluate(candidate: &'a Candidate) -> Self {
        Self::new(AuditKind::Evaluate, candidate, "OK")
    }

    pub fn skip(candidate: &'a Candidate, reason: &'a str) -> Self {
        Self {
            error: Some(reason),
            ..Self::new(AuditKind::Skip, candidate, "SKIPPED")
        }
    }

    pub fn delete(candidate: &'a Candidate, outcome: &'a DeleteOutcome, reason: &'a str) -> Self {
        Self {
            attempt: Some(outcome.attempts),
            error: outcome.error.as_deref(),
            reason: Some(reason),
            ..Self::new(AuditKind::Delete, candidate, outcome.result.as_str())
        }
    }

    pub fn verify(
        candidate: &'a Candidate,
        snapshot: &'a VerificationSnapshot,
        error: Option<&'a str>,
    ) -> Self {
        let result = if snapshot.is_deleted() { "OK" } else { "FAIL" };
        Self {
            error,
            verification: Some(snapshot),
            ..Self::new(AuditKind::Verify, candidate, result)
        }
    }

    pub fn by(mut self, actor: Option<&'a str>) -> Self {
        self.actor = actor;
        self
    }

    fn new(kind: AuditKind, candidate: &'a Candidate, result: &'a str) -> Self {
        Self {
            kind,
            candidate,
            result,
            attempt: None,
            error: None,
            reason: None,
            verification: None,
            actor: None,
        }
    }
}

/// Who and where a run executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditIdentity {
    pub run_id: Uuid,
    pub host: String,
    pub user: String,
}

impl AuditIdentity {
    /// Actor comes from the override, then `USER`; host from `HOSTNAME`,
    /// then `/etc/hostname`.
    pub fn detect(user_override: Option<&str>) -> Self {
        let user = user_override
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            run_id: Uuid::new_v4(),
            host,
            user,
        }
    }
}

/// Serialized form of one audit line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub host: String,
    pub user: String,
    pub operation: AuditKind,
    pub result: String,
    pub pid: String,
    pub proc_def_id: Option<String>,
    pub proc_def_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub hours_running: i64,
    pub starter_user_id: Option<String>,
    pub starter_name: Option<String>,
    pub starter_email: Option<String>,
    pub is_subprocess: bool,
    pub parent_pid: Option<String>,
    pub open_tasks_count: usize,
    pub oldest_task_age_hours: Option<i64>,
    pub task_summaries: Vec<String>,
    pub active_activity_ids: Vec<String>,
    pub job_count: u64,
    pub overdue_job_count: u64,
    pub timer_count: u64,
    pub overdue_timer_count: u64,
    pub classification: Option<Classification>,
    pub recommended_action: Option<RecommendedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_process_instance_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_task_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_job_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_timer_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_execution_count: Option<u64>,
}

impl AuditRecord {
    pub fn from_event(event: &AuditEvent<'_>, identity: &AuditIdentity) -> Self {
        let c = event.candidate;
        let snapshot = event.verification;
        Self {
            timestamp: Utc::now(),
            run_id: identity.run_id,
            host: identity.host.clone(),
            user: event
                .actor
                .map(str::to_string)
                .unwrap_or_else(|| identity.user.clone()),
            operation: event.kind,
            result: event.result.to_string(),
            pid: c.process_instance_id.clone(),
            proc_def_id: c.process_definition_id.clone(),
            proc_def_key: c.process_definition_key.clone(),
            start_time: c.start_time,
            hours_running: c.hours_running,
            starter_user_id: c.started_by_user_id.clone(),
            starter_name: c.started_by_name.clone(),
            starter_email: c.started_by_email.clone(),
            is_subprocess: c.is_subprocess,
            parent_pid: c.parent_instance_id.clone(),
            open_tasks_count: c.open_task_count(),
            oldest_task_age_hours: c.oldest_task_age_hours(),
            task_summaries: truncated(&c.tasks_short(), AUDIT_LIST_CAP),
            active_activity_ids: truncated(&c.current_activity_ids, AUDIT_LIST_CAP),
            job_count: c.jobs,
            overdue_job_count: c.overdue_jobs,
            timer_count: c.timers,
            overdue_timer_count: c.overdue_timers,
            classification: c.classification,
            recommended_action: c.recommended_action,
            attempt: event.attempt,
            reason: event.reason.map(str::to_string),
            error: event.error.map(str::to_string),
            verify_process_instance_count: snapshot.map(|s| s.process_instances),
            verify_task_count: snapshot.map(|s| s.tasks),
            verify_job_count: snapshot.map(|s| s.jobs),
            verify_timer_count: snapshot.map(|s| s.timers),
            verify_execution_count: snapshot.map(|s| s.executions),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent<'_>);
}

/// One JSON object per line, flushed after each write.
pub struct JsonlAuditSink {
    path: PathBuf,
    identity: AuditIdentity,
    writer: tokio::sync::Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>, identity: AuditIdentity) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            identity,
            writer: tokio::sync::Mutex::new(BufWriter::new(File::from_std(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_line(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: &AuditEvent<'_>) {
        let record = AuditRecord::from_event(event, &self.identity);
        if let Err(err) = self.write_line(&record).await {
            warn!(
                path = %self.path.display(),
                operation = event.kind.as_str(),
                instance_id = %event.candidate.process_instance_id,
                error = %err,
                "failed to write audit record"
            );
        }
    }
}

/// Secondary sink mirroring a summary of each event into Postgres.
#[derive(Clone)]
pub struct PostgresAuditMirror {
    pool: PgPool,
    identity: AuditIdentity,
    table: String,
}

impl PostgresAuditMirror {
    pub fn new(pool: PgPool, identity: AuditIdentity) -> Self {
        Self {
            pool,
            identity,
            table: DEFAULT_AUDIT_TABLE.to_string(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub async fn ensure_table(&self) -> Result<(), AuditError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                event_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                operation TEXT NOT NULL,
                result TEXT NOT NULL,
                username TEXT,
                hostname TEXT,
                pid TEXT NOT NULL,
                proc_def_key TEXT,
                reason TEXT,
                error TEXT
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(&self, event: &AuditEvent<'_>) -> Result<(), AuditError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (event_time, operation, result, username, hostname, pid, proc_def_key, reason, error)
            VALUES (NOW(), $1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.table
        ))
        .bind(event.kind.as_str())
        .bind(event.result)
        .bind(event.actor.unwrap_or(self.identity.user.as_str()))
        .bind(&self.identity.host)
        .bind(&event.candidate.process_instance_id)
        .bind(event.candidate.process_definition_key.as_deref())
        .bind(event.reason)
        .bind(event.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PostgresAuditMirror {
    async fn record(&self, event: &AuditEvent<'_>) {
        if let Err(err) = self.insert(event).await {
            warn!(
                table = %self.table,
                instance_id = %event.candidate.process_instance_id,
                error = %err,
                "failed to mirror audit record"
            );
        }
    }
}

/// Writes every event to each sink in order.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, event: &AuditEvent<'_>) {
        for sink in &self.sinks {
            sink.record(event).await;
        }
    }
}

/// Collects records in memory for tests.
pub struct MemoryAuditSink {
    identity: AuditIdentity,
    records: Mutex<Vec<AuditRecord>>,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self {
            identity: AuditIdentity {
                run_id: Uuid::new_v4(),
                host: "test-host".to_string(),
                user: "tester".to_string(),
            },
            records: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit records poisoned").clone()
    }

    pub fn records_for(&self, pid: &str, kind: AuditKind) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.pid == pid && r.operation == kind)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent<'_>) {
        let record = AuditRecord::from_event(event, &self.identity);
        self.records
            .lock()
            .expect("audit records poisoned")
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::sweeper::model::TaskSummary;

    fn candidate() -> Candidate {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut c = Candidate::new("p1", now - chrono::Duration::hours(9), now);
        c.process_definition_key = Some("invoice".to_string());
        c.open_tasks = (0..25)
            .map(|i| TaskSummary {
                id: format!("t{i}"),
                name: None,
                assignee: None,
                created: None,
                age_hours: i,
            })
            .collect();
        c
    }

    fn identity() -> AuditIdentity {
        AuditIdentity {
            run_id: Uuid::new_v4(),
            host: "h".to_string(),
            user: "u".to_string(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path, identity()).unwrap();
        let c = candidate();

        sink.record(&AuditEvent::evaluate(&c)).await;
        sink.record(&AuditEvent::skip(&c, "not active")).await;

        let reader = BufReader::new(File::open(&path).unwrap());
        let records: Vec<AuditRecord> = reader
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, AuditKind::Evaluate);
        assert_eq!(records[0].open_tasks_count, 25);
        assert_eq!(records[0].task_summaries.len(), AUDIT_LIST_CAP + 1);
        assert_eq!(
            records[0].task_summaries.last().map(String::as_str),
            Some("...truncated")
        );
        assert_eq!(records[1].result, "SKIPPED");
        assert_eq!(records[1].error.as_deref(), Some("not active"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jsonl_sink_keeps_concurrent_lines_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlAuditSink::open(&path, identity()).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let now = Utc::now();
                    let c = Candidate::new(format!("p{i}"), now, now);
                    sink.record(&AuditEvent::evaluate(&c)).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let reader = BufReader::new(File::open(&path).unwrap());
        let mut pids: Vec<String> = reader
            .lines()
            .map(|line| serde_json::from_str::<AuditRecord>(&line.unwrap()).unwrap().pid)
            .collect();
        pids.sort();
        pids.dedup();
        assert_eq!(pids.len(), 16);
    }

    #[tokio::test]
    async fn test_record_json_uses_camel_case_and_omits_absent_extras() {
        let c = candidate();
        let record = AuditRecord::from_event(&AuditEvent::evaluate(&c), &identity());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["procDefKey"], "invoice");
        assert_eq!(value["operation"], "EVALUATE");
        assert!(value.get("attempt").is_none());
        assert!(value.get("verifyJobCount").is_none());
    }

    #[tokio::test]
    async fn test_verify_event_carries_counts() {
        let c = candidate();
        let snapshot = VerificationSnapshot {
            jobs: 2,
            ..VerificationSnapshot::default()
        };
        let sink = MemoryAuditSink::new();
        sink.record(&AuditEvent::verify(&c, &snapshot, None)).await;
        let records = sink.records_for("p1", AuditKind::Verify);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, "FAIL");
        assert_eq!(records[0].verify_job_count, Some(2));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = Arc::new(MemoryAuditSink::new());
        let second = Arc::new(MemoryAuditSink::new());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![first.clone(), second.clone()];
        let fanout = FanoutAuditSink::new(sinks);
        let c = candidate();
        fanout.record(&AuditEvent::evaluate(&c)).await;
        assert_eq!(first.records().len(), 1);
        assert_eq!(second.records().len(), 1);
    }
}
