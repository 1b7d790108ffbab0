//! Engine capability interface consumed by the sweeper pipeline.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker carried by the engine's null-pointer fault when a call-activity
/// element cannot be resolved during instance deletion.
pub const KNOWN_DEFECT_MARKER: &str = "callActivityElement";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineErrorKind {
    NotFound,
    Conflict,
    Timeout,
    KnownDefect,
    Other,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::KnownDefect => "known_defect",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Classified failure returned by every gateway call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Other, message)
    }

    /// The null-pointer fault raised while resolving call-activity elements.
    pub fn known_defect() -> Self {
        Self::new(
            EngineErrorKind::KnownDefect,
            format!("NullPointerException: {KNOWN_DEFECT_MARKER} is null"),
        )
    }

    /// Classify a raw engine message by its text.
    ///
    /// Engines that only surface a message (driver errors, remote faults) go
    /// through here so the worker can still decide whether to retry.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if message.contains(KNOWN_DEFECT_MARKER)
            && (lower.contains("nullpointer") || lower.contains("null pointer"))
        {
            EngineErrorKind::KnownDefect
        } else if lower.contains("not found")
            || lower.contains("does not exist")
            || lower.contains("no process instance found")
        {
            EngineErrorKind::NotFound
        } else if lower.contains("optimistic")
            || lower.contains("concurrent")
            || (lower.contains("version") && lower.contains("stale"))
            || lower.contains("was updated by another transaction")
            || lower.contains("could not serialize")
        {
            EngineErrorKind::Conflict
        } else if lower.contains("deadlock")
            || lower.contains("ora-00060")
            || lower.contains("lock timeout")
            || lower.contains("timed out")
            || lower.contains("timeout")
        {
            EngineErrorKind::Timeout
        } else {
            EngineErrorKind::Other
        };
        Self { kind, message }
    }

    /// Conflicts and timeouts are transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::Conflict | EngineErrorKind::Timeout
        )
    }

    pub fn is_deadlock(&self) -> bool {
        let lower = self.message.to_ascii_lowercase();
        lower.contains("deadlock") || lower.contains("ora-00060")
    }
}

/// Unfinished history row for a workflow instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricInstance {
    pub id: String,
    pub definition_id: Option<String>,
    pub definition_key: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub start_user_id: Option<String>,
}

/// Page request against unfinished history, ordered by start time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryQuery {
    pub started_before: DateTime<Utc>,
    pub definition_key: Option<String>,
    pub started_by: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

/// Runtime execution row. Root executions carry the instance id as their
/// own id; a sub-process root points at the caller through
/// `super_execution_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub process_instance_id: String,
    pub activity_id: Option<String>,
    pub super_execution_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub process_instance_id: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
}

/// Async job or timer job row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub process_instance_id: String,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// Read and lifecycle operations the sweeper needs from a workflow engine.
///
/// Every call is its own unit of work: implementations must not hold a
/// transaction open across calls.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Unfinished history rows started strictly before the cutoff.
    async fn list_unfinished_history(
        &self,
        query: &HistoryQuery,
    ) -> EngineResult<Vec<HistoricInstance>>;

    async fn find_history_by_ids(&self, ids: &[String]) -> EngineResult<Vec<HistoricInstance>>;

    /// Ids of active root instances, ordered by id.
    async fn list_active_instance_ids(
        &self,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<String>>;

    /// Subset of `ids` that are active root instances.
    async fn find_active_instance_ids(&self, ids: &[String]) -> EngineResult<HashSet<String>>;

    async fn is_active(&self, id: &str) -> EngineResult<bool>;

    async fn list_executions_by_instance_ids(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>>;

    async fn list_executions_by_ids(
        &self,
        execution_ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>>;

    /// Active (non-suspended) tasks of the given instances.
    async fn list_open_tasks(&self, ids: &[String]) -> EngineResult<Vec<TaskRecord>>;

    async fn list_jobs(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>>;

    async fn list_timers(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>>;

    /// User id of the instance's "starter" identity link, if any.
    async fn find_starter_user_id(&self, id: &str) -> EngineResult<Option<String>>;

    async fn find_users(&self, user_ids: &[String]) -> EngineResult<Vec<UserRecord>>;

    /// Display names of a definition's activities, keyed by activity id.
    async fn find_activity_names(
        &self,
        definition_id: &str,
    ) -> EngineResult<HashMap<String, String>>;

    async fn count_process_instances(&self, id: &str) -> EngineResult<u64>;

    async fn count_tasks(&self, id: &str) -> EngineResult<u64>;

    async fn count_jobs(&self, id: &str) -> EngineResult<u64>;

    async fn count_timers(&self, id: &str) -> EngineResult<u64>;

    async fn count_executions(&self, id: &str) -> EngineResult<u64>;

    async fn suspend_instance(&self, id: &str) -> EngineResult<()>;

    /// Remove the runtime instance and its residue, recording `reason` on
    /// the history row.
    async fn delete_instance(&self, id: &str, reason: &str) -> EngineResult<()>;

    async fn delete_history(&self, id: &str) -> EngineResult<()>;
}
