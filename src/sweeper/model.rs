//! Shared data types for the sweep pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::{EngineError, EngineErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    SafeToDelete,
    ReviewOnly,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SafeToDelete => "SAFE_TO_DELETE",
            Self::ReviewOnly => "REVIEW_ONLY",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Terminate,
    Wait,
    Escalate,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "TERMINATE",
            Self::Wait => "WAIT",
            Self::Escalate => "ESCALATE",
        }
    }
}

impl FromStr for RecommendedAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TERMINATE" => Ok(Self::Terminate),
            "WAIT" => Ok(Self::Wait),
            "ESCALATE" => Ok(Self::Escalate),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Which candidates a delete run targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteMode {
    /// Only candidates classified safe to delete.
    #[default]
    Safe,
    /// Every candidate the operator named explicitly.
    Selected,
    /// Every candidate regardless of classification.
    All,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Selected => "SELECTED",
            Self::All => "ALL",
        }
    }
}

impl fmt::Display for DeleteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeleteMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(Self::Safe),
            "SELECTED" => Ok(Self::Selected),
            "ALL" => Ok(Self::All),
            other => Err(format!("unknown delete mode '{other}'")),
        }
    }
}

/// Operator-supplied narrowing of a scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    /// Age cutoff in hours; the configured default applies when unset.
    pub hours: Option<i64>,
    /// `ALL`, empty, or one action name, case-insensitive.
    pub action: Option<String>,
    pub definition_key: Option<String>,
    pub started_by: Option<String>,
    pub has_tasks: Option<bool>,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub size: usize,
}

impl FilterCriteria {
    pub fn definition_key(&self) -> Option<&str> {
        non_blank(self.definition_key.as_deref())
    }

    pub fn started_by(&self) -> Option<&str> {
        non_blank(self.started_by.as_deref())
    }

    pub fn hours_or(&self, default_hours: i64) -> i64 {
        self.hours.filter(|hours| *hours > 0).unwrap_or(default_hours)
    }

    pub fn matches_action(&self, action: Option<RecommendedAction>) -> bool {
        match non_blank(self.action.as_deref()) {
            None => true,
            Some(wanted) if wanted.eq_ignore_ascii_case("ALL") => true,
            Some(wanted) => action.is_some_and(|a| a.as_str().eq_ignore_ascii_case(wanted)),
        }
    }

    pub fn matches_tasks(&self, candidate: &Candidate) -> bool {
        self.has_tasks
            .is_none_or(|wanted| wanted == (candidate.open_task_count() > 0))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Open user task attached to a candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// Zero when the engine reports no create time.
    pub age_hours: i64,
}

impl TaskSummary {
    /// `id|name|assignee|Nh`, with empty fields left blank.
    pub fn short(&self) -> String {
        format!(
            "{}|{}|{}|{}h",
            self.id,
            self.name.as_deref().unwrap_or(""),
            self.assignee.as_deref().unwrap_or(""),
            self.age_hours
        )
    }
}

/// A workflow instance eligible for review.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub process_instance_id: String,
    pub process_definition_key: Option<String>,
    pub process_definition_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub hours_running: i64,
    pub started_by_user_id: Option<String>,
    pub started_by_name: Option<String>,
    pub started_by_email: Option<String>,
    pub parent_instance_id: Option<String>,
    pub is_subprocess: bool,
    pub current_activity_ids: Vec<String>,
    pub open_tasks: Vec<TaskSummary>,
    pub jobs: u64,
    pub overdue_jobs: u64,
    pub timers: u64,
    pub overdue_timers: u64,
    pub classification: Option<Classification>,
    pub recommended_action: Option<RecommendedAction>,
}

impl Candidate {
    pub fn new(
        process_instance_id: impl Into<String>,
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            process_instance_id: process_instance_id.into(),
            process_definition_key: None,
            process_definition_id: None,
            start_time,
            hours_running: whole_hours_between(start_time, now),
            started_by_user_id: None,
            started_by_name: None,
            started_by_email: None,
            parent_instance_id: None,
            is_subprocess: false,
            current_activity_ids: Vec::new(),
            open_tasks: Vec::new(),
            jobs: 0,
            overdue_jobs: 0,
            timers: 0,
            overdue_timers: 0,
            classification: None,
            recommended_action: None,
        }
    }

    pub fn open_task_count(&self) -> usize {
        self.open_tasks.len()
    }

    /// Age of the oldest open task in whole hours.
    pub fn oldest_task_age_hours(&self) -> Option<i64> {
        self.open_tasks.iter().map(|task| task.age_hours).max()
    }

    pub fn tasks_short(&self) -> Vec<String> {
        self.open_tasks.iter().map(TaskSummary::short).collect()
    }

    pub fn action(&self) -> Option<RecommendedAction> {
        self.recommended_action
    }
}

/// Hours elapsed, truncated towards zero.
pub fn whole_hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_hours()
}

pub const TRUNCATION_MARKER: &str = "...truncated";

/// First `max` items plus a marker when anything was dropped.
pub fn truncated(items: &[String], max: usize) -> Vec<String> {
    if items.len() <= max {
        return items.to_vec();
    }
    let mut kept = items[..max].to_vec();
    kept.push(TRUNCATION_MARKER.to_string());
    kept
}

/// Five residue counts read back after a delete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSnapshot {
    pub process_instances: u64,
    pub tasks: u64,
    pub jobs: u64,
    pub timers: u64,
    pub executions: u64,
}

impl VerificationSnapshot {
    pub fn is_deleted(&self) -> bool {
        self.process_instances == 0
            && self.tasks == 0
            && self.jobs == 0
            && self.timers == 0
            && self.executions == 0
    }
}

impl fmt::Display for VerificationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pi={} tasks={} jobs={} timers={} executions={}",
            self.process_instances, self.tasks, self.jobs, self.timers, self.executions
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteResultCode {
    Ok,
    Fail,
    Skipped,
    Quarantined,
    DryRun,
}

impl DeleteResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
            Self::Quarantined => "QUARANTINED",
            Self::DryRun => "DRY_RUN",
        }
    }
}

impl fmt::Display for DeleteResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureTag {
    OptLock,
    Deadlock,
    Timeout,
    Verify,
    Npe,
    RetryExhausted,
    Interrupted,
    Other,
}

impl FailureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OptLock => "OPT_LOCK",
            Self::Deadlock => "DEADLOCK",
            Self::Timeout => "TIMEOUT",
            Self::Verify => "VERIFY",
            Self::Npe => "NPE",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::Interrupted => "INTERRUPTED",
            Self::Other => "OTHER",
        }
    }

    pub fn for_error(err: &EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Conflict => Self::OptLock,
            EngineErrorKind::Timeout if err.is_deadlock() => Self::Deadlock,
            EngineErrorKind::Timeout => Self::Timeout,
            EngineErrorKind::KnownDefect => Self::Npe,
            EngineErrorKind::NotFound | EngineErrorKind::Other => Self::Other,
        }
    }
}

impl fmt::Display for FailureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one delete attempt sequence for a single instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub instance_id: String,
    pub result: DeleteResultCode,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
    pub tag: Option<FailureTag>,
    /// Last residue snapshot, when verification ran.
    pub verification: Option<VerificationSnapshot>,
}

impl DeleteOutcome {
    fn with(
        instance_id: &str,
        result: DeleteResultCode,
        error: Option<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            result,
            error,
            attempts,
            duration,
            tag: None,
            verification: None,
        }
    }

    pub fn ok(instance_id: &str, attempts: u32, duration: Duration) -> Self {
        Self::with(instance_id, DeleteResultCode::Ok, None, attempts, duration)
    }

    pub fn skipped(
        instance_id: &str,
        reason: impl Into<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self::with(
            instance_id,
            DeleteResultCode::Skipped,
            Some(reason.into()),
            attempts,
            duration,
        )
    }

    pub fn fail(
        instance_id: &str,
        error: impl Into<String>,
        attempts: u32,
        duration: Duration,
        tag: FailureTag,
    ) -> Self {
        Self {
            tag: Some(tag),
            ..Self::with(
                instance_id,
                DeleteResultCode::Fail,
                Some(error.into()),
                attempts,
                duration,
            )
        }
    }

    pub fn quarantined(
        instance_id: &str,
        error: impl Into<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            tag: Some(FailureTag::Npe),
            ..Self::with(
                instance_id,
                DeleteResultCode::Quarantined,
                Some(error.into()),
                attempts,
                duration,
            )
        }
    }

    pub fn dry_run(instance_id: &str) -> Self {
        Self::with(
            instance_id,
            DeleteResultCode::DryRun,
            None,
            0,
            Duration::ZERO,
        )
    }

    pub fn with_verification(mut self, snapshot: Option<VerificationSnapshot>) -> Self {
        self.verification = snapshot;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == DeleteResultCode::Ok
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}
