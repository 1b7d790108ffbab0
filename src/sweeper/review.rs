//! Operator-facing review: paged candidate listings, details and bulk
//! termination guarded by confirmation tokens.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::activity::{self, ActivityNames};
use super::audit::{AuditEvent, AuditSink};
use super::classifier::{ClassifierConfig, apply};
use super::model::{
    Candidate, Classification, DeleteMode, DeleteOutcome, FilterCriteria, RecommendedAction,
    TaskSummary, truncated,
};
use super::orchestrator::{DEFAULT_REASON, Orchestrator, RunOptions};
use super::scanner::Scanner;
use super::tokens;
use crate::backends::EngineError;

pub const DEFAULT_REQUEST_PAGE_SIZE: usize = 50;
const SUMMARY_TASK_CAP: usize = 5;
const SUMMARY_ACTIVITY_CAP: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Cleanup service disabled")]
    Disabled,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub default_hours: i64,
    pub max_page_size: usize,
    pub max_bulk_delete: usize,
    pub dry_run: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_hours: 6,
            max_page_size: 200,
            max_bulk_delete: 200,
            dry_run: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub wait: u64,
    pub escalate: u64,
    pub terminate: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: usize,
    pub size: usize,
    pub total_items: u64,
    pub total_pages: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub page: PageInfo,
    pub summary_counts: SummaryCounts,
}

/// Listing row: candidate fields with capped task and activity lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub process_instance_id: String,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub hours_running: i64,
    pub starter_user_id: Option<String>,
    pub starter_name: Option<String>,
    pub starter_email: Option<String>,
    pub subprocess: bool,
    pub parent_process_instance_id: Option<String>,
    pub open_tasks_count: usize,
    pub oldest_task_age_hours: Option<i64>,
    pub task_summaries: Vec<String>,
    pub active_activity_ids: Vec<String>,
    pub job_count: u64,
    pub overdue_job_count: u64,
    pub timer_count: u64,
    pub overdue_timer_count: u64,
    pub recommended_action: Option<RecommendedAction>,
    pub classification: Option<Classification>,
}

impl From<&Candidate> for ProcessSummary {
    fn from(c: &Candidate) -> Self {
        Self {
            process_instance_id: c.process_instance_id.clone(),
            process_definition_id: c.process_definition_id.clone(),
            process_definition_key: c.process_definition_key.clone(),
            start_time: c.start_time,
            hours_running: c.hours_running,
            starter_user_id: c.started_by_user_id.clone(),
            starter_name: c.started_by_name.clone(),
            starter_email: c.started_by_email.clone(),
            subprocess: c.is_subprocess,
            parent_process_instance_id: c.parent_instance_id.clone(),
            open_tasks_count: c.open_task_count(),
            oldest_task_age_hours: c.oldest_task_age_hours(),
            task_summaries: truncated(&c.tasks_short(), SUMMARY_TASK_CAP),
            active_activity_ids: truncated(&c.current_activity_ids, SUMMARY_ACTIVITY_CAP),
            job_count: c.jobs,
            overdue_job_count: c.overdue_jobs,
            timer_count: c.timers,
            overdue_timer_count: c.overdue_timers,
            recommended_action: c.recommended_action,
            classification: c.classification,
        }
    }
}

/// Single-instance view with the full task list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetail {
    pub process_instance_id: String,
    pub process_definition_id: Option<String>,
    pub process_definition_key: Option<String>,
    pub start_time: DateTime<Utc>,
    pub hours_running: i64,
    pub starter_user_id: Option<String>,
    pub starter_name: Option<String>,
    pub starter_email: Option<String>,
    pub subprocess: bool,
    pub parent_process_instance_id: Option<String>,
    pub tasks: Vec<TaskSummary>,
    pub active_activity_ids: Vec<String>,
    /// Display names for the ids above that have one.
    pub active_activity_names: BTreeMap<String, String>,
    pub job_count: u64,
    pub overdue_job_count: u64,
    pub timer_count: u64,
    pub overdue_timer_count: u64,
    pub recommended_action: Option<RecommendedAction>,
    pub classification: Option<Classification>,
}

impl From<Candidate> for ProcessDetail {
    fn from(c: Candidate) -> Self {
        Self {
            process_instance_id: c.process_instance_id,
            process_definition_id: c.process_definition_id,
            process_definition_key: c.process_definition_key,
            start_time: c.start_time,
            hours_running: c.hours_running,
            starter_user_id: c.started_by_user_id,
            starter_name: c.started_by_name,
            starter_email: c.started_by_email,
            subprocess: c.is_subprocess,
            parent_process_instance_id: c.parent_instance_id,
            tasks: c.open_tasks,
            active_activity_ids: c.current_activity_ids,
            active_activity_names: BTreeMap::new(),
            job_count: c.jobs,
            overdue_job_count: c.overdue_jobs,
            timer_count: c.timers,
            overdue_timer_count: c.overdue_timers,
            recommended_action: c.recommended_action,
            classification: c.classification,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub pid: String,
    pub result: String,
    pub error: Option<String>,
}

impl From<DeleteOutcome> for DeleteResult {
    fn from(outcome: DeleteOutcome) -> Self {
        Self {
            pid: outcome.instance_id,
            result: outcome.result.as_str().to_string(),
            error: outcome.error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    pub pids: Vec<String>,
    pub reason: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_verify() -> bool {
    true
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateAllRequest {
    pub hours: Option<i64>,
    pub action: Option<String>,
    pub proc_def_key: Option<String>,
    pub reason: Option<String>,
    pub token: Option<String>,
}

/// Running totals while folding one scan into a page.
#[derive(Debug)]
struct ScanSummary {
    page: usize,
    size: usize,
    items: Vec<ProcessSummary>,
    total_items: u64,
    counts: SummaryCounts,
}

impl ScanSummary {
    fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            items: Vec::new(),
            total_items: 0,
            counts: SummaryCounts::default(),
        }
    }

    fn push(mut self, candidate: &Candidate) -> Self {
        match candidate.recommended_action {
            Some(RecommendedAction::Wait) => self.counts.wait += 1,
            Some(RecommendedAction::Escalate) => self.counts.escalate += 1,
            Some(RecommendedAction::Terminate) => self.counts.terminate += 1,
            None => {}
        }
        let index = self.total_items as usize;
        self.total_items += 1;
        let start = self.page.saturating_mul(self.size);
        if index >= start && index < start.saturating_add(self.size) {
            self.items.push(ProcessSummary::from(candidate));
        }
        self
    }

    fn into_page(self) -> PageResult<ProcessSummary> {
        let size = self.size.max(1) as u64;
        let total_pages = self.total_items.div_ceil(size);
        PageResult {
            page: PageInfo {
                page: self.page,
                size: self.size,
                total_items: self.total_items,
                total_pages,
            },
            summary_counts: self.counts,
            items: self.items,
        }
    }
}

#[derive(Clone)]
pub struct ReviewService {
    scanner: Scanner,
    classifier: ClassifierConfig,
    orchestrator: Orchestrator,
    config: ReviewConfig,
    activity_names: ActivityNames,
}

impl ReviewService {
    pub fn new(
        scanner: Scanner,
        classifier: ClassifierConfig,
        orchestrator: Orchestrator,
        config: ReviewConfig,
    ) -> Self {
        let activity_names =
            ActivityNames::new(scanner.engine().clone(), activity::DEFAULT_CAPACITY);
        Self {
            scanner,
            classifier,
            orchestrator,
            config,
            activity_names,
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    pub async fn find_candidates(
        &self,
        criteria: &FilterCriteria,
    ) -> ServiceResult<PageResult<ProcessSummary>> {
        if !self.config.enabled {
            return Err(ServiceError::Disabled);
        }
        let size = match criteria.size {
            0 => DEFAULT_REQUEST_PAGE_SIZE,
            size => size,
        }
        .min(self.config.max_page_size);
        let candidates = self.scan_classified(criteria).await?;
        let summary = candidates
            .iter()
            .filter(|c| criteria.matches_action(c.action()) && criteria.matches_tasks(c))
            .fold(ScanSummary::new(criteria.page, size), ScanSummary::push);
        Ok(summary.into_page())
    }

    pub async fn summary_counts(&self, criteria: &FilterCriteria) -> ServiceResult<SummaryCounts> {
        if !self.config.enabled {
            return Err(ServiceError::Disabled);
        }
        let candidates = self.scan_classified(criteria).await?;
        Ok(candidates
            .iter()
            .filter(|c| criteria.matches_action(c.action()) && criteria.matches_tasks(c))
            .fold(ScanSummary::new(0, 0), ScanSummary::push)
            .counts)
    }

    /// Candidates matching every post-classification filter, unpaged.
    pub async fn matching_candidates(
        &self,
        criteria: &FilterCriteria,
    ) -> ServiceResult<Vec<Candidate>> {
        let mut candidates = self.scan_classified(criteria).await?;
        candidates.retain(|c| criteria.matches_action(c.action()) && criteria.matches_tasks(c));
        Ok(candidates)
    }

    pub async fn details(&self, id: &str, hours: Option<i64>) -> ServiceResult<ProcessDetail> {
        let hours = hours
            .filter(|h| *h > 0)
            .unwrap_or(self.config.default_hours);
        let candidate = self
            .load_classified(id, hours)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound("Process instance not active or outside filters".to_string())
            })?;
        let names = self
            .activity_names
            .resolve(
                candidate.process_definition_id.as_deref(),
                &candidate.current_activity_ids,
            )
            .await;
        let mut detail = ProcessDetail::from(candidate);
        detail.active_activity_names = names;
        Ok(detail)
    }

    /// Classified candidate at the default age cutoff, or `None` when the
    /// instance is gone, too young or filtered out.
    pub async fn load_candidate_for_delete(&self, id: &str) -> ServiceResult<Option<Candidate>> {
        self.load_classified(id, self.config.default_hours).await
    }

    /// Classify and record an `EVALUATE` event for each candidate.
    pub async fn evaluate(
        &self,
        mut candidates: Vec<Candidate>,
        actor: Option<&str>,
    ) -> Vec<Candidate> {
        let audit = self.orchestrator.audit();
        for candidate in &mut candidates {
            apply(candidate, &self.classifier);
            audit.record(&AuditEvent::evaluate(candidate).by(actor)).await;
        }
        candidates
    }

    pub async fn terminate_selected(
        &self,
        request: &TerminateRequest,
        actor: Option<&str>,
    ) -> ServiceResult<Vec<DeleteResult>> {
        if !tokens::is_valid_terminate(request.token.as_deref()) {
            return Err(ServiceError::BadRequest(
                "Invalid confirmation token".to_string(),
            ));
        }
        if request.pids.is_empty() {
            return Err(ServiceError::BadRequest(
                "No process instance IDs provided".to_string(),
            ));
        }
        if request.pids.len() > self.config.max_bulk_delete {
            return Err(ServiceError::BadRequest(
                "Too many process instances requested".to_string(),
            ));
        }
        self.delete_by_ids(
            &request.pids,
            request.reason.as_deref(),
            request.verify,
            actor,
        )
        .await
    }

    /// Terminates the first `max_bulk_delete` matches, always verifying.
    pub async fn terminate_all(
        &self,
        request: &TerminateAllRequest,
        actor: Option<&str>,
    ) -> ServiceResult<Vec<DeleteResult>> {
        if !tokens::is_valid_terminate_all(request.token.as_deref()) {
            return Err(ServiceError::BadRequest(
                "Invalid confirmation token".to_string(),
            ));
        }
        let criteria = FilterCriteria {
            hours: request.hours,
            action: request.action.clone(),
            definition_key: request.proc_def_key.clone(),
            page: 0,
            size: self.config.max_bulk_delete,
            ..FilterCriteria::default()
        };
        let page = self.find_candidates(&criteria).await?;
        let ids: Vec<String> = page
            .items
            .into_iter()
            .map(|item| item.process_instance_id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.delete_by_ids(&ids, request.reason.as_deref(), true, actor)
            .await
    }

    async fn delete_by_ids(
        &self,
        ids: &[String],
        reason: Option<&str>,
        verify: bool,
        actor: Option<&str>,
    ) -> ServiceResult<Vec<DeleteResult>> {
        let options = RunOptions {
            mode: DeleteMode::Selected,
            parallelism: 1,
            dry_run: self.config.dry_run,
            verify,
            reason: reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REASON)
                .to_string(),
            actor: actor.map(str::to_string),
        };

        let mut results = Vec::with_capacity(ids.len());
        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_candidate_for_delete(id).await? {
                Some(candidate) => candidates.push(candidate),
                None => {
                    let outcome = self.orchestrator.skip_unloadable(id, &options).await;
                    results.push(DeleteResult::from(outcome));
                }
            }
        }
        info!(
            requested = ids.len(),
            loaded = candidates.len(),
            dry_run = options.dry_run,
            "terminating selected instances"
        );
        let outcomes = self.orchestrator.run(&candidates, &options).await;
        results.extend(outcomes.into_iter().map(DeleteResult::from));
        Ok(results)
    }

    async fn scan_classified(&self, criteria: &FilterCriteria) -> ServiceResult<Vec<Candidate>> {
        let hours = criteria.hours_or(self.config.default_hours);
        let now = Utc::now();
        let cutoff = now - ChronoDuration::hours(hours);
        let mut candidates = self.scanner.scan(cutoff, now, Some(criteria)).await?;
        for candidate in &mut candidates {
            apply(candidate, &self.classifier);
        }
        Ok(candidates)
    }

    async fn load_classified(&self, id: &str, hours: i64) -> ServiceResult<Option<Candidate>> {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::hours(hours);
        let mut candidates = self
            .scanner
            .scan_selected(&[id.to_string()], cutoff, now, false)
            .await?;
        let Some(mut candidate) = candidates.pop() else {
            return Ok(None);
        };
        apply(&mut candidate, &self.classifier);
        Ok(Some(candidate))
    }
}
