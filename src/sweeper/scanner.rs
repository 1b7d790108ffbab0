//! Paged discovery of long-running instances.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{Candidate, FilterCriteria, TaskSummary, whole_hours_between};
use super::prefetch::{Prefetched, Prefetcher};
use crate::backends::{EngineGateway, EngineResult, HistoricInstance, HistoryQuery};

pub const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Clone, Debug)]
pub struct ScannerConfig {
    pub max_per_run: usize,
    pub allow_list: HashSet<String>,
    pub deny_list: HashSet<String>,
    pub include_subprocesses: bool,
    pub page_size: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_per_run: 5000,
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            include_subprocesses: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ScannerConfig {
    /// Unknown keys are never allowed; deny wins over allow.
    pub fn is_key_allowed(&self, key: Option<&str>) -> bool {
        let Some(key) = key else {
            return false;
        };
        if self.deny_list.contains(key) {
            return false;
        }
        self.allow_list.is_empty() || self.allow_list.contains(key)
    }
}

#[derive(Clone)]
pub struct Scanner {
    engine: Arc<dyn EngineGateway>,
    prefetcher: Prefetcher,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(engine: Arc<dyn EngineGateway>, prefetcher: Prefetcher, config: ScannerConfig) -> Self {
        Self {
            engine,
            prefetcher,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineGateway> {
        &self.engine
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Unfinished instances started before `cutoff`, capped at `max_per_run`.
    ///
    /// When the history query cannot run at all and nothing was found, the
    /// runtime tables are scanned instead.
    pub async fn scan(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        criteria: Option<&FilterCriteria>,
    ) -> EngineResult<Vec<Candidate>> {
        let max = self.config.max_per_run;
        let page_size = self.config.page_size.max(1);
        let mut results = Vec::new();
        let mut offset = 0;
        let mut history_available = true;

        while results.len() < max {
            let query = HistoryQuery {
                started_before: cutoff,
                definition_key: criteria.and_then(|c| c.definition_key()).map(str::to_string),
                started_by: criteria.and_then(|c| c.started_by()).map(str::to_string),
                offset,
                limit: page_size,
            };
            let page = match self.engine.list_unfinished_history(&query).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, "history query failed; falling back to runtime-only scan");
                    history_available = false;
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            let prefetched = self.prefetcher.prefetch(&page, now).await?;
            for historic in &page {
                if results.len() >= max {
                    break;
                }
                if !matches_base_filters(historic, criteria) {
                    continue;
                }
                if let Some(candidate) = self
                    .build_candidate(historic, cutoff, now, &prefetched, true)
                    .await
                {
                    results.push(candidate);
                }
            }
            if page.len() < page_size {
                break;
            }
            offset += page_size;
        }

        if !history_available && results.is_empty() {
            results = self.scan_runtime_fallback(cutoff, now, criteria).await?;
        }
        info!(candidates = results.len(), %cutoff, "scan complete");
        Ok(results)
    }

    /// Resolve an explicit id list. Blank and repeated ids are ignored; ids
    /// newer than `cutoff` are skipped unless `force` is set.
    pub async fn scan_selected(
        &self,
        ids: &[String],
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        force: bool,
    ) -> EngineResult<Vec<Candidate>> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            let pid = id.trim();
            if pid.is_empty() || !seen.insert(pid.to_string()) {
                continue;
            }
            let historic = match self.engine.find_history_by_ids(&[pid.to_string()]).await {
                Ok(mut rows) => rows.pop(),
                Err(err) => {
                    warn!(instance_id = %pid, error = %err, "history lookup failed");
                    None
                }
            };
            let Some(historic) = historic else {
                warn!(instance_id = %pid, "history record not found");
                continue;
            };
            if !force && historic.start_time.is_some_and(|start| start > cutoff) {
                info!(instance_id = %pid, "skipping instance newer than cutoff");
                continue;
            }
            let page = std::slice::from_ref(&historic);
            let prefetched = self.prefetcher.prefetch(page, now).await?;
            if let Some(candidate) = self
                .build_candidate(&historic, cutoff, now, &prefetched, !force)
                .await
            {
                results.push(candidate);
            }
        }
        Ok(results)
    }

    async fn scan_runtime_fallback(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        criteria: Option<&FilterCriteria>,
    ) -> EngineResult<Vec<Candidate>> {
        let max = self.config.max_per_run;
        let page_size = self.config.page_size.max(1);
        let mut results = Vec::new();
        let mut offset = 0;
        while results.len() < max {
            let ids = self.engine.list_active_instance_ids(offset, page_size).await?;
            if ids.is_empty() {
                break;
            }
            let historics = self.engine.find_history_by_ids(&ids).await?;
            let prefetched = self.prefetcher.prefetch(&historics, now).await?;
            for historic in &historics {
                if results.len() >= max {
                    break;
                }
                if historic.start_time.is_none_or(|start| start > cutoff) {
                    continue;
                }
                if !matches_base_filters(historic, criteria) {
                    continue;
                }
                if let Some(candidate) = self
                    .build_candidate(historic, cutoff, now, &prefetched, true)
                    .await
                {
                    results.push(candidate);
                }
            }
            if ids.len() < page_size {
                break;
            }
            offset += page_size;
        }
        info!(candidates = results.len(), "runtime-only scan complete");
        Ok(results)
    }

    async fn build_candidate(
        &self,
        historic: &HistoricInstance,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        prefetched: &Prefetched,
        enforce_cutoff: bool,
    ) -> Option<Candidate> {
        let start_time = historic.start_time?;
        if enforce_cutoff && start_time > cutoff {
            return None;
        }
        // History can lag the runtime tables; only live instances qualify.
        if !prefetched.active_ids.contains(&historic.id) {
            return None;
        }
        if !self
            .config
            .is_key_allowed(historic.definition_key.as_deref())
        {
            return None;
        }

        let mut candidate = Candidate::new(historic.id.clone(), start_time, now);
        candidate.process_definition_id = historic.definition_id.clone();
        candidate.process_definition_key = historic.definition_key.clone();

        let starter = match historic
            .start_user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) => Some(id.to_string()),
            None => match self.engine.find_starter_user_id(&historic.id).await {
                Ok(found) => found,
                Err(err) => {
                    debug!(instance_id = %historic.id, error = %err, "starter lookup failed");
                    None
                }
            },
        };
        let user = match starter.as_ref() {
            Some(id) => match prefetched.users.get(id) {
                Some(user) => Some(user.clone()),
                // Starters found through identity links were not prefetched.
                None => match self.engine.find_users(std::slice::from_ref(id)).await {
                    Ok(mut users) => users.pop(),
                    Err(err) => {
                        debug!(instance_id = %historic.id, error = %err, "user lookup failed");
                        None
                    }
                },
            },
            None => None,
        };
        if let Some(user) = user {
            let name = format!(
                "{} {}",
                user.first_name.as_deref().unwrap_or(""),
                user.last_name.as_deref().unwrap_or("")
            );
            let name = name.trim();
            candidate.started_by_name = (!name.is_empty()).then(|| name.to_string());
            candidate.started_by_email = user.email.clone();
        }
        candidate.started_by_user_id = starter;

        if let Some(tasks) = prefetched.tasks.get(&historic.id) {
            candidate.open_tasks = tasks
                .iter()
                .map(|task| TaskSummary {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    assignee: task.assignee.clone(),
                    created: task.create_time,
                    age_hours: task
                        .create_time
                        .map(|created| whole_hours_between(created, now))
                        .unwrap_or(0),
                })
                .collect();
        }
        if let Some(activity_ids) = prefetched.activity_ids.get(&historic.id) {
            candidate.current_activity_ids = activity_ids.clone();
        }

        let pending = prefetched.pending_for(&historic.id);
        candidate.jobs = pending.jobs;
        candidate.overdue_jobs = pending.overdue_jobs;
        candidate.timers = pending.timers;
        candidate.overdue_timers = pending.overdue_timers;

        if let Some(parent) = prefetched.parents.get(&historic.id) {
            candidate.is_subprocess = true;
            candidate.parent_instance_id = Some(parent.clone());
        }
        if candidate.is_subprocess && !self.config.include_subprocesses {
            return None;
        }
        Some(candidate)
    }
}

fn matches_base_filters(historic: &HistoricInstance, criteria: Option<&FilterCriteria>) -> bool {
    let Some(criteria) = criteria else {
        return true;
    };
    if let Some(key) = criteria.definition_key()
        && historic.definition_key.as_deref() != Some(key)
    {
        return false;
    }
    if let Some(user) = criteria.started_by()
        && historic.start_user_id.as_deref() != Some(user)
    {
        return false;
    }
    true
}
