//! In-memory engine for tests and local dry runs.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::base::{
    EngineError, EngineGateway, EngineResult, ExecutionRecord, HistoricInstance, HistoryQuery,
    JobRecord, TaskRecord, UserRecord,
};

/// Lifecycle call observed by the memory engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    Suspend(String),
    Delete(String),
    DeleteHistory(String),
}

/// Everything needed to seed one workflow instance.
#[derive(Clone, Debug)]
pub struct InstanceSeed {
    pub id: String,
    pub definition_key: String,
    pub start_time: Option<DateTime<Utc>>,
    pub start_user_id: Option<String>,
    pub starter_link: Option<String>,
    /// Instance whose call activity spawned this one.
    pub parent: Option<String>,
    pub activity_ids: Vec<String>,
    pub tasks: Vec<TaskSeed>,
    pub job_due_dates: Vec<Option<DateTime<Utc>>>,
    pub timer_due_dates: Vec<Option<DateTime<Utc>>>,
    /// When false the instance only exists in history.
    pub running: bool,
}

#[derive(Clone, Debug)]
pub struct TaskSeed {
    pub name: String,
    pub assignee: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
}

impl InstanceSeed {
    pub fn new(id: impl Into<String>, definition_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            definition_key: definition_key.into(),
            start_time: None,
            start_user_id: None,
            starter_link: None,
            parent: None,
            activity_ids: Vec::new(),
            tasks: Vec::new(),
            job_due_dates: Vec::new(),
            timer_due_dates: Vec::new(),
            running: true,
        }
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn started_by(mut self, user_id: impl Into<String>) -> Self {
        self.start_user_id = Some(user_id.into());
        self
    }

    pub fn starter_link(mut self, user_id: impl Into<String>) -> Self {
        self.starter_link = Some(user_id.into());
        self
    }

    pub fn child_of(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn at_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_ids.push(activity_id.into());
        self
    }

    pub fn with_task(
        mut self,
        name: impl Into<String>,
        assignee: Option<&str>,
        create_time: DateTime<Utc>,
    ) -> Self {
        self.tasks.push(TaskSeed {
            name: name.into(),
            assignee: assignee.map(str::to_string),
            create_time: Some(create_time),
        });
        self
    }

    pub fn with_job(mut self, due_date: Option<DateTime<Utc>>) -> Self {
        self.job_due_dates.push(due_date);
        self
    }

    pub fn with_timer(mut self, due_date: Option<DateTime<Utc>>) -> Self {
        self.timer_due_dates.push(due_date);
        self
    }

    pub fn history_only(mut self) -> Self {
        self.running = false;
        self
    }
}

#[derive(Clone, Debug)]
struct HistoryRow {
    instance: HistoricInstance,
    end_time: Option<DateTime<Utc>>,
    delete_reason: Option<String>,
}

#[derive(Default)]
struct EngineState {
    history: BTreeMap<String, HistoryRow>,
    running: HashSet<String>,
    suspended: HashSet<String>,
    executions: Vec<ExecutionRecord>,
    tasks: Vec<TaskRecord>,
    jobs: Vec<JobRecord>,
    timers: Vec<JobRecord>,
    starter_links: HashMap<String, String>,
    users: HashMap<String, UserRecord>,
    activity_names: HashMap<String, HashMap<String, String>>,
    next_row: usize,
}

impl EngineState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_row += 1;
        format!("{prefix}-{}", self.next_row)
    }

    fn is_active(&self, id: &str) -> bool {
        self.running.contains(id) && !self.suspended.contains(id)
    }
}

#[derive(Default)]
struct Faults {
    fail_history_queries: AtomicBool,
    fail_reads: AtomicBool,
    delete_errors: Mutex<HashMap<String, VecDeque<EngineError>>>,
    suspend_errors: Mutex<HashMap<String, VecDeque<EngineError>>>,
    sticky_residue: Mutex<HashSet<String>>,
    history_queries: AtomicUsize,
    activity_name_queries: AtomicUsize,
}

/// Engine that keeps instances in memory, records lifecycle calls and can
/// inject failures.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
    faults: Arc<Faults>,
    calls: Arc<Mutex<Vec<EngineCall>>>,
    delete_delay: Arc<Mutex<Option<Duration>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: &str, first_name: Option<&str>, last_name: Option<&str>) {
        let mut state = self.state.lock().expect("engine state poisoned");
        state.users.insert(
            id.to_string(),
            UserRecord {
                id: id.to_string(),
                first_name: first_name.map(str::to_string),
                last_name: last_name.map(str::to_string),
                email: Some(format!("{id}@example.com")),
            },
        );
    }

    /// Give `activity_id` a display name under `definition_id`.
    pub fn name_activity(&self, definition_id: &str, activity_id: &str, name: &str) {
        let mut state = self.state.lock().expect("engine state poisoned");
        state
            .activity_names
            .entry(definition_id.to_string())
            .or_default()
            .insert(activity_id.to_string(), name.to_string());
    }

    pub fn seed(&self, seed: InstanceSeed) {
        let mut state = self.state.lock().expect("engine state poisoned");
        let id = seed.id.clone();
        state.history.insert(
            id.clone(),
            HistoryRow {
                instance: HistoricInstance {
                    id: id.clone(),
                    definition_id: Some(format!("{}:1", seed.definition_key)),
                    definition_key: Some(seed.definition_key.clone()),
                    start_time: seed.start_time,
                    start_user_id: seed.start_user_id.clone(),
                },
                end_time: None,
                delete_reason: None,
            },
        );
        if let Some(user_id) = seed.starter_link {
            state.starter_links.insert(id.clone(), user_id);
        }
        if !seed.running {
            return;
        }
        state.running.insert(id.clone());
        state.executions.push(ExecutionRecord {
            id: id.clone(),
            process_instance_id: id.clone(),
            activity_id: None,
            super_execution_id: seed.parent.clone(),
        });
        for activity_id in seed.activity_ids {
            let execution_id = state.next_id("exec");
            state.executions.push(ExecutionRecord {
                id: execution_id,
                process_instance_id: id.clone(),
                activity_id: Some(activity_id),
                super_execution_id: None,
            });
        }
        for task in seed.tasks {
            let task_id = state.next_id("task");
            state.tasks.push(TaskRecord {
                id: task_id,
                process_instance_id: id.clone(),
                name: Some(task.name),
                assignee: task.assignee,
                create_time: task.create_time,
            });
        }
        for due_date in seed.job_due_dates {
            let job_id = state.next_id("job");
            state.jobs.push(JobRecord {
                id: job_id,
                process_instance_id: id.clone(),
                due_date,
            });
        }
        for due_date in seed.timer_due_dates {
            let timer_id = state.next_id("timer");
            state.timers.push(JobRecord {
                id: timer_id,
                process_instance_id: id.clone(),
                due_date,
            });
        }
    }

    /// Fail the paged unfinished-history query until cleared. Lookups by id
    /// keep working.
    pub fn fail_history_queries(&self, enabled: bool) {
        self.faults
            .fail_history_queries
            .store(enabled, Ordering::SeqCst);
    }

    /// Fail every runtime read (executions, tasks, jobs, counts) until cleared.
    pub fn fail_reads(&self, enabled: bool) {
        self.faults.fail_reads.store(enabled, Ordering::SeqCst);
    }

    /// Queue errors returned by successive delete calls for `id`.
    pub fn fail_deletes(&self, id: &str, errors: impl IntoIterator<Item = EngineError>) {
        let mut guard = self
            .faults
            .delete_errors
            .lock()
            .expect("delete faults poisoned");
        guard.entry(id.to_string()).or_default().extend(errors);
    }

    pub fn fail_suspends(&self, id: &str, errors: impl IntoIterator<Item = EngineError>) {
        let mut guard = self
            .faults
            .suspend_errors
            .lock()
            .expect("suspend faults poisoned");
        guard.entry(id.to_string()).or_default().extend(errors);
    }

    /// Deleting `id` reports success but removes nothing.
    pub fn leave_residue(&self, id: &str) {
        self.faults
            .sticky_residue
            .lock()
            .expect("residue faults poisoned")
            .insert(id.to_string());
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        *self.delete_delay.lock().expect("delete delay poisoned") = Some(delay);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().expect("engine calls poisoned").clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn history_query_count(&self) -> usize {
        self.faults.history_queries.load(Ordering::SeqCst)
    }

    pub fn activity_name_query_count(&self) -> usize {
        self.faults.activity_name_queries.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .expect("engine state poisoned")
            .running
            .contains(id)
    }

    pub fn delete_reason(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .expect("engine state poisoned")
            .history
            .get(id)
            .and_then(|row| row.delete_reason.clone())
    }

    pub fn has_history(&self, id: &str) -> bool {
        self.state
            .lock()
            .expect("engine state poisoned")
            .history
            .contains_key(id)
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().expect("engine calls poisoned").push(call);
    }

    fn check_reads(&self) -> EngineResult<()> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::timeout("injected read failure"));
        }
        Ok(())
    }

    fn next_fault(
        queue: &Mutex<HashMap<String, VecDeque<EngineError>>>,
        id: &str,
    ) -> Option<EngineError> {
        queue
            .lock()
            .expect("fault queue poisoned")
            .get_mut(id)
            .and_then(VecDeque::pop_front)
    }

    fn by_instance<T: Clone>(
        rows: &[T],
        ids: &[String],
        instance_of: impl Fn(&T) -> &str,
    ) -> Vec<T> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        rows.iter()
            .filter(|row| wanted.contains(instance_of(row)))
            .cloned()
            .collect()
    }

    fn count_for<T>(rows: &[T], id: &str, instance_of: impl Fn(&T) -> &str) -> u64 {
        rows.iter().filter(|row| instance_of(row) == id).count() as u64
    }
}

#[async_trait]
impl EngineGateway for MemoryEngine {
    async fn list_unfinished_history(
        &self,
        query: &HistoryQuery,
    ) -> EngineResult<Vec<HistoricInstance>> {
        self.faults.history_queries.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_history_queries.load(Ordering::SeqCst) {
            return Err(EngineError::other("injected history query failure"));
        }
        let state = self.state.lock().expect("engine state poisoned");
        let mut rows: Vec<&HistoryRow> = state
            .history
            .values()
            .filter(|row| row.end_time.is_none())
            .filter(|row| {
                row.instance
                    .start_time
                    .is_some_and(|start| start < query.started_before)
            })
            .filter(|row| {
                query
                    .definition_key
                    .as_ref()
                    .is_none_or(|key| row.instance.definition_key.as_ref() == Some(key))
            })
            .filter(|row| {
                query
                    .started_by
                    .as_ref()
                    .is_none_or(|user| row.instance.start_user_id.as_ref() == Some(user))
            })
            .collect();
        rows.sort_by(|a, b| {
            a.instance
                .start_time
                .cmp(&b.instance.start_time)
                .then_with(|| a.instance.id.cmp(&b.instance.id))
        });
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|row| row.instance.clone())
            .collect())
    }

    async fn find_history_by_ids(&self, ids: &[String]) -> EngineResult<Vec<HistoricInstance>> {
        let state = self.state.lock().expect("engine state poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| state.history.get(id))
            .map(|row| row.instance.clone())
            .collect())
    }

    async fn list_active_instance_ids(
        &self,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        let mut ids: Vec<String> = state
            .running
            .iter()
            .filter(|id| state.is_active(id))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_active_instance_ids(&self, ids: &[String]) -> EngineResult<HashSet<String>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(ids
            .iter()
            .filter(|id| state.is_active(id))
            .cloned()
            .collect())
    }

    async fn is_active(&self, id: &str) -> EngineResult<bool> {
        self.check_reads()?;
        Ok(self
            .state
            .lock()
            .expect("engine state poisoned")
            .is_active(id))
    }

    async fn list_executions_by_instance_ids(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::by_instance(&state.executions, ids, |row| {
            &row.process_instance_id
        }))
    }

    async fn list_executions_by_ids(
        &self,
        execution_ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::by_instance(&state.executions, execution_ids, |row| {
            &row.id
        }))
    }

    async fn list_open_tasks(&self, ids: &[String]) -> EngineResult<Vec<TaskRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::by_instance(&state.tasks, ids, |row| &row.process_instance_id)
            .into_iter()
            .filter(|task| !state.suspended.contains(&task.process_instance_id))
            .collect())
    }

    async fn list_jobs(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::by_instance(&state.jobs, ids, |row| {
            &row.process_instance_id
        }))
    }

    async fn list_timers(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::by_instance(&state.timers, ids, |row| {
            &row.process_instance_id
        }))
    }

    async fn find_starter_user_id(&self, id: &str) -> EngineResult<Option<String>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(state.starter_links.get(id).cloned())
    }

    async fn find_users(&self, user_ids: &[String]) -> EngineResult<Vec<UserRecord>> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(user_ids
            .iter()
            .filter_map(|id| state.users.get(id))
            .cloned()
            .collect())
    }

    async fn find_activity_names(
        &self,
        definition_id: &str,
    ) -> EngineResult<HashMap<String, String>> {
        self.faults
            .activity_name_queries
            .fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(state
            .activity_names
            .get(definition_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_process_instances(&self, id: &str) -> EngineResult<u64> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(u64::from(state.running.contains(id)))
    }

    async fn count_tasks(&self, id: &str) -> EngineResult<u64> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::count_for(&state.tasks, id, |row| &row.process_instance_id))
    }

    async fn count_jobs(&self, id: &str) -> EngineResult<u64> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::count_for(&state.jobs, id, |row| &row.process_instance_id))
    }

    async fn count_timers(&self, id: &str) -> EngineResult<u64> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::count_for(&state.timers, id, |row| &row.process_instance_id))
    }

    async fn count_executions(&self, id: &str) -> EngineResult<u64> {
        self.check_reads()?;
        let state = self.state.lock().expect("engine state poisoned");
        Ok(Self::count_for(&state.executions, id, |row| {
            &row.process_instance_id
        }))
    }

    async fn suspend_instance(&self, id: &str) -> EngineResult<()> {
        self.record(EngineCall::Suspend(id.to_string()));
        if let Some(err) = Self::next_fault(&self.faults.suspend_errors, id) {
            return Err(err);
        }
        let mut state = self.state.lock().expect("engine state poisoned");
        if !state.running.contains(id) {
            return Err(EngineError::not_found(format!(
                "No process instance found for id '{id}'"
            )));
        }
        state.suspended.insert(id.to_string());
        Ok(())
    }

    async fn delete_instance(&self, id: &str, reason: &str) -> EngineResult<()> {
        self.record(EngineCall::Delete(id.to_string()));
        let delay = *self.delete_delay.lock().expect("delete delay poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = Self::next_fault(&self.faults.delete_errors, id) {
            return Err(err);
        }
        let sticky = self
            .faults
            .sticky_residue
            .lock()
            .expect("residue faults poisoned")
            .contains(id);
        let mut state = self.state.lock().expect("engine state poisoned");
        if !state.running.contains(id) {
            return Err(EngineError::not_found(format!(
                "No process instance found for id '{id}'"
            )));
        }
        if sticky {
            return Ok(());
        }
        state.running.remove(id);
        state.suspended.remove(id);
        state.executions.retain(|row| row.process_instance_id != id);
        state.tasks.retain(|row| row.process_instance_id != id);
        state.jobs.retain(|row| row.process_instance_id != id);
        state.timers.retain(|row| row.process_instance_id != id);
        if let Some(row) = state.history.get_mut(id) {
            row.end_time = Some(Utc::now());
            row.delete_reason = Some(reason.to_string());
        }
        Ok(())
    }

    async fn delete_history(&self, id: &str) -> EngineResult<()> {
        self.record(EngineCall::DeleteHistory(id.to_string()));
        let mut state = self.state.lock().expect("engine state poisoned");
        if state.history.remove(id).is_none() {
            return Err(EngineError::not_found(format!(
                "No historic process instance found for id '{id}'"
            )));
        }
        state.starter_links.remove(id);
        Ok(())
    }
}
