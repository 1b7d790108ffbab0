//! Batched resolution of auxiliary data for one page of history rows.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backends::{
    EngineGateway, EngineResult, HistoricInstance, JobRecord, TaskRecord, UserRecord,
};

/// How job and timer counts are fetched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrefetchStrategy {
    /// One set query per chunk of ids.
    #[default]
    Batched,
    /// One listing per instance; for engines without set queries.
    PerInstance,
}

impl FromStr for PrefetchStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "batched" | "native" | "sql" => Ok(Self::Batched),
            "per-instance" | "per_instance" | "api" => Ok(Self::PerInstance),
            other => Err(format!("unknown query strategy '{other}'")),
        }
    }
}

/// Job and timer totals for one instance; overdue means due strictly before
/// scan time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub jobs: u64,
    pub overdue_jobs: u64,
    pub timers: u64,
    pub overdue_timers: u64,
}

#[derive(Debug, Default)]
pub struct Prefetched {
    pub active_ids: HashSet<String>,
    pub activity_ids: HashMap<String, Vec<String>>,
    /// Sub-process instance id to the instance that called it.
    pub parents: HashMap<String, String>,
    pub tasks: HashMap<String, Vec<TaskRecord>>,
    pub pending: HashMap<String, PendingWork>,
    pub users: HashMap<String, UserRecord>,
}

impl Prefetched {
    pub fn pending_for(&self, id: &str) -> PendingWork {
        self.pending.get(id).copied().unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct Prefetcher {
    engine: Arc<dyn EngineGateway>,
    strategy: PrefetchStrategy,
    in_clause_limit: usize,
}

impl Prefetcher {
    pub fn new(
        engine: Arc<dyn EngineGateway>,
        strategy: PrefetchStrategy,
        in_clause_limit: usize,
    ) -> Self {
        Self {
            engine,
            strategy,
            in_clause_limit: in_clause_limit.max(1),
        }
    }

    pub async fn prefetch(
        &self,
        page: &[HistoricInstance],
        now: DateTime<Utc>,
    ) -> EngineResult<Prefetched> {
        let mut data = Prefetched::default();
        let ids: Vec<String> = page.iter().map(|h| h.id.clone()).collect();
        if ids.is_empty() {
            return Ok(data);
        }

        for chunk in ids.chunks(self.in_clause_limit) {
            data.active_ids
                .extend(self.engine.find_active_instance_ids(chunk).await?);
        }

        let mut called_from: HashMap<String, String> = HashMap::new();
        for chunk in ids.chunks(self.in_clause_limit) {
            for execution in self.engine.list_executions_by_instance_ids(chunk).await? {
                if let Some(activity_id) = execution.activity_id {
                    data.activity_ids
                        .entry(execution.process_instance_id.clone())
                        .or_default()
                        .push(activity_id);
                }
                if let Some(super_execution_id) = execution.super_execution_id {
                    called_from.insert(super_execution_id, execution.process_instance_id);
                }
            }
        }
        if !called_from.is_empty() {
            let super_ids: Vec<String> = called_from.keys().cloned().collect();
            for chunk in super_ids.chunks(self.in_clause_limit) {
                for caller in self.engine.list_executions_by_ids(chunk).await? {
                    if let Some(child) = called_from.get(&caller.id) {
                        data.parents
                            .insert(child.clone(), caller.process_instance_id);
                    }
                }
            }
        }

        for chunk in ids.chunks(self.in_clause_limit) {
            for task in self.engine.list_open_tasks(chunk).await? {
                data.tasks
                    .entry(task.process_instance_id.clone())
                    .or_default()
                    .push(task);
            }
        }

        self.count_pending(&ids, now, &mut data.pending).await?;

        let starters: Vec<String> = page
            .iter()
            .filter_map(|h| h.start_user_id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for chunk in starters.chunks(self.in_clause_limit) {
            for user in self.engine.find_users(chunk).await? {
                data.users.insert(user.id.clone(), user);
            }
        }

        debug!(
            page = ids.len(),
            active = data.active_ids.len(),
            subprocesses = data.parents.len(),
            strategy = ?self.strategy,
            "prefetched page"
        );
        Ok(data)
    }

    async fn count_pending(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
        pending: &mut HashMap<String, PendingWork>,
    ) -> EngineResult<()> {
        match self.strategy {
            PrefetchStrategy::Batched => {
                for chunk in ids.chunks(self.in_clause_limit) {
                    let jobs = self.engine.list_jobs(chunk).await?;
                    tally(pending, &jobs, now, false);
                    let timers = self.engine.list_timers(chunk).await?;
                    tally(pending, &timers, now, true);
                }
            }
            PrefetchStrategy::PerInstance => {
                for id in ids {
                    let single = std::slice::from_ref(id);
                    let jobs = self.engine.list_jobs(single).await?;
                    tally(pending, &jobs, now, false);
                    let timers = self.engine.list_timers(single).await?;
                    tally(pending, &timers, now, true);
                }
            }
        }
        Ok(())
    }
}

fn tally(
    pending: &mut HashMap<String, PendingWork>,
    rows: &[JobRecord],
    now: DateTime<Utc>,
    timers: bool,
) {
    for row in rows {
        let entry = pending.entry(row.process_instance_id.clone()).or_default();
        let overdue = row.due_date.is_some_and(|due| due < now);
        if timers {
            entry.timers += 1;
            entry.overdue_timers += u64::from(overdue);
        } else {
            entry.jobs += 1;
            entry.overdue_jobs += u64::from(overdue);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::backends::{InstanceSeed, MemoryEngine};

    async fn page(engine: &MemoryEngine, ids: &[&str]) -> Vec<HistoricInstance> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        engine.find_history_by_ids(&ids).await.unwrap()
    }

    fn seeded(now: DateTime<Utc>) -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.add_user("alice", Some("Alice"), Some("Ng"));
        engine.seed(
            InstanceSeed::new("root", "order")
                .started_at(now - Duration::hours(20))
                .started_by("alice")
                .at_activity("callReview"),
        );
        engine.seed(
            InstanceSeed::new("child", "review")
                .started_at(now - Duration::hours(19))
                .child_of("root")
                .with_job(Some(now - Duration::minutes(1)))
                .with_job(Some(now + Duration::hours(1)))
                .with_timer(Some(now + Duration::hours(2)))
                .with_task("Check", Some("bob"), now - Duration::hours(3)),
        );
        engine
    }

    #[tokio::test]
    async fn test_batched_prefetch_resolves_page() {
        let now = Utc::now();
        let engine = seeded(now);
        let prefetcher = Prefetcher::new(Arc::new(engine.clone()), PrefetchStrategy::Batched, 1);

        let data = prefetcher
            .prefetch(&page(&engine, &["root", "child"]).await, now)
            .await
            .unwrap();

        assert!(data.active_ids.contains("root"));
        assert!(data.active_ids.contains("child"));
        assert_eq!(data.parents.get("child").map(String::as_str), Some("root"));
        assert_eq!(data.activity_ids["root"], vec!["callReview".to_string()]);
        assert_eq!(data.tasks["child"].len(), 1);
        assert_eq!(
            data.pending_for("child"),
            PendingWork {
                jobs: 2,
                overdue_jobs: 1,
                timers: 1,
                overdue_timers: 0,
            }
        );
        assert_eq!(data.pending_for("root"), PendingWork::default());
        assert!(data.users.contains_key("alice"));
    }

    #[tokio::test]
    async fn test_strategies_agree() {
        let now = Utc::now();
        let engine = seeded(now);
        let rows = page(&engine, &["root", "child"]).await;

        let batched = Prefetcher::new(Arc::new(engine.clone()), PrefetchStrategy::Batched, 50)
            .prefetch(&rows, now)
            .await
            .unwrap();
        let single = Prefetcher::new(Arc::new(engine), PrefetchStrategy::PerInstance, 50)
            .prefetch(&rows, now)
            .await
            .unwrap();

        assert_eq!(batched.pending, single.pending);
        assert_eq!(batched.parents, single.parents);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "native".parse::<PrefetchStrategy>().unwrap(),
            PrefetchStrategy::Batched
        );
        assert_eq!(
            "API".parse::<PrefetchStrategy>().unwrap(),
            PrefetchStrategy::PerInstance
        );
        assert!("other".parse::<PrefetchStrategy>().is_err());
    }
}
