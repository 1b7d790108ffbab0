//! Postgres engine reading and mutating Flowable's tables directly.

mod lifecycle;
mod reads;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::base::{
    EngineError, EngineErrorKind, EngineGateway, EngineResult, ExecutionRecord, HistoricInstance,
    HistoryQuery, JobRecord, TaskRecord, UserRecord,
};

const SERIALIZATION_FAILURE_SQLSTATE: &str = "40001";
const DEADLOCK_SQLSTATE: &str = "40P01";
const LOCK_NOT_AVAILABLE_SQLSTATE: &str = "55P03";
const QUERY_CANCELED_SQLSTATE: &str = "57014";
const FOREIGN_KEY_VIOLATION_SQLSTATE: &str = "23503";

const SUSPENSION_STATE_ACTIVE: i32 = 1;
const SUSPENSION_STATE_SUSPENDED: i32 = 2;

/// Fully qualified Flowable table names for a given prefix.
#[derive(Clone, Debug)]
pub struct FlowableTables {
    pub execution: String,
    pub task: String,
    pub job: String,
    pub timer_job: String,
    pub suspended_job: String,
    pub deadletter_job: String,
    pub external_job: String,
    pub identity_link: String,
    pub variable: String,
    pub event_subscription: String,
    pub activity_instance: String,
    pub history_instance: String,
    pub history_activity: String,
    pub history_task: String,
    pub history_variable: String,
    pub history_identity_link: String,
    pub definition: String,
    pub user: String,
}

impl FlowableTables {
    pub fn with_prefix(prefix: &str) -> Self {
        let table = |name: &str| format!("{prefix}{name}");
        Self {
            execution: table("RU_EXECUTION"),
            task: table("RU_TASK"),
            job: table("RU_JOB"),
            timer_job: table("RU_TIMER_JOB"),
            suspended_job: table("RU_SUSPENDED_JOB"),
            deadletter_job: table("RU_DEADLETTER_JOB"),
            external_job: table("RU_EXTERNAL_JOB"),
            identity_link: table("RU_IDENTITYLINK"),
            variable: table("RU_VARIABLE"),
            event_subscription: table("RU_EVENT_SUBSCR"),
            activity_instance: table("RU_ACTINST"),
            history_instance: table("HI_PROCINST"),
            history_activity: table("HI_ACTINST"),
            history_task: table("HI_TASKINST"),
            history_variable: table("HI_VARINST"),
            history_identity_link: table("HI_IDENTITYLINK"),
            definition: table("RE_PROCDEF"),
            user: table("ID_USER"),
        }
    }
}

impl Default for FlowableTables {
    fn default() -> Self {
        Self::with_prefix("ACT_")
    }
}

/// Engine gateway backed by the Flowable schema in Postgres.
#[derive(Clone)]
pub struct PostgresEngine {
    pool: PgPool,
    tables: Arc<FlowableTables>,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl PostgresEngine {
    pub fn new(pool: PgPool, table_prefix: &str) -> Self {
        Self {
            pool,
            tables: Arc::new(FlowableTables::with_prefix(table_prefix)),
            query_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a pool against an existing engine database. The schema is owned
    /// by the engine, so no migrations run here.
    pub async fn connect(
        dsn: &str,
        table_prefix: &str,
        max_connections: u32,
    ) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(Self::new(pool, table_prefix))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &FlowableTables {
        &self.tables
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    fn count_query(&self, label: &str) {
        let mut guard = self.query_counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }
}

/// Flowable stores timestamps without a zone; they are written in UTC.
fn utc(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|naive| naive.and_utc())
}

fn non_negative(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                match db_err.code().as_deref() {
                    Some(SERIALIZATION_FAILURE_SQLSTATE) => {
                        EngineError::new(EngineErrorKind::Conflict, message)
                    }
                    Some(
                        DEADLOCK_SQLSTATE | LOCK_NOT_AVAILABLE_SQLSTATE | QUERY_CANCELED_SQLSTATE,
                    ) => EngineError::new(EngineErrorKind::Timeout, message),
                    Some(FOREIGN_KEY_VIOLATION_SQLSTATE) => EngineError::new(
                        EngineErrorKind::Other,
                        format!("still referenced by another instance: {message}"),
                    ),
                    _ => EngineError::from_message(message),
                }
            }
            sqlx::Error::PoolTimedOut => EngineError::timeout(err.to_string()),
            sqlx::Error::RowNotFound => EngineError::not_found(err.to_string()),
            _ => EngineError::from_message(err.to_string()),
        }
    }
}

#[async_trait]
impl EngineGateway for PostgresEngine {
    async fn list_unfinished_history(
        &self,
        query: &HistoryQuery,
    ) -> EngineResult<Vec<HistoricInstance>> {
        self.list_unfinished_history_impl(query).await
    }

    async fn find_history_by_ids(&self, ids: &[String]) -> EngineResult<Vec<HistoricInstance>> {
        self.find_history_by_ids_impl(ids).await
    }

    async fn list_active_instance_ids(
        &self,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        self.list_active_instance_ids_impl(offset, limit).await
    }

    async fn find_active_instance_ids(&self, ids: &[String]) -> EngineResult<HashSet<String>> {
        self.find_active_instance_ids_impl(ids).await
    }

    async fn is_active(&self, id: &str) -> EngineResult<bool> {
        self.is_active_impl(id).await
    }

    async fn list_executions_by_instance_ids(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>> {
        self.list_executions_impl("PROC_INST_ID_", ids).await
    }

    async fn list_executions_by_ids(
        &self,
        execution_ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>> {
        self.list_executions_impl("ID_", execution_ids).await
    }

    async fn list_open_tasks(&self, ids: &[String]) -> EngineResult<Vec<TaskRecord>> {
        self.list_open_tasks_impl(ids).await
    }

    async fn list_jobs(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>> {
        self.list_job_rows_impl(&self.tables.job, ids).await
    }

    async fn list_timers(&self, ids: &[String]) -> EngineResult<Vec<JobRecord>> {
        self.list_job_rows_impl(&self.tables.timer_job, ids).await
    }

    async fn find_starter_user_id(&self, id: &str) -> EngineResult<Option<String>> {
        self.find_starter_user_id_impl(id).await
    }

    async fn find_users(&self, user_ids: &[String]) -> EngineResult<Vec<UserRecord>> {
        self.find_users_impl(user_ids).await
    }

    async fn find_activity_names(
        &self,
        definition_id: &str,
    ) -> EngineResult<HashMap<String, String>> {
        self.find_activity_names_impl(definition_id).await
    }

    async fn count_process_instances(&self, id: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE ID_ = $1 AND PARENT_ID_ IS NULL",
            self.tables.execution
        );
        self.count_rows_impl("count:process_instances", &sql, id)
            .await
    }

    async fn count_tasks(&self, id: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE PROC_INST_ID_ = $1",
            self.tables.task
        );
        self.count_rows_impl("count:tasks", &sql, id).await
    }

    async fn count_jobs(&self, id: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
            self.tables.job
        );
        self.count_rows_impl("count:jobs", &sql, id).await
    }

    async fn count_timers(&self, id: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
            self.tables.timer_job
        );
        self.count_rows_impl("count:timers", &sql, id).await
    }

    async fn count_executions(&self, id: &str) -> EngineResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE PROC_INST_ID_ = $1",
            self.tables.execution
        );
        self.count_rows_impl("count:executions", &sql, id).await
    }

    async fn suspend_instance(&self, id: &str) -> EngineResult<()> {
        self.suspend_instance_impl(id).await
    }

    async fn delete_instance(&self, id: &str, reason: &str) -> EngineResult<()> {
        self.delete_instance_impl(id, reason).await
    }

    async fn delete_history(&self, id: &str) -> EngineResult<()> {
        self.delete_history_impl(id).await
    }
}
