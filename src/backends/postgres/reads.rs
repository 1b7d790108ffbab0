//! Read queries against runtime, history and identity tables.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{PostgresEngine, SUSPENSION_STATE_ACTIVE, non_negative, utc};
use crate::backends::base::{
    EngineResult, ExecutionRecord, HistoricInstance, HistoryQuery, JobRecord, TaskRecord,
    UserRecord,
};

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn historic_from_row(row: &PgRow) -> Result<HistoricInstance, sqlx::Error> {
    Ok(HistoricInstance {
        id: row.try_get("id")?,
        definition_id: row.try_get("definition_id")?,
        definition_key: row.try_get("definition_key")?,
        start_time: utc(row.try_get::<Option<NaiveDateTime>, _>("start_time")?),
        start_user_id: row.try_get("start_user_id")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, sqlx::Error> {
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        process_instance_id: row.try_get("process_instance_id")?,
        activity_id: row.try_get("activity_id")?,
        super_execution_id: row.try_get("super_execution_id")?,
    })
}

impl PostgresEngine {
    fn history_select(&self) -> String {
        format!(
            r#"
            SELECT h.PROC_INST_ID_ AS id,
                   h.PROC_DEF_ID_ AS definition_id,
                   d.KEY_ AS definition_key,
                   h.START_TIME_ AS start_time,
                   h.START_USER_ID_ AS start_user_id
            FROM {history} h
            LEFT JOIN {definition} d ON d.ID_ = h.PROC_DEF_ID_
            "#,
            history = self.tables.history_instance,
            definition = self.tables.definition,
        )
    }

    pub(super) async fn list_unfinished_history_impl(
        &self,
        query: &HistoryQuery,
    ) -> EngineResult<Vec<HistoricInstance>> {
        self.count_query("select:history_unfinished");
        let sql = format!(
            r#"
            {select}
            WHERE h.END_TIME_ IS NULL
              AND h.START_TIME_ < $1
              AND ($2::text IS NULL OR d.KEY_ = $2)
              AND ($3::text IS NULL OR h.START_USER_ID_ = $3)
            ORDER BY h.START_TIME_ ASC, h.PROC_INST_ID_ ASC
            OFFSET $4 LIMIT $5
            "#,
            select = self.history_select(),
        );
        let rows = sqlx::query(&sql)
            .bind(query.started_before.naive_utc())
            .bind(query.definition_key.as_deref())
            .bind(query.started_by.as_deref())
            .bind(as_i64(query.offset))
            .bind(as_i64(query.limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(historic_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub(super) async fn find_history_by_ids_impl(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<HistoricInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.count_query("select:history_by_ids");
        let sql = format!(
            "{select} WHERE h.PROC_INST_ID_ = ANY($1)",
            select = self.history_select()
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter()
            .map(historic_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub(super) async fn list_active_instance_ids_impl(
        &self,
        offset: usize,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        self.count_query("select:active_instances");
        let sql = format!(
            r#"
            SELECT ID_ FROM {execution}
            WHERE ID_ = PROC_INST_ID_
              AND PARENT_ID_ IS NULL
              AND SUSPENSION_STATE_ = $1
            ORDER BY ID_
            OFFSET $2 LIMIT $3
            "#,
            execution = self.tables.execution,
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .bind(SUSPENSION_STATE_ACTIVE)
            .bind(as_i64(offset))
            .bind(as_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub(super) async fn find_active_instance_ids_impl(
        &self,
        ids: &[String],
    ) -> EngineResult<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.count_query("select:active_by_ids");
        let sql = format!(
            r#"
            SELECT ID_ FROM {execution}
            WHERE ID_ = ANY($1)
              AND PARENT_ID_ IS NULL
              AND SUSPENSION_STATE_ = $2
            "#,
            execution = self.tables.execution,
        );
        let active = sqlx::query_scalar::<_, String>(&sql)
            .bind(ids)
            .bind(SUSPENSION_STATE_ACTIVE)
            .fetch_all(&self.pool)
            .await?;
        Ok(active.into_iter().collect())
    }

    pub(super) async fn is_active_impl(&self, id: &str) -> EngineResult<bool> {
        self.count_query("select:is_active");
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM {execution}
                WHERE ID_ = $1 AND PARENT_ID_ IS NULL AND SUSPENSION_STATE_ = $2
            )
            "#,
            execution = self.tables.execution,
        );
        let active = sqlx::query_scalar::<_, bool>(&sql)
            .bind(id)
            .bind(SUSPENSION_STATE_ACTIVE)
            .fetch_one(&self.pool)
            .await?;
        Ok(active)
    }

    /// `column` is either `PROC_INST_ID_` or `ID_`.
    pub(super) async fn list_executions_impl(
        &self,
        column: &'static str,
        ids: &[String],
    ) -> EngineResult<Vec<ExecutionRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.count_query("select:executions");
        let sql = format!(
            r#"
            SELECT ID_ AS id,
                   PROC_INST_ID_ AS process_instance_id,
                   ACT_ID_ AS activity_id,
                   SUPER_EXEC_ AS super_execution_id
            FROM {execution}
            WHERE {column} = ANY($1)
            "#,
            execution = self.tables.execution,
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub(super) async fn list_open_tasks_impl(
        &self,
        ids: &[String],
    ) -> EngineResult<Vec<TaskRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.count_query("select:open_tasks");
        let sql = format!(
            r#"
            SELECT ID_, PROC_INST_ID_, NAME_, ASSIGNEE_, CREATE_TIME_
            FROM {task}
            WHERE PROC_INST_ID_ = ANY($1) AND SUSPENSION_STATE_ = $2
            ORDER BY CREATE_TIME_ ASC
            "#,
            task = self.tables.task,
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(SUSPENSION_STATE_ACTIVE)
            .fetch_all(&self.pool)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(TaskRecord {
                id: row.try_get("id_")?,
                process_instance_id: row.try_get("proc_inst_id_")?,
                name: row.try_get("name_")?,
                assignee: row.try_get("assignee_")?,
                create_time: utc(row.try_get::<Option<NaiveDateTime>, _>("create_time_")?),
            });
        }
        Ok(tasks)
    }

    pub(super) async fn list_job_rows_impl(
        &self,
        table: &str,
        ids: &[String],
    ) -> EngineResult<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.count_query("select:job_rows");
        let sql = format!(
            "SELECT ID_, PROCESS_INSTANCE_ID_, DUEDATE_ FROM {table} WHERE PROCESS_INSTANCE_ID_ = ANY($1)"
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(JobRecord {
                id: row.try_get("id_")?,
                process_instance_id: row.try_get("process_instance_id_")?,
                due_date: utc(row.try_get::<Option<NaiveDateTime>, _>("duedate_")?),
            });
        }
        Ok(jobs)
    }

    pub(super) async fn find_starter_user_id_impl(&self, id: &str) -> EngineResult<Option<String>> {
        self.count_query("select:starter_link");
        let sql = format!(
            r#"
            SELECT USER_ID_ FROM {link}
            WHERE PROC_INST_ID_ = $1 AND TYPE_ = 'starter' AND USER_ID_ IS NOT NULL
            LIMIT 1
            "#,
            link = self.tables.identity_link,
        );
        let user_id = sqlx::query_scalar::<_, String>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user_id)
    }

    pub(super) async fn find_users_impl(&self, user_ids: &[String]) -> EngineResult<Vec<UserRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.count_query("select:users");
        let sql = format!(
            "SELECT ID_, FIRST_, LAST_, EMAIL_ FROM {user} WHERE ID_ = ANY($1)",
            user = self.tables.user,
        );
        let rows = sqlx::query(&sql)
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            users.push(UserRecord {
                id: row.try_get("id_")?,
                first_name: row.try_get("first_")?,
                last_name: row.try_get("last_")?,
                email: row.try_get("email_")?,
            });
        }
        Ok(users)
    }

    /// Names recorded in activity history for the definition. Activities
    /// never reached by any instance have no row and stay unnamed.
    pub(super) async fn find_activity_names_impl(
        &self,
        definition_id: &str,
    ) -> EngineResult<HashMap<String, String>> {
        self.count_query("select:activity_names");
        let sql = format!(
            r#"
            SELECT ACT_ID_, MAX(ACT_NAME_) FROM {activity}
            WHERE PROC_DEF_ID_ = $1 AND ACT_ID_ IS NOT NULL AND ACT_NAME_ IS NOT NULL
            GROUP BY ACT_ID_
            "#,
            activity = self.tables.history_activity,
        );
        let rows = sqlx::query_as::<_, (String, String)>(&sql)
            .bind(definition_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub(super) async fn count_rows_impl(
        &self,
        label: &str,
        sql: &str,
        id: &str,
    ) -> EngineResult<u64> {
        self.count_query(label);
        let count = sqlx::query_scalar::<_, i64>(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(non_negative(count))
    }
}
