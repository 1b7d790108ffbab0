//! Suspend and delete, each in its own transaction.

use tracing::debug;

use super::{PostgresEngine, SUSPENSION_STATE_SUSPENDED};
use crate::backends::base::{EngineError, EngineResult};

impl PostgresEngine {
    pub(super) async fn suspend_instance_impl(&self, id: &str) -> EngineResult<()> {
        self.count_query("update:suspend_instance");
        let mut tx = self.pool.begin().await?;
        let executions = sqlx::query(&format!(
            "UPDATE {} SET SUSPENSION_STATE_ = $2, REV_ = REV_ + 1 WHERE PROC_INST_ID_ = $1",
            self.tables.execution
        ))
        .bind(id)
        .bind(SUSPENSION_STATE_SUSPENDED)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if executions == 0 {
            tx.rollback().await?;
            return Err(EngineError::not_found(format!(
                "No process instance found for id '{id}'"
            )));
        }
        sqlx::query(&format!(
            "UPDATE {} SET SUSPENSION_STATE_ = $2, REV_ = REV_ + 1 WHERE PROC_INST_ID_ = $1",
            self.tables.task
        ))
        .bind(id)
        .bind(SUSPENSION_STATE_SUSPENDED)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(instance_id = %id, executions, "suspended instance");
        Ok(())
    }

    /// Delete the runtime rows of one instance and close its history row.
    ///
    /// Child rows go first so foreign keys hold inside the transaction. A
    /// sub-process still pointing at one of our executions fails the
    /// execution delete with a foreign key violation.
    pub(super) async fn delete_instance_impl(&self, id: &str, reason: &str) -> EngineResult<()> {
        self.count_query("delete:instance");
        let tables = &self.tables;
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_scalar::<_, String>(&format!(
            "SELECT ID_ FROM {} WHERE ID_ = $1 AND PARENT_ID_ IS NULL FOR UPDATE NOWAIT",
            tables.execution
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Err(EngineError::not_found(format!(
                "No process instance found for id '{id}'"
            )));
        }

        let statements = [
            format!(
                "DELETE FROM {link} WHERE PROC_INST_ID_ = $1 OR TASK_ID_ IN (SELECT ID_ FROM {task} WHERE PROC_INST_ID_ = $1)",
                link = tables.identity_link,
                task = tables.task,
            ),
            format!("DELETE FROM {} WHERE PROC_INST_ID_ = $1", tables.variable),
            format!("DELETE FROM {} WHERE PROC_INST_ID_ = $1", tables.task),
            format!(
                "DELETE FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
                tables.job
            ),
            format!(
                "DELETE FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
                tables.timer_job
            ),
            format!(
                "DELETE FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
                tables.suspended_job
            ),
            format!(
                "DELETE FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
                tables.deadletter_job
            ),
            format!(
                "DELETE FROM {} WHERE PROCESS_INSTANCE_ID_ = $1",
                tables.external_job
            ),
            format!(
                "DELETE FROM {} WHERE PROC_INST_ID_ = $1",
                tables.event_subscription
            ),
            format!(
                "DELETE FROM {} WHERE PROC_INST_ID_ = $1",
                tables.activity_instance
            ),
            format!("DELETE FROM {} WHERE PROC_INST_ID_ = $1", tables.execution),
        ];
        let mut removed = 0u64;
        for sql in &statements {
            removed += sqlx::query(sql)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET END_TIME_ = (now() AT TIME ZONE 'UTC'), DELETE_REASON_ = $2
            WHERE PROC_INST_ID_ = $1 AND END_TIME_ IS NULL
            "#,
            tables.history_instance
        ))
        .bind(id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(instance_id = %id, removed, "deleted runtime instance");
        Ok(())
    }

    pub(super) async fn delete_history_impl(&self, id: &str) -> EngineResult<()> {
        self.count_query("delete:history");
        let tables = &self.tables;
        let mut tx = self.pool.begin().await?;
        for table in [
            &tables.history_variable,
            &tables.history_task,
            &tables.history_activity,
            &tables.history_identity_link,
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE PROC_INST_ID_ = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE PROC_INST_ID_ = $1",
            tables.history_instance
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Err(EngineError::not_found(format!(
                "No historic process instance found for id '{id}'"
            )));
        }
        tx.commit().await?;
        Ok(())
    }
}
