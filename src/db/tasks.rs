//! Failure records of fetch tasks.

use crate::error::DatabaseError;
use crate::types::{SourceId, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{Database, TaskFailureRow};

impl Database {
    /// Remember that a task ended with an error
    ///
    /// A source keeps only its latest failure record; earlier records of the
    /// same source are replaced.
    pub async fn record_task_failure(
        &self,
        task_id: &TaskId,
        source_id: SourceId,
        error: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let query_failed = |e: sqlx::Error| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record task failure: {}",
                e
            )))
        };

        let mut tx = self.pool.begin().await.map_err(query_failed)?;

        sqlx::query("DELETE FROM task_failures WHERE source_id = ? AND task_id != ?")
            .bind(source_id)
            .bind(task_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(query_failed)?;

        sqlx::query(
            r#"
            INSERT INTO task_failures (task_id, source_id, error, failed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE
            SET error = excluded.error, failed_at = excluded.failed_at
            "#,
        )
        .bind(task_id.as_str())
        .bind(source_id)
        .bind(error)
        .bind(failed_at.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        tx.commit().await.map_err(query_failed)?;
        Ok(())
    }

    /// Get the failure record of a task
    pub async fn get_task_failure(&self, task_id: &TaskId) -> Result<Option<TaskFailureRow>> {
        let row = sqlx::query_as::<_, TaskFailureRow>(
            "SELECT task_id, source_id, error, failed_at FROM task_failures WHERE task_id = ?",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get task failure: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Delete the failure record of a task; true when one existed
    pub async fn delete_task_failure(&self, task_id: &TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_failures WHERE task_id = ?")
            .bind(task_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete task failure: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
