//! Append-only fetch attempt log.

use crate::error::DatabaseError;
use crate::types::SourceId;
use crate::{Error, Result};

use super::{Database, FetchAttempt, NewFetchAttempt};

impl Database {
    /// Append one attempt to the log
    pub async fn record_attempt(&self, attempt: &NewFetchAttempt) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_attempts (source_id, success, http_status, duration_ms, started_at,
                                        completed_at, error_kind, error_message, items_created,
                                        items_updated, items_failed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.source_id)
        .bind(attempt.success)
        .bind(attempt.http_status.map(i64::from))
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(attempt.started_at.timestamp())
        .bind(attempt.completed_at.timestamp())
        .bind(&attempt.error_kind)
        .bind(&attempt.error_message)
        .bind(i64::from(attempt.items_created))
        .bind(i64::from(attempt.items_updated))
        .bind(i64::from(attempt.items_failed))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record fetch attempt: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent attempts for a source, newest first
    pub async fn recent_attempts(&self, source_id: SourceId, limit: u32) -> Result<Vec<FetchAttempt>> {
        let attempts = sqlx::query_as::<_, FetchAttempt>(
            r#"
            SELECT id, source_id, success, http_status, duration_ms, started_at, completed_at,
                   error_kind, error_message, items_created, items_updated, items_failed
            FROM fetch_attempts
            WHERE source_id = ?
            ORDER BY completed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get fetch attempts: {}",
                e
            )))
        })?;

        Ok(attempts)
    }

    /// Success flags of the most recent attempts, newest first
    pub async fn recent_outcomes(&self, source_id: SourceId, limit: u32) -> Result<Vec<bool>> {
        let outcomes: Vec<bool> = sqlx::query_scalar(
            r#"
            SELECT success FROM fetch_attempts
            WHERE source_id = ?
            ORDER BY completed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get attempt outcomes: {}",
                e
            )))
        })?;

        Ok(outcomes)
    }
}
