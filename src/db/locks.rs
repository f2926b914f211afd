//! Keyed expiring locks.
//!
//! Timestamps in this table are unix milliseconds. A row whose `expires_at`
//! has passed is free to take over, which is what releases the lock of a
//! worker that died without cleaning up.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Take the lock if it is free or expired; true when `holder` now owns it
    pub async fn try_acquire_lock(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_locks (namespace, lock_key, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, lock_key) DO UPDATE
            SET holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE fetch_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(holder)
        .bind(now_ms)
        .bind(now_ms.saturating_add(ttl_ms))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to acquire lock: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Push the expiry forward; false when `holder` no longer owns the lock
    pub async fn renew_lock(
        &self,
        namespace: &str,
        key: &str,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE fetch_locks SET expires_at = ? WHERE namespace = ? AND lock_key = ? AND holder = ?",
        )
        .bind(now_ms.saturating_add(ttl_ms))
        .bind(namespace)
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to renew lock: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop the lock if `holder` still owns it
    pub async fn release_lock(&self, namespace: &str, key: &str, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM fetch_locks WHERE namespace = ? AND lock_key = ? AND holder = ?",
        )
        .bind(namespace)
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to release lock: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Current holder of an unexpired lock
    pub async fn lock_holder(&self, namespace: &str, key: &str, now_ms: i64) -> Result<Option<String>> {
        let holder: Option<String> = sqlx::query_scalar(
            "SELECT holder FROM fetch_locks WHERE namespace = ? AND lock_key = ? AND expires_at > ?",
        )
        .bind(namespace)
        .bind(key)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read lock: {}",
                e
            )))
        })?;

        Ok(holder)
    }
}
