//! Source CRUD, version-guarded updates and scheduling queries.

use crate::error::{ConcurrencyError, DatabaseError};
use crate::source::Source;
use crate::types::SourceId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{Database, NewSource, SourceRow, to_ts};

/// How many reload-mutate-persist cycles `update_source` attempts before giving up
const MAX_UPDATE_ATTEMPTS: u32 = 8;

impl Database {
    /// Insert a new source, due immediately
    pub async fn insert_source(&self, source: &NewSource) -> Result<SourceId> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO sources (name, url, active, fetch_interval_minutes, adaptive_fetching,
                                 extraction_enabled, pause_threshold, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.active)
        .bind(source.fetch_interval_minutes)
        .bind(source.adaptive_fetching_enabled)
        .bind(source.extraction_enabled)
        .bind(source.pause_threshold)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert source: {}",
                e
            )))
        })?;

        Ok(SourceId(result.last_insert_rowid()))
    }

    /// Get source by ID
    pub async fn get_source(&self, id: SourceId) -> Result<Option<Source>> {
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get source: {}",
                    e
                )))
            })?;

        Ok(row.map(Source::from))
    }

    /// List all sources ordered by ID
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list sources: {}",
                    e
                )))
            })?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Atomically reload, mutate and persist a source
    ///
    /// `mutate` runs against a freshly loaded copy. Returning `None` skips the
    /// write and yields `Ok(None)`. On a version conflict the cycle starts over
    /// with the newer row, so `mutate` may run more than once.
    pub async fn update_source<T, F>(&self, id: SourceId, mut mutate: F) -> Result<Option<(Source, T)>>
    where
        F: FnMut(&mut Source) -> Option<T>,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self
                .get_source(id)
                .await?
                .ok_or(Error::SourceNotFound(id.get()))?;

            let mut next = current.clone();
            let Some(value) = mutate(&mut next) else {
                return Ok(None);
            };

            if self.write_source(&next, current.version).await? {
                next.version = current.version + 1;
                return Ok(Some((next, value)));
            }

            tracing::debug!(source_id = %id, "source changed concurrently, reloading");
        }

        Err(ConcurrencyError::UpdateConflict {
            source_id: id.get(),
            attempts: MAX_UPDATE_ATTEMPTS,
        }
        .into())
    }

    /// [`update_source`](Self::update_source) for mutations that always persist
    pub async fn modify_source<F>(&self, id: SourceId, mut mutate: F) -> Result<Source>
    where
        F: FnMut(&mut Source),
    {
        match self
            .update_source(id, |source| {
                mutate(source);
                Some(())
            })
            .await?
        {
            Some((source, ())) => Ok(source),
            None => Err(Error::SourceNotFound(id.get())),
        }
    }

    /// Persist a mutation of `snapshot` only if nobody changed the row since
    ///
    /// Unlike [`update_source`](Self::update_source) this never reloads: a lost
    /// race yields `Ok(None)` and the caller moves on.
    pub async fn compare_and_update<F>(&self, snapshot: &Source, mutate: F) -> Result<Option<Source>>
    where
        F: FnOnce(&mut Source),
    {
        let mut next = snapshot.clone();
        mutate(&mut next);

        if self.write_source(&next, snapshot.version).await? {
            next.version = snapshot.version + 1;
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Activate or deactivate a source
    pub async fn set_source_active(&self, id: SourceId, active: bool) -> Result<Source> {
        self.modify_source(id, |source| source.active = active).await
    }

    /// Sources the scheduler may enqueue at `now`
    ///
    /// Besides idle and failed sources this includes queued or fetching sources
    /// whose claim went stale, so a crashed worker never strands a source.
    /// Sources with an unset due time come first, then by due time.
    pub async fn due_sources(
        &self,
        now: DateTime<Utc>,
        stale_queued_before: DateTime<Utc>,
        stale_fetching_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Source>> {
        let now = now.timestamp();

        let rows = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT * FROM sources
            WHERE active = 1
              AND (next_fetch_at IS NULL OR next_fetch_at <= ?)
              AND (circuit_until IS NULL OR circuit_until <= ?)
              AND (auto_paused_until IS NULL OR auto_paused_until <= ?)
              AND (
                    fetch_status IN (0, 3)
                 OR (fetch_status = 1 AND (queued_at IS NULL OR queued_at <= ?))
                 OR (fetch_status = 2 AND (last_fetch_started_at IS NULL OR last_fetch_started_at <= ?))
              )
            ORDER BY next_fetch_at IS NOT NULL, next_fetch_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(stale_queued_before.timestamp())
        .bind(stale_fetching_before.timestamp())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to select due sources: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Queued or fetching sources whose state timestamp is older than the cutoff
    pub async fn find_stalled_sources(
        &self,
        queued_before: DateTime<Utc>,
        fetching_before: DateTime<Utc>,
    ) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT * FROM sources
            WHERE (fetch_status = 1 AND (queued_at IS NULL OR queued_at <= ?))
               OR (fetch_status = 2 AND (last_fetch_started_at IS NULL OR last_fetch_started_at <= ?))
            ORDER BY id ASC
            "#,
        )
        .bind(queued_before.timestamp())
        .bind(fetching_before.timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find stalled sources: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Write every mutable column, guarded by the expected version
    async fn write_source(&self, source: &Source, expected_version: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET name = ?, url = ?, active = ?, fetch_status = ?, next_fetch_at = ?,
                fetch_interval_minutes = ?, adaptive_fetching = ?, etag = ?, last_modified = ?,
                content_signature = ?, failure_count = ?, last_error = ?, last_error_at = ?,
                retry_attempt = ?, circuit_opened_at = ?, circuit_until = ?, backoff_until = ?,
                rolling_success_rate = ?, health_status = ?, auto_paused_at = ?,
                auto_paused_until = ?, pause_threshold = ?, extraction_enabled = ?,
                last_fetch_started_at = ?, queued_at = ?, last_fetched_at = ?,
                last_success_at = ?, task_id = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.active)
        .bind(source.fetch_status.to_i32())
        .bind(to_ts(source.next_fetch_at))
        .bind(source.fetch_interval_minutes)
        .bind(source.adaptive_fetching_enabled)
        .bind(&source.etag)
        .bind(&source.last_modified)
        .bind(&source.content_signature)
        .bind(source.failure_count)
        .bind(&source.last_error)
        .bind(to_ts(source.last_error_at))
        .bind(i64::from(source.retry_attempt))
        .bind(to_ts(source.circuit_opened_at))
        .bind(to_ts(source.circuit_until))
        .bind(to_ts(source.backoff_until))
        .bind(source.rolling_success_rate)
        .bind(source.health_status.to_i32())
        .bind(to_ts(source.auto_paused_at))
        .bind(to_ts(source.auto_paused_until))
        .bind(source.pause_threshold)
        .bind(source.extraction_enabled)
        .bind(to_ts(source.last_fetch_started_at))
        .bind(to_ts(source.queued_at))
        .bind(to_ts(source.last_fetched_at))
        .bind(to_ts(source.last_success_at))
        .bind(source.task_id.as_ref().map(|t| t.as_str()))
        .bind(source.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update source: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }
}
