//! Stored feed items and retention.

use crate::error::DatabaseError;
use crate::types::SourceId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{Database, FeedItemRow, to_ts};

/// Entry to be inserted or refreshed
#[derive(Debug, Clone)]
pub struct ItemUpsert<'a> {
    /// Entry identity within the source
    pub guid: &'a str,
    /// Entry title
    pub title: &'a str,
    /// Entry link
    pub link: Option<&'a str>,
    /// Publication date
    pub published_at: Option<DateTime<Utc>>,
    /// Hash of the entry's normalized content
    pub content_hash: &'a str,
}

/// What an upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemWrite {
    /// A new row was inserted
    Created(i64),
    /// An existing row had different content and was refreshed
    Updated(i64),
    /// An existing row already matched
    Unchanged(i64),
}

impl Database {
    /// Insert an entry or refresh it when its content hash changed
    pub async fn upsert_item(
        &self,
        source_id: SourceId,
        item: &ItemUpsert<'_>,
        now: DateTime<Utc>,
    ) -> Result<ItemWrite> {
        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, content_hash FROM feed_items WHERE source_id = ? AND guid = ?",
        )
        .bind(source_id)
        .bind(item.guid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to look up item: {}",
                e
            )))
        })?;

        match existing {
            Some((id, hash)) if hash == item.content_hash => Ok(ItemWrite::Unchanged(id)),
            Some((id, _)) => {
                sqlx::query(
                    r#"
                    UPDATE feed_items
                    SET title = ?, link = ?, published_at = ?, content_hash = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(item.title)
                .bind(item.link)
                .bind(to_ts(item.published_at))
                .bind(item.content_hash)
                .bind(now.timestamp())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to update item: {}",
                        e
                    )))
                })?;

                Ok(ItemWrite::Updated(id))
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO feed_items (source_id, guid, title, link, published_at,
                                            content_hash, first_seen_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(source_id)
                .bind(item.guid)
                .bind(item.title)
                .bind(item.link)
                .bind(to_ts(item.published_at))
                .bind(item.content_hash)
                .bind(now.timestamp())
                .bind(now.timestamp())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to insert item: {}",
                        e
                    )))
                })?;

                Ok(ItemWrite::Created(result.last_insert_rowid()))
            }
        }
    }

    /// Stored items of a source, newest first
    pub async fn list_items(&self, source_id: SourceId) -> Result<Vec<FeedItemRow>> {
        let items = sqlx::query_as::<_, FeedItemRow>(
            r#"
            SELECT id, source_id, guid, title, link, published_at, content_hash,
                   first_seen_at, updated_at
            FROM feed_items
            WHERE source_id = ?
            ORDER BY first_seen_at DESC, id DESC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list items: {}",
                e
            )))
        })?;

        Ok(items)
    }

    /// Number of stored items of a source
    pub async fn count_items(&self, source_id: SourceId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_items WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count items: {}",
                    e
                )))
            })?;

        Ok(count)
    }

    /// Delete all but the `keep` most recently seen items; returns rows removed
    pub async fn prune_items(&self, source_id: SourceId, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_items
            WHERE source_id = ?
              AND id NOT IN (
                  SELECT id FROM feed_items
                  WHERE source_id = ?
                  ORDER BY first_seen_at DESC, id DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(source_id)
        .bind(source_id)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to prune items: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }
}
