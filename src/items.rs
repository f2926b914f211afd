//! Item store: turns parsed entries into stored items.

use crate::db::{Database, ItemUpsert, ItemWrite};
use crate::feed::FeedEntry;
use crate::source::Source;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Stored item handed to follow-up work
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemRef {
    /// Database ID of the stored item
    pub id: i64,
    /// Entry identity within the source
    pub guid: String,
    /// Entry title
    pub title: String,
    /// Entry link
    pub link: Option<String>,
}

/// Outcome of processing one batch of entries
#[must_use]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Entries stored for the first time
    pub created: u32,
    /// Entries whose content changed
    pub updated: u32,
    /// Entries that could not be stored
    pub failed: u32,
    /// The created items
    pub created_items: Vec<ItemRef>,
    /// The updated items
    pub updated_items: Vec<ItemRef>,
}

/// Persists entries of a fetched feed
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Store a batch of entries; per-entry failures are counted, not raised
    async fn process(&self, source: &Source, entries: &[FeedEntry]) -> Result<ProcessResult>;
}

/// [`ItemStore`] keeping one row per (source, guid) in the `feed_items` table
///
/// A new guid counts as created, a changed content hash as updated and an
/// identical entry as neither.
pub struct DbItemStore {
    db: Arc<Database>,
}

impl DbItemStore {
    /// Create a store on the shared database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ItemStore for DbItemStore {
    async fn process(&self, source: &Source, entries: &[FeedEntry]) -> Result<ProcessResult> {
        let now = Utc::now();
        let mut result = ProcessResult::default();

        for entry in entries {
            if entry.guid.trim().is_empty() {
                tracing::debug!(source_id = %source.id, "skipping entry without identity");
                result.failed += 1;
                continue;
            }

            let content_hash = entry.content_hash();
            let upsert = ItemUpsert {
                guid: &entry.guid,
                title: &entry.title,
                link: entry.link.as_deref(),
                published_at: entry.published_at,
                content_hash: &content_hash,
            };

            let item_ref = |id| ItemRef {
                id,
                guid: entry.guid.clone(),
                title: entry.title.clone(),
                link: entry.link.clone(),
            };

            match self.db.upsert_item(source.id, &upsert, now).await {
                Ok(ItemWrite::Created(id)) => {
                    result.created += 1;
                    result.created_items.push(item_ref(id));
                }
                Ok(ItemWrite::Updated(id)) => {
                    result.updated += 1;
                    result.updated_items.push(item_ref(id));
                }
                Ok(ItemWrite::Unchanged(_)) => {}
                Err(e) => {
                    tracing::warn!(source_id = %source.id, guid = %entry.guid, error = %e, "failed to store entry");
                    result.failed += 1;
                }
            }
        }

        Ok(result)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSource;
    use tempfile::NamedTempFile;

    fn entry(guid: &str, title: &str) -> FeedEntry {
        FeedEntry {
            guid: guid.to_string(),
            title: title.to_string(),
            link: Some(format!("https://example.com/{guid}")),
            published_at: None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn counts_created_updated_and_failed() {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let id = db
            .insert_source(&NewSource::new("store", "https://example.com/feed"))
            .await
            .unwrap();
        let source = db.get_source(id).await.unwrap().unwrap();
        let store = DbItemStore::new(db.clone());

        let first = store
            .process(&source, &[entry("a", "A"), entry("b", "B"), entry("  ", "blank")])
            .await
            .unwrap();
        assert_eq!((first.created, first.updated, first.failed), (2, 0, 1));
        assert_eq!(first.created_items.len(), 2);
        assert_eq!(first.created_items[0].guid, "a");

        let second = store
            .process(&source, &[entry("a", "A"), entry("b", "B edited"), entry("c", "C")])
            .await
            .unwrap();
        assert_eq!((second.created, second.updated, second.failed), (1, 1, 0));
        assert_eq!(second.created_items[0].guid, "c");
        assert_eq!(second.updated_items[0].guid, "b");

        assert_eq!(db.count_items(id).await.unwrap(), 3);
    }
}
