//! Retention of stored items.

use crate::db::Database;
use crate::source::Source;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Removes stored items a source no longer needs
#[async_trait]
pub trait RetentionPruner: Send + Sync {
    /// Apply the policy to one source; returns the number of items removed
    async fn apply(&self, source: &Source) -> Result<u64>;
}

/// Keeps the newest `max_items` items of each source
pub struct DbRetentionPruner {
    db: Arc<Database>,
    max_items: Option<usize>,
}

impl DbRetentionPruner {
    /// `None` keeps everything
    pub fn new(db: Arc<Database>, max_items: Option<usize>) -> Self {
        Self { db, max_items }
    }
}

#[async_trait]
impl RetentionPruner for DbRetentionPruner {
    async fn apply(&self, source: &Source) -> Result<u64> {
        let Some(max_items) = self.max_items else {
            return Ok(0);
        };

        let keep = u32::try_from(max_items).unwrap_or(u32::MAX);
        let removed = self.db.prune_items(source.id, keep).await?;
        if removed > 0 {
            tracing::debug!(source_id = %source.id, removed, "pruned old items");
        }
        Ok(removed)
    }
}

/// Retention policy that never removes anything
pub struct NoOpRetentionPruner;

#[async_trait]
impl RetentionPruner for NoOpRetentionPruner {
    async fn apply(&self, _source: &Source) -> Result<u64> {
        Ok(0)
    }
}
