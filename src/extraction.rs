//! Follow-up extraction of newly created items.

use crate::items::ItemRef;
use crate::types::SourceId;
use crate::Result;
use async_trait::async_trait;

/// Hands new items to a downstream extraction system
///
/// Dispatch is fire-and-forget; the runner only consults [`in_flight`] to stay
/// within the per-source budget.
///
/// [`in_flight`]: ExtractionDispatcher::in_flight
#[async_trait]
pub trait ExtractionDispatcher: Send + Sync {
    /// Extraction tasks of this source that have not finished yet
    async fn in_flight(&self, source_id: SourceId) -> Result<usize>;

    /// Submit one extraction task
    async fn dispatch(&self, source_id: SourceId, item: &ItemRef) -> Result<()>;

    /// Name of this dispatcher, for logs
    fn name(&self) -> &'static str;
}

/// Dispatcher used when no extraction backend is configured
pub struct NoOpExtractionDispatcher;

#[async_trait]
impl ExtractionDispatcher for NoOpExtractionDispatcher {
    async fn in_flight(&self, _source_id: SourceId) -> Result<usize> {
        Ok(0)
    }

    async fn dispatch(&self, source_id: SourceId, item: &ItemRef) -> Result<()> {
        tracing::trace!(source_id = %source_id, item_id = item.id, "no extraction backend, dropping item");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
