//! Recovery of sources stuck in `queued` or `fetching`.
//!
//! A worker that crashes mid-fetch leaves its source marked in flight. The
//! reconciler finds such sources once their state timestamp is older than the
//! configured threshold and hands them a fresh task.

use crate::db::Database;
use crate::events::EventBus;
use crate::queue::{FetchTask, TaskQueue};
use crate::types::{Event, FetchStatus, SourceId};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one reconciliation pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sources that were resubmitted
    pub recovered: Vec<SourceId>,
    /// Failure records of stuck tasks that were discarded
    pub stale_tasks_removed: usize,
}

/// Finds stalled sources and resubmits them
pub struct StalledTaskReconciler {
    db: Arc<Database>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<EventBus>,
    queued_after: Duration,
    fetching_after: Duration,
}

impl StalledTaskReconciler {
    /// Sources count as stalled after `queued_after` in `queued` or `fetching_after` in `fetching`
    pub fn new(
        db: Arc<Database>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<EventBus>,
        queued_after: std::time::Duration,
        fetching_after: std::time::Duration,
    ) -> Self {
        Self {
            db,
            queue,
            events,
            queued_after: Duration::from_std(queued_after).unwrap_or(Duration::MAX),
            fetching_after: Duration::from_std(fetching_after).unwrap_or(Duration::MAX),
        }
    }

    /// Reconcile against the current time
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// Reconcile as of `now`
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let queued_before = now.checked_sub_signed(self.queued_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let fetching_before = now.checked_sub_signed(self.fetching_after).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stalled = self.db.find_stalled_sources(queued_before, fetching_before).await?;
        let mut report = ReconcileReport::default();

        for source in stalled {
            if let Some(stuck) = &source.task_id {
                match self.queue.discard_failure(stuck).await {
                    Ok(true) => report.stale_tasks_removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(source_id = %source.id, task_id = %stuck, error = %e, "failed to discard stale task record");
                    }
                }
            }

            if !source.active {
                let reset = self
                    .db
                    .compare_and_update(&source, |s| {
                        s.fetch_status = FetchStatus::Idle;
                        s.queued_at = None;
                        s.task_id = None;
                    })
                    .await?;
                if reset.is_some() {
                    debug!(source_id = %source.id, "reset stalled inactive source to idle");
                }
                continue;
            }

            let since = match source.fetch_status {
                FetchStatus::Fetching => source.last_fetch_started_at,
                _ => source.queued_at,
            };
            let diagnostic = match since {
                Some(at) => format!(
                    "recovered stalled task: {} since {}",
                    source.fetch_status,
                    at.to_rfc3339()
                ),
                None => format!("recovered stalled task: {} without timestamp", source.fetch_status),
            };

            let task = FetchTask::new(source.id);
            let reset = self
                .db
                .compare_and_update(&source, |s| {
                    s.fetch_status = FetchStatus::Queued;
                    s.next_fetch_at = Some(now);
                    s.queued_at = Some(now);
                    s.task_id = Some(task.id.clone());
                    s.last_error = Some(diagnostic.clone());
                    s.last_error_at = Some(now);
                })
                .await?;

            if reset.is_none() {
                debug!(source_id = %source.id, "stalled source moved on concurrently, skipping");
                continue;
            }

            if let Err(e) = self.queue.dispatch(task.clone()).await {
                // Stays queued with a fresh timestamp; the next pass retries it
                warn!(source_id = %source.id, error = %e, "failed to resubmit stalled source");
                continue;
            }

            report.recovered.push(source.id);
        }

        if !report.recovered.is_empty() {
            info!(
                recovered = report.recovered.len(),
                stale_tasks_removed = report.stale_tasks_removed,
                "recovered stalled sources"
            );
            self.events.emit(Event::StalledRecovered {
                source_ids: report.recovered.clone(),
            });
        }

        Ok(report)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Harness, create_test_harness};
    use crate::types::TaskId;
    use chrono::TimeZone;

    const THRESHOLD: std::time::Duration = std::time::Duration::from_secs(15 * 60);

    fn reconciler(h: &Harness) -> StalledTaskReconciler {
        StalledTaskReconciler::new(
            h.db.clone(),
            h.queue.clone(),
            h.events.clone(),
            THRESHOLD,
            THRESHOLD,
        )
    }

    fn now_secs() -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
    }

    async fn stall(h: &Harness, id: SourceId, status: FetchStatus, since: DateTime<Utc>) -> TaskId {
        let task_id = TaskId::generate();
        h.db.modify_source(id, |s| {
            s.fetch_status = status;
            s.task_id = Some(task_id.clone());
            match status {
                FetchStatus::Fetching => s.last_fetch_started_at = Some(since),
                _ => s.queued_at = Some(since),
            }
        })
        .await
        .unwrap();
        task_id
    }

    #[tokio::test]
    async fn stuck_fetch_is_requeued_with_fresh_task() {
        let h = create_test_harness().await;
        let now = now_secs();
        let id = h.insert_source("crashed").await;
        let old_task = stall(&h, id, FetchStatus::Fetching, now - Duration::minutes(20)).await;
        let mut events = h.events.subscribe();

        let report = reconciler(&h).reconcile_at(now).await.unwrap();

        assert_eq!(report.recovered, vec![id]);
        assert_eq!(report.stale_tasks_removed, 1);
        assert_eq!(h.queue.discarded(), vec![old_task.clone()]);

        let stored = h.db.get_source(id).await.unwrap().unwrap();
        assert_eq!(stored.fetch_status, FetchStatus::Queued);
        assert_eq!(stored.next_fetch_at, Some(now));
        assert_eq!(stored.queued_at, Some(now));
        assert!(stored.last_error.unwrap().contains("recovered stalled task"));

        let dispatched = h.queue.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_ne!(dispatched[0].id, old_task);
        assert_eq!(stored.task_id, Some(dispatched[0].id.clone()));

        match events.recv().await.unwrap() {
            Event::StalledRecovered { source_ids } => assert_eq!(source_ids, vec![id]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_queued_source_is_recovered() {
        let h = create_test_harness().await;
        let now = now_secs();
        let id = h.insert_source("lost").await;
        stall(&h, id, FetchStatus::Queued, now - Duration::minutes(16)).await;

        let report = reconciler(&h).reconcile_at(now).await.unwrap();

        assert_eq!(report.recovered, vec![id]);
    }

    #[tokio::test]
    async fn fresh_work_is_left_alone() {
        let h = create_test_harness().await;
        let now = now_secs();
        let fetching = h.insert_source("fetching").await;
        let retrying = h.insert_source("retrying").await;
        stall(&h, fetching, FetchStatus::Fetching, now - Duration::minutes(5)).await;
        // Retries park `queued_at` at the retry time
        stall(&h, retrying, FetchStatus::Queued, now + Duration::minutes(10)).await;

        let report = reconciler(&h).reconcile_at(now).await.unwrap();

        assert!(report.recovered.is_empty());
        assert!(h.queue.dispatched().is_empty());
        assert!(h.queue.discarded().is_empty());
    }

    #[tokio::test]
    async fn inactive_stalled_source_goes_idle() {
        let h = create_test_harness().await;
        let now = now_secs();
        let id = h.insert_source("retired").await;
        stall(&h, id, FetchStatus::Fetching, now - Duration::hours(1)).await;
        h.db.set_source_active(id, false).await.unwrap();

        let report = reconciler(&h).reconcile_at(now).await.unwrap();

        assert!(report.recovered.is_empty());
        let stored = h.db.get_source(id).await.unwrap().unwrap();
        assert_eq!(stored.fetch_status, FetchStatus::Idle);
        assert!(stored.task_id.is_none());
        assert!(h.queue.dispatched().is_empty());
    }
}
