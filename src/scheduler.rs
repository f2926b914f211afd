//! Due-source scheduling
//!
//! Each tick first lets the [`StalledTaskReconciler`] reclaim sources stranded by
//! crashed workers, then selects due sources and claims them one by one with a
//! compare-and-set on the row version. A row another tick claimed first is
//! skipped, never waited on, so concurrent ticks cannot double-enqueue.
//!
//! # Example
//!
//! ```no_run
//! use feedpulse::scheduler::{Scheduler, SchedulerTask};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn example(scheduler: Arc<Scheduler>) {
//! let cancel = CancellationToken::new();
//! let task = SchedulerTask::new(scheduler, Duration::from_secs(60), 100, cancel.clone());
//! tokio::spawn(task.run());
//! // later
//! cancel.cancel();
//! # }
//! ```

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::reconciler::StalledTaskReconciler;
use crate::runner::FetchRunner;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Selects due sources and submits fetch tasks for them
pub struct Scheduler {
    db: Arc<Database>,
    runner: Arc<FetchRunner>,
    reconciler: Arc<StalledTaskReconciler>,
    stale_queued_after: Duration,
    stale_fetching_after: Duration,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(
        db: Arc<Database>,
        runner: Arc<FetchRunner>,
        reconciler: Arc<StalledTaskReconciler>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            db,
            runner,
            reconciler,
            stale_queued_after: Duration::from_std(config.stale_queued_after)
                .unwrap_or(Duration::MAX),
            stale_fetching_after: Duration::from_std(config.stale_fetching_after)
                .unwrap_or(Duration::MAX),
        }
    }

    /// One tick at the current time; returns how many sources were enqueued
    pub async fn run(&self, limit: usize) -> Result<usize> {
        self.run_at(limit, Utc::now()).await
    }

    /// One tick as of `now`
    pub async fn run_at(&self, limit: usize, now: DateTime<Utc>) -> Result<usize> {
        if let Err(e) = self.reconciler.reconcile_at(now).await {
            error!(error = %e, "stalled task reconciliation failed");
        }

        if limit == 0 {
            return Ok(0);
        }

        let queued_before = now
            .checked_sub_signed(self.stale_queued_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let fetching_before = now
            .checked_sub_signed(self.stale_fetching_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let candidates = self
            .db
            .due_sources(
                now,
                queued_before,
                fetching_before,
                u32::try_from(limit).unwrap_or(u32::MAX),
            )
            .await?;

        let mut enqueued = 0;
        for source in &candidates {
            match self.runner.enqueue_candidate(source, now).await {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "failed to enqueue due source");
                }
            }
        }

        if enqueued > 0 {
            info!(enqueued, candidates = candidates.len(), "scheduled due sources");
        } else {
            debug!(candidates = candidates.len(), "no sources scheduled");
        }
        Ok(enqueued)
    }
}

/// Background loop calling [`Scheduler::run`] every tick
pub struct SchedulerTask {
    scheduler: Arc<Scheduler>,
    tick_interval: std::time::Duration,
    batch_limit: usize,
    cancel: CancellationToken,
}

impl SchedulerTask {
    /// Creates a new scheduler task
    pub fn new(
        scheduler: Arc<Scheduler>,
        tick_interval: std::time::Duration,
        batch_limit: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            tick_interval,
            batch_limit,
            cancel,
        }
    }

    /// Tick until cancelled; the first tick runs immediately
    pub async fn run(self) {
        info!(
            tick_secs = self.tick_interval.as_secs(),
            batch_limit = self.batch_limit,
            "scheduler started"
        );

        let mut ticker =
            tokio::time::interval(self.tick_interval.max(std::time::Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.scheduler.run(self.batch_limit).await {
                error!(error = %e, "scheduler tick failed");
            }
        }

        info!("scheduler stopped");
    }
}
