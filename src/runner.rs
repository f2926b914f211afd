//! Fetch runner
//!
//! Runs one fetch attempt for a source under its keyed lock and turns the
//! outcome into scheduling state: idle on success, a delayed retry, an open
//! circuit or a terminal failure otherwise. Every attempt that got past the
//! lock ends with a [`Event::FetchCompleted`], including attempts that panic.

use crate::db::Database;
use crate::events::EventBus;
use crate::extraction::ExtractionDispatcher;
use crate::fetcher::{FeedFetcher, FetchOutcome};
use crate::items::ItemRef;
use crate::lock::KeyedLock;
use crate::queue::{FetchTask, TaskQueue};
use crate::retention::RetentionPruner;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::Source;
use crate::types::{Event, FetchResult, FetchStatus, SourceId, TaskId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How a task ended without error
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// The fetch succeeded
    Completed(FetchResult),
    /// The fetch failed and the same task was resubmitted
    RetryScheduled {
        /// Retries spent including this one
        attempt: u32,
        /// When the retry runs
        retry_at: DateTime<Utc>,
    },
    /// The task was superseded or the source is inactive
    Skipped,
    /// Another worker held the lock; the task was resubmitted for later
    Deferred,
}

/// Parameters for creating a [`FetchRunner`]
pub struct FetchRunnerParams {
    /// Shared database
    pub db: Arc<Database>,
    /// Per-source mutual exclusion
    pub lock: Arc<dyn KeyedLock>,
    /// Performs the attempt itself
    pub fetcher: Arc<FeedFetcher>,
    /// Retry and circuit-breaker policy
    pub policy: RetryPolicy,
    /// Where tasks are (re)submitted
    pub queue: Arc<dyn TaskQueue>,
    /// Item retention after successful fetches
    pub retention: Arc<dyn RetentionPruner>,
    /// Follow-up extraction for created items
    pub extraction: Arc<dyn ExtractionDispatcher>,
    /// Completion events
    pub events: Arc<EventBus>,
    /// Namespace of the per-source locks
    pub lock_namespace: String,
    /// Delay before a task that lost the lock runs again
    pub lock_retry_delay: Duration,
    /// Extraction tasks allowed in flight per source
    pub max_extraction_in_flight: usize,
}

/// Runs fetch tasks
pub struct FetchRunner {
    db: Arc<Database>,
    lock: Arc<dyn KeyedLock>,
    fetcher: Arc<FeedFetcher>,
    policy: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    retention: Arc<dyn RetentionPruner>,
    extraction: Arc<dyn ExtractionDispatcher>,
    events: Arc<EventBus>,
    lock_namespace: String,
    lock_retry_delay: Duration,
    max_extraction_in_flight: usize,
}

/// Publishes the completion event exactly once, even if the attempt unwinds
struct CompletionGuard {
    events: Arc<EventBus>,
    source_id: SourceId,
    done: bool,
}

impl CompletionGuard {
    fn new(events: Arc<EventBus>, source_id: SourceId) -> Self {
        Self {
            events,
            source_id,
            done: false,
        }
    }

    async fn complete(mut self, result: FetchResult) {
        self.done = true;
        self.events
            .publish(Event::FetchCompleted {
                source_id: self.source_id,
                result,
            })
            .await;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let events = self.events.clone();
        let source_id = self.source_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    events
                        .publish(Event::FetchCompleted {
                            source_id,
                            result: FetchResult::aborted("fetch attempt did not complete"),
                        })
                        .await;
                });
            }
            Err(_) => {
                error!(source_id = %source_id, "fetch attempt aborted outside a runtime, completion not published");
            }
        }
    }
}

impl FetchRunner {
    /// Create a runner
    pub fn new(params: FetchRunnerParams) -> Self {
        let FetchRunnerParams {
            db,
            lock,
            fetcher,
            policy,
            queue,
            retention,
            extraction,
            events,
            lock_namespace,
            lock_retry_delay,
            max_extraction_in_flight,
        } = params;

        Self {
            db,
            lock,
            fetcher,
            policy,
            queue,
            retention,
            extraction,
            events,
            lock_namespace,
            lock_retry_delay,
            max_extraction_in_flight,
        }
    }

    /// Mark a source queued and submit a fetch task for it
    ///
    /// Without `force` only schedulable sources (due, idle or failed, circuit
    /// closed, not paused) are enqueued and `false` is returned otherwise.
    /// `force` skips those checks and clears retry and circuit state; the
    /// per-source lock still applies when the task runs.
    pub async fn enqueue(&self, source_id: SourceId, force: bool) -> Result<bool> {
        let now = Utc::now();
        let task_id = TaskId::generate();

        let claimed = self
            .db
            .update_source(source_id, |s| {
                if !force && !s.is_schedulable(now) {
                    return None;
                }
                if force {
                    s.retry_attempt = 0;
                    s.circuit_opened_at = None;
                    s.circuit_until = None;
                    s.next_fetch_at = Some(now);
                }
                mark_queued(s, &task_id, now);
                Some(())
            })
            .await?;

        if claimed.is_none() {
            debug!(source_id = %source_id, "source not schedulable, not enqueued");
            return Ok(false);
        }

        self.submit(FetchTask {
            id: task_id,
            source_id,
            force,
        })
        .await?;
        Ok(true)
    }

    /// Claim a scheduler candidate with a compare-and-set on its row version
    ///
    /// Returns `false` without waiting when another writer changed the row
    /// since `snapshot` was read.
    pub async fn enqueue_candidate(&self, snapshot: &Source, now: DateTime<Utc>) -> Result<bool> {
        let task_id = TaskId::generate();

        let claimed = self
            .db
            .compare_and_update(snapshot, |s| mark_queued(s, &task_id, now))
            .await?;

        if claimed.is_none() {
            debug!(source_id = %snapshot.id, "source claimed concurrently, skipping");
            return Ok(false);
        }

        self.submit(FetchTask {
            id: task_id,
            source_id: snapshot.id,
            force: false,
        })
        .await?;
        Ok(true)
    }

    /// Dispatch a task whose source is already marked queued, undoing the mark on failure
    async fn submit(&self, task: FetchTask) -> Result<()> {
        let Err(e) = self.queue.dispatch(task.clone()).await else {
            debug!(source_id = %task.source_id, task_id = %task.id, queue = self.queue.name(), "fetch task submitted");
            return Ok(());
        };

        warn!(source_id = %task.source_id, error = %e, "failed to submit fetch task, reverting");
        let reverted = self
            .db
            .update_source(task.source_id, |s| {
                if s.task_id.as_ref() != Some(&task.id) {
                    return None;
                }
                s.fetch_status = FetchStatus::Idle;
                s.queued_at = None;
                s.task_id = None;
                Some(())
            })
            .await;
        if let Err(revert_err) = reverted {
            error!(source_id = %task.source_id, error = %revert_err, "failed to revert queued source");
        }

        Err(e)
    }

    /// Task entry point: [`run`](Self::run), with lock contention turned into a reschedule
    pub async fn execute(&self, task: FetchTask) -> Result<RunOutcome> {
        match self.run(&task).await {
            Err(e) if e.is_concurrency() => {
                debug!(
                    source_id = %task.source_id,
                    error = %e,
                    delay_secs = self.lock_retry_delay.as_secs(),
                    "source busy, deferring task"
                );
                self.queue.dispatch_after(task, self.lock_retry_delay).await?;
                Ok(RunOutcome::Deferred)
            }
            other => other,
        }
    }

    /// Run one attempt under the source's lock
    ///
    /// Fails with [`Error::Concurrency`] when another worker holds the lock.
    pub async fn run(&self, task: &FetchTask) -> Result<RunOutcome> {
        let guard = self
            .lock
            .try_acquire(&self.lock_namespace, &task.source_id.to_string())
            .await?;

        let result = self.run_locked(task).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(source_id = %task.source_id, error = %e, "failed to release fetch lock");
        }
        result
    }

    async fn run_locked(&self, task: &FetchTask) -> Result<RunOutcome> {
        let now = Utc::now();

        let claimed = self
            .db
            .update_source(task.source_id, |s| {
                if s.task_id.as_ref() != Some(&task.id) {
                    return None;
                }
                if !s.active {
                    s.fetch_status = FetchStatus::Idle;
                    s.queued_at = None;
                    s.task_id = None;
                    return Some(false);
                }
                s.fetch_status = FetchStatus::Fetching;
                s.last_fetch_started_at = Some(now);
                Some(true)
            })
            .await?;

        let source = match claimed {
            Some((source, true)) => source,
            Some((_, false)) => {
                debug!(source_id = %task.source_id, "source deactivated, dropping task");
                return Ok(RunOutcome::Skipped);
            }
            None => {
                debug!(source_id = %task.source_id, task_id = %task.id, "task superseded, dropping");
                return Ok(RunOutcome::Skipped);
            }
        };

        let completion = CompletionGuard::new(self.events.clone(), source.id);

        match self.fetcher.fetch(&source).await {
            Ok(outcome) => {
                let result = self.finish_success(task, &source, &outcome).await?;
                completion.complete(result.clone()).await;
                Ok(RunOutcome::Completed(result))
            }
            Err(err) => self.finish_failure(task, &source, err, completion).await,
        }
    }

    async fn finish_success(
        &self,
        task: &FetchTask,
        source: &Source,
        outcome: &FetchOutcome,
    ) -> Result<FetchResult> {
        if let Err(e) = self.retention.apply(source).await {
            warn!(source_id = %source.id, error = %e, "retention failed");
        }

        if source.extraction_enabled {
            self.dispatch_extraction(source.id, &outcome.items.created_items)
                .await;
        }

        self.db
            .modify_source(source.id, |s| {
                if s.task_id.as_ref() == Some(&task.id) {
                    s.fetch_status = FetchStatus::Idle;
                    s.queued_at = None;
                    s.task_id = None;
                }
                s.retry_attempt = 0;
                s.circuit_opened_at = None;
                s.circuit_until = None;
            })
            .await?;

        Ok(FetchResult {
            success: true,
            status_code: Some(outcome.status_code),
            error_kind: None,
            error: None,
            content_changed: outcome.content_changed,
            created: outcome.items.created,
            updated: outcome.items.updated,
            failed: outcome.items.failed,
            duration_ms: outcome.duration_ms,
            next_fetch_at: outcome.next_fetch_at,
        })
    }

    /// Dispatch extraction for created items within the per-source budget
    async fn dispatch_extraction(&self, source_id: SourceId, created: &[ItemRef]) {
        if created.is_empty() {
            return;
        }

        let in_flight = match self.extraction.in_flight(source_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(source_id = %source_id, error = %e, "cannot read extraction backlog, skipping");
                return;
            }
        };

        let budget = self.max_extraction_in_flight.saturating_sub(in_flight);
        for item in created.iter().take(budget) {
            if let Err(e) = self.extraction.dispatch(source_id, item).await {
                warn!(source_id = %source_id, item_id = item.id, error = %e, "extraction dispatch failed");
            }
        }

        if created.len() > budget {
            debug!(
                source_id = %source_id,
                dispatcher = self.extraction.name(),
                skipped = created.len() - budget,
                in_flight,
                "extraction budget exhausted"
            );
        }
    }

    async fn finish_failure(
        &self,
        task: &FetchTask,
        source: &Source,
        err: Error,
        completion: CompletionGuard,
    ) -> Result<RunOutcome> {
        let now = Utc::now();
        let fetch_error = err.as_fetch();
        let mut result = FetchResult {
            success: false,
            status_code: fetch_error.and_then(|e| e.status()),
            error_kind: Some(fetch_error.map_or("internal", |e| e.kind()).to_string()),
            error: Some(err.to_string()),
            ..FetchResult::default()
        };

        let decision = match self.policy.evaluate(source.retry_attempt, &err, now) {
            Ok(decision) => decision,
            Err(policy_err) => {
                error!(source_id = %source.id, error = %policy_err, "retry policy failed, marking source failed");
                self.mark_failed(task, source.id, |_| {}).await;
                completion.complete(result).await;
                return Err(err);
            }
        };

        match decision {
            RetryDecision::Retry {
                attempt,
                delay,
                retry_at,
            } => {
                let rescheduled = self
                    .db
                    .update_source(source.id, |s| {
                        if s.task_id.as_ref() != Some(&task.id) {
                            return None;
                        }
                        s.fetch_status = FetchStatus::Queued;
                        s.retry_attempt = attempt;
                        s.next_fetch_at = Some(retry_at);
                        s.queued_at = Some(retry_at);
                        Some(())
                    })
                    .await;

                match rescheduled {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        completion.complete(result).await;
                        return Ok(RunOutcome::Skipped);
                    }
                    Err(e) => {
                        completion.complete(result).await;
                        return Err(e);
                    }
                }

                if let Err(e) = self.queue.dispatch_after(task.clone(), delay).await {
                    warn!(source_id = %source.id, error = %e, "failed to resubmit retry, marking source failed");
                    self.mark_failed(task, source.id, |_| {}).await;
                    completion.complete(result).await;
                    return Err(err);
                }

                info!(
                    source_id = %source.id,
                    attempt,
                    max_attempts = self.policy.config().max_attempts,
                    retry_at = %retry_at,
                    "fetch failed, retry scheduled"
                );
                result.next_fetch_at = Some(retry_at);
                completion.complete(result).await;
                Ok(RunOutcome::RetryScheduled { attempt, retry_at })
            }
            RetryDecision::OpenCircuit { until } => {
                warn!(source_id = %source.id, until = %until, "retries exhausted, opening circuit");
                self.mark_failed(task, source.id, |s| {
                    s.circuit_opened_at = Some(now);
                    s.circuit_until = Some(until);
                    s.backoff_until = Some(until);
                    s.next_fetch_at = Some(until);
                })
                .await;
                result.next_fetch_at = Some(until);
                completion.complete(result).await;
                Err(err)
            }
            RetryDecision::GiveUp => {
                warn!(source_id = %source.id, error = %err, "permanent fetch failure");
                self.mark_failed(task, source.id, |_| {}).await;
                completion.complete(result).await;
                Err(err)
            }
        }
    }

    /// Set `failed`, clear retry state and apply `extra`, unless the task was superseded
    async fn mark_failed<F>(&self, task: &FetchTask, source_id: SourceId, extra: F)
    where
        F: Fn(&mut Source),
    {
        let updated = self
            .db
            .update_source(source_id, |s| {
                if s.task_id.as_ref() != Some(&task.id) {
                    return None;
                }
                s.fetch_status = FetchStatus::Failed;
                s.retry_attempt = 0;
                s.queued_at = None;
                s.task_id = None;
                extra(s);
                Some(())
            })
            .await;

        if let Err(e) = updated {
            error!(source_id = %source_id, error = %e, "failed to mark source failed");
        }
    }
}

fn mark_queued(source: &mut Source, task_id: &TaskId, now: DateTime<Utc>) {
    source.fetch_status = FetchStatus::Queued;
    source.queued_at = Some(now);
    source.task_id = Some(task_id.clone());
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
