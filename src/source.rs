//! The per-feed aggregate mutated by the scheduler, runner and health monitor.

use crate::types::{FetchStatus, HealthStatus, SourceId, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One monitored feed and all of its scheduling and health state
///
/// Writers never persist a `Source` they read earlier; they go through
/// [`Database::update_source`](crate::db::Database::update_source), which
/// reloads the row, applies the mutation and persists it guarded by `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Unique database ID
    pub id: SourceId,
    /// Display name
    pub name: String,
    /// Feed endpoint
    pub url: String,
    /// Inactive sources are never scheduled
    pub active: bool,
    /// Position in the fetch cycle
    pub fetch_status: FetchStatus,
    /// When the source is next due (None = due now)
    pub next_fetch_at: Option<DateTime<Utc>>,
    /// Current fetch interval in minutes
    pub fetch_interval_minutes: i64,
    /// Whether the interval adapts to observed change frequency
    pub adaptive_fetching_enabled: bool,
    /// Cached `ETag` validator
    pub etag: Option<String>,
    /// Cached `Last-Modified` validator
    pub last_modified: Option<String>,
    /// Hash over the last seen normalized entries
    pub content_signature: Option<String>,
    /// Consecutive failed fetches
    pub failure_count: i64,
    /// Last error message
    pub last_error: Option<String>,
    /// When the last error was recorded
    pub last_error_at: Option<DateTime<Utc>>,
    /// Retries consumed in the current retry window
    pub retry_attempt: u32,
    /// When the circuit last opened
    pub circuit_opened_at: Option<DateTime<Utc>>,
    /// Scheduling is suppressed until this instant
    pub circuit_until: Option<DateTime<Utc>>,
    /// Backoff marker set by failures and auto-pause
    pub backoff_until: Option<DateTime<Utc>>,
    /// Fraction of successes in the rolling window
    pub rolling_success_rate: Option<f64>,
    /// Reliability classification
    pub health_status: HealthStatus,
    /// When the current auto-pause started
    pub auto_paused_at: Option<DateTime<Utc>>,
    /// When the current auto-pause ends
    pub auto_paused_until: Option<DateTime<Utc>>,
    /// Per-source override of the global auto-pause threshold
    pub pause_threshold: Option<f64>,
    /// Whether newly created entries get follow-up extraction tasks
    pub extraction_enabled: bool,
    /// When the current or last fetch started
    pub last_fetch_started_at: Option<DateTime<Utc>>,
    /// When the current fetch task was queued
    pub queued_at: Option<DateTime<Utc>>,
    /// When the last fetch attempt finished
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// When the last successful fetch finished
    pub last_success_at: Option<DateTime<Utc>>,
    /// Task currently responsible for this source
    pub task_id: Option<TaskId>,
    /// When the source was created
    pub created_at: DateTime<Utc>,
    /// Row version for optimistic concurrency
    pub version: i64,
}

impl Source {
    /// Active and the next fetch time is unset or has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_fetch_at.is_none_or(|at| at <= now)
    }

    /// The circuit breaker currently suppresses scheduling
    pub fn circuit_open(&self, now: DateTime<Utc>) -> bool {
        self.circuit_until.is_some_and(|until| until > now)
    }

    /// An auto-pause window is in effect
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.auto_paused_until.is_some_and(|until| until > now)
    }

    /// Due, not suppressed, and not already in flight
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now)
            && !self.circuit_open(now)
            && !self.is_paused(now)
            && matches!(self.fetch_status, FetchStatus::Idle | FetchStatus::Failed)
    }

    /// Fixed scheduling interval as a chrono duration, saturating on overflow
    pub fn interval(&self) -> Duration {
        Duration::try_minutes(self.fetch_interval_minutes).unwrap_or(Duration::MAX)
    }

    /// `now` plus the fixed interval, capped at the latest representable instant
    pub fn next_fixed_fetch(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
pub(crate) fn sample_source(now: DateTime<Utc>) -> Source {
    Source {
        id: SourceId(1),
        name: "Example".to_string(),
        url: "https://example.com/feed.xml".to_string(),
        active: true,
        fetch_status: FetchStatus::Idle,
        next_fetch_at: None,
        fetch_interval_minutes: 60,
        adaptive_fetching_enabled: true,
        etag: None,
        last_modified: None,
        content_signature: None,
        failure_count: 0,
        last_error: None,
        last_error_at: None,
        retry_attempt: 0,
        circuit_opened_at: None,
        circuit_until: None,
        backoff_until: None,
        rolling_success_rate: None,
        health_status: HealthStatus::Healthy,
        auto_paused_at: None,
        auto_paused_until: None,
        pause_threshold: None,
        extraction_enabled: false,
        last_fetch_started_at: None,
        queued_at: None,
        last_fetched_at: None,
        last_success_at: None,
        task_id: None,
        created_at: now,
        version: 0,
    }
}
