//! Database layer for feedpulse
//!
//! Handles SQLite persistence for sources, fetch attempts, locks, stored items
//! and task failure records.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`sources`]: Source CRUD, atomic updates, due/stalled selection
//! - [`attempts`]: Append-only fetch attempt log
//! - [`locks`]: Keyed expiring locks
//! - [`items`]: Stored feed items and retention
//! - [`tasks`]: Task failure records

use crate::source::Source;
use crate::types::{FetchStatus, HealthStatus, SourceId, TaskId};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod attempts;
mod items;
mod locks;
mod migrations;
mod sources;
mod tasks;

pub use items::{ItemUpsert, ItemWrite};

/// New source to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewSource {
    /// Display name
    pub name: String,
    /// Feed endpoint
    pub url: String,
    /// Initial (or fixed) fetch interval in minutes
    pub fetch_interval_minutes: i64,
    /// Whether the interval adapts to observed change frequency
    pub adaptive_fetching_enabled: bool,
    /// Whether newly created entries get follow-up extraction tasks
    pub extraction_enabled: bool,
    /// Per-source auto-pause threshold override
    pub pause_threshold: Option<f64>,
    /// Whether the source starts active
    pub active: bool,
}

impl NewSource {
    /// Active adaptive source with a one hour starting interval
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            fetch_interval_minutes: 60,
            adaptive_fetching_enabled: true,
            extraction_enabled: false,
            pause_threshold: None,
            active: true,
        }
    }
}

/// Source record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct SourceRow {
    /// Unique database ID
    pub id: i64,
    /// Display name
    pub name: String,
    /// Feed endpoint
    pub url: String,
    /// Whether the source is active
    pub active: bool,
    /// Fetch status code (0=idle, 1=queued, 2=fetching, 3=failed)
    pub fetch_status: i32,
    /// Unix timestamp of the next due time
    pub next_fetch_at: Option<i64>,
    /// Fetch interval in minutes
    pub fetch_interval_minutes: i64,
    /// Whether adaptive fetching is enabled
    pub adaptive_fetching: bool,
    /// Cached ETag
    pub etag: Option<String>,
    /// Cached Last-Modified
    pub last_modified: Option<String>,
    /// Content signature of the last seen entries
    pub content_signature: Option<String>,
    /// Consecutive failures
    pub failure_count: i64,
    /// Last error message
    pub last_error: Option<String>,
    /// Unix timestamp of the last error
    pub last_error_at: Option<i64>,
    /// Retries consumed in the current window
    pub retry_attempt: i64,
    /// Unix timestamp when the circuit opened
    pub circuit_opened_at: Option<i64>,
    /// Unix timestamp until which the circuit is open
    pub circuit_until: Option<i64>,
    /// Unix timestamp of the backoff marker
    pub backoff_until: Option<i64>,
    /// Rolling success rate
    pub rolling_success_rate: Option<f64>,
    /// Health status code (see [`HealthStatus::to_i32`])
    pub health_status: i32,
    /// Unix timestamp when the auto-pause started
    pub auto_paused_at: Option<i64>,
    /// Unix timestamp when the auto-pause ends
    pub auto_paused_until: Option<i64>,
    /// Per-source auto-pause threshold override
    pub pause_threshold: Option<f64>,
    /// Whether extraction is enabled
    pub extraction_enabled: bool,
    /// Unix timestamp of the last fetch start
    pub last_fetch_started_at: Option<i64>,
    /// Unix timestamp when the current task was queued
    pub queued_at: Option<i64>,
    /// Unix timestamp of the last finished attempt
    pub last_fetched_at: Option<i64>,
    /// Unix timestamp of the last success
    pub last_success_at: Option<i64>,
    /// Current task id
    pub task_id: Option<String>,
    /// Unix timestamp when the source was created
    pub created_at: i64,
    /// Row version
    pub version: i64,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            id: SourceId(row.id),
            name: row.name,
            url: row.url,
            active: row.active,
            fetch_status: FetchStatus::from_i32(row.fetch_status),
            next_fetch_at: from_ts(row.next_fetch_at),
            fetch_interval_minutes: row.fetch_interval_minutes,
            adaptive_fetching_enabled: row.adaptive_fetching,
            etag: row.etag,
            last_modified: row.last_modified,
            content_signature: row.content_signature,
            failure_count: row.failure_count,
            last_error: row.last_error,
            last_error_at: from_ts(row.last_error_at),
            retry_attempt: u32::try_from(row.retry_attempt).unwrap_or(0),
            circuit_opened_at: from_ts(row.circuit_opened_at),
            circuit_until: from_ts(row.circuit_until),
            backoff_until: from_ts(row.backoff_until),
            rolling_success_rate: row.rolling_success_rate,
            health_status: HealthStatus::from_i32(row.health_status),
            auto_paused_at: from_ts(row.auto_paused_at),
            auto_paused_until: from_ts(row.auto_paused_until),
            pause_threshold: row.pause_threshold,
            extraction_enabled: row.extraction_enabled,
            last_fetch_started_at: from_ts(row.last_fetch_started_at),
            queued_at: from_ts(row.queued_at),
            last_fetched_at: from_ts(row.last_fetched_at),
            last_success_at: from_ts(row.last_success_at),
            task_id: row.task_id.map(TaskId),
            created_at: from_ts(Some(row.created_at)).unwrap_or_else(Utc::now),
            version: row.version,
        }
    }
}

/// New fetch attempt to be appended to the log
#[derive(Debug, Clone)]
pub struct NewFetchAttempt {
    /// Source that was fetched
    pub source_id: SourceId,
    /// Whether the attempt succeeded
    pub success: bool,
    /// HTTP status, when the server answered
    pub http_status: Option<u16>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt finished
    pub completed_at: DateTime<Utc>,
    /// Error class for failed attempts
    pub error_kind: Option<String>,
    /// Error message for failed attempts
    pub error_message: Option<String>,
    /// Entries created
    pub items_created: u32,
    /// Entries updated
    pub items_updated: u32,
    /// Entries rejected
    pub items_failed: u32,
}

/// Fetch attempt record from database
#[derive(Debug, Clone, FromRow)]
pub struct FetchAttempt {
    /// Unique database ID
    pub id: i64,
    /// Source that was fetched
    pub source_id: i64,
    /// Whether the attempt succeeded
    pub success: bool,
    /// HTTP status, when the server answered
    pub http_status: Option<i64>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: i64,
    /// Unix timestamp when the attempt started
    pub started_at: i64,
    /// Unix timestamp when the attempt finished
    pub completed_at: i64,
    /// Error class for failed attempts
    pub error_kind: Option<String>,
    /// Error message for failed attempts
    pub error_message: Option<String>,
    /// Entries created
    pub items_created: i64,
    /// Entries updated
    pub items_updated: i64,
    /// Entries rejected
    pub items_failed: i64,
}

/// Stored feed item record from database
#[derive(Debug, Clone, FromRow)]
pub struct FeedItemRow {
    /// Unique database ID
    pub id: i64,
    /// Owning source
    pub source_id: i64,
    /// Entry identity within the source
    pub guid: String,
    /// Entry title
    pub title: String,
    /// Entry link
    pub link: Option<String>,
    /// Unix timestamp of the entry's publication date
    pub published_at: Option<i64>,
    /// Hash of the entry's normalized content
    pub content_hash: String,
    /// Unix timestamp when the entry was first stored
    pub first_seen_at: i64,
    /// Unix timestamp of the last content change
    pub updated_at: i64,
}

/// Task failure record from database
#[derive(Debug, Clone, FromRow)]
pub struct TaskFailureRow {
    /// Failed task
    pub task_id: String,
    /// Source the task was fetching
    pub source_id: i64,
    /// Error message
    pub error: String,
    /// Unix timestamp of the failure
    pub failed_at: i64,
}

/// Database handle for feedpulse
pub struct Database {
    pool: SqlitePool,
}

/// Convert an optional unix timestamp to a UTC datetime
pub(crate) fn from_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Convert an optional UTC datetime to a unix timestamp
pub(crate) fn to_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
