//! Core types for feedpulse

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a source
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl SourceId {
    /// Create a new SourceId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for SourceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<SourceId> for i64 {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for SourceId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SourceId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SourceId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Identifier of one submitted fetch task
///
/// A retried task keeps its id; the reconciler and manual enqueues mint new ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Mint a fresh random task id
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a source is in its fetch cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Waiting for its next due time
    #[default]
    Idle,
    /// A fetch task has been submitted
    Queued,
    /// A worker is fetching right now
    Fetching,
    /// The last attempt failed terminally (circuit open or gave up)
    Failed,
}

impl FetchStatus {
    /// Convert integer status code to FetchStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            1 => FetchStatus::Queued,
            2 => FetchStatus::Fetching,
            3 => FetchStatus::Failed,
            _ => FetchStatus::Idle,
        }
    }

    /// Convert FetchStatus enum to integer for database storage
    pub fn to_i32(&self) -> i32 {
        match self {
            FetchStatus::Idle => 0,
            FetchStatus::Queued => 1,
            FetchStatus::Fetching => 2,
            FetchStatus::Failed => 3,
        }
    }

    /// Lowercase name, as shown to operators
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Idle => "idle",
            FetchStatus::Queued => "queued",
            FetchStatus::Fetching => "fetching",
            FetchStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reliability classification derived from the rolling attempt window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Success rate at or above the healthy threshold
    #[default]
    Healthy,
    /// Success rate between the warning and healthy thresholds
    Warning,
    /// Success rate below the warning threshold
    Critical,
    /// The most recent attempts all failed
    Declining,
    /// Recent successes right after a failure
    Improving,
    /// Scheduling suspended because of a sustained low success rate
    AutoPaused,
}

impl HealthStatus {
    /// Convert integer status code to HealthStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            1 => HealthStatus::Warning,
            2 => HealthStatus::Critical,
            3 => HealthStatus::Declining,
            4 => HealthStatus::Improving,
            5 => HealthStatus::AutoPaused,
            _ => HealthStatus::Healthy,
        }
    }

    /// Convert HealthStatus enum to integer for database storage
    pub fn to_i32(&self) -> i32 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Declining => 3,
            HealthStatus::Improving => 4,
            HealthStatus::AutoPaused => 5,
        }
    }
}

/// Summary of one fetch attempt, carried by [`Event::FetchCompleted`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Whether the attempt succeeded
    pub success: bool,
    /// HTTP status, when the server answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Error class (timeout, connection, http_status, parse, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Error message for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the content signature changed
    pub content_changed: bool,
    /// Entries created in the item store
    pub created: u32,
    /// Entries updated in the item store
    pub updated: u32,
    /// Entries the item store rejected
    pub failed: u32,
    /// Wall-clock duration of the attempt in milliseconds
    pub duration_ms: u64,
    /// When the source is next due
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fetch_at: Option<DateTime<Utc>>,
}

impl FetchResult {
    /// Result for an attempt that ended without reaching the fetcher's verdict
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some("aborted".to_string()),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Events delivered to registered handlers and broadcast subscribers
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A fetch attempt finished, successfully or not
    FetchCompleted {
        /// Source that was fetched
        source_id: SourceId,
        /// Attempt summary
        result: FetchResult,
    },

    /// The item store processed a batch of entries
    ItemProcessed {
        /// Source the entries belong to
        source_id: SourceId,
        /// Entries created
        created: u32,
        /// Entries updated
        updated: u32,
        /// Entries rejected
        failed: u32,
    },

    /// A source's health classification changed
    HealthChanged {
        /// Source whose health changed
        source_id: SourceId,
        /// Previous classification
        from: HealthStatus,
        /// New classification
        to: HealthStatus,
        /// Rolling success rate at the time of the change
        #[serde(skip_serializing_if = "Option::is_none")]
        success_rate: Option<f64>,
    },

    /// A source was automatically paused
    SourceAutoPaused {
        /// Paused source
        source_id: SourceId,
        /// When scheduling may resume
        until: DateTime<Utc>,
    },

    /// An auto-paused source resumed
    SourceResumed {
        /// Resumed source
        source_id: SourceId,
    },

    /// The reconciler reclaimed stalled sources
    StalledRecovered {
        /// Reclaimed sources
        source_ids: Vec<SourceId>,
    },
}
