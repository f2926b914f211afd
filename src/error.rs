//! Error types for feedpulse
//!
//! The taxonomy separates failures of a single fetch attempt ([`FetchError`]),
//! expected contention between workers ([`ConcurrencyError`]), defects in
//! retry evaluation ([`PolicyError`]) and persistence problems
//! ([`DatabaseError`]). Everything converges on the crate-level [`Error`].

use thiserror::Error;

/// Result type alias for feedpulse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for feedpulse
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "health.window_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A fetch attempt failed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Another worker holds the resource; try again later
    #[error("concurrency conflict: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Retry evaluation failed
    #[error("retry policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Source does not exist
    #[error("source {0} not found")]
    SourceNotFound(i64),

    /// Source URL is not an absolute http(s) URL
    #[error("invalid source url {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Source fetch interval is not a positive number of minutes
    #[error("fetch interval must be at least one minute, got {0}")]
    InvalidInterval(i64),

    /// Task queue no longer accepts work
    #[error("task queue is shut down")]
    ShuttingDown,

    /// HTTP client construction error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error only signals contention with another worker
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// The fetch failure carried by this error, if any
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Error::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Failure of a single fetch attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request did not complete within the configured timeout
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection, DNS or TLS failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// The endpoint answered with an unexpected status
    #[error("unexpected HTTP status {status}")]
    HttpStatus {
        /// Response status code
        status: u16,
    },

    /// The endpoint answered but the body is not a readable feed
    #[error("failed to parse feed: {0}")]
    Parse(String),

    /// The feed was read but its entries could not be stored
    #[error("failed to store feed items: {0}")]
    Storage(String),
}

impl FetchError {
    /// Short, stable name of the error class (stored in attempt logs)
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Connection(_) => "connection",
            FetchError::HttpStatus { .. } => "http_status",
            FetchError::Parse(_) => "parse",
            FetchError::Storage(_) => "item_store",
        }
    }

    /// HTTP status associated with the failure, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status } => Some(*status),
            _ => None,
        }
    }
}

/// Contention between workers; never a hard failure
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// Another holder owns the keyed lock
    #[error("lock {namespace}:{key} is held by another worker")]
    LockHeld {
        /// Lock namespace
        namespace: String,
        /// Lock key within the namespace
        key: String,
    },

    /// The source row kept changing underneath a read-modify-write cycle
    #[error("source {source_id} changed concurrently {attempts} times in a row")]
    UpdateConflict {
        /// Contended source
        source_id: i64,
        /// Number of cycles attempted
        attempts: u32,
    },
}

/// Defect inside retry/circuit evaluation
///
/// Callers never surface this in place of the fetch error that triggered the
/// evaluation; they log it and re-raise the original error instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Backoff computation produced a non-representable delay
    #[error("backoff for attempt {attempt} is not representable")]
    InvalidBackoff {
        /// Attempt number being evaluated
        attempt: u32,
    },

    /// Adding a delay to the reference time overflowed
    #[error("time arithmetic overflowed")]
    TimeOverflow,
}
