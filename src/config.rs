//! Configuration types for feedpulse
//!
//! Every section has serde defaults, so an empty JSON object is a valid
//! configuration. Durations are (de)serialized as whole seconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration
///
/// Settings are grouped by the component that consumes them:
/// - [`scheduler`](SchedulerConfig): tick cadence, batch size, stale thresholds, workers
/// - [`adaptive`](AdaptiveConfig): interval bounds and adjustment factors
/// - [`retry`](RetryConfig): retry backoff and circuit cooldown
/// - [`health`](HealthConfig): rolling window, status thresholds, auto-pause
/// - [`fetch`](FetchConfig): transport and lock settings
/// - [`extraction`](ExtractionConfig): follow-up task budget
/// - [`retention`](RetentionConfig): stored item limits
/// - [`persistence`](PersistenceConfig): database location
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler tick and worker settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Adaptive fetch-interval settings
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Retry and circuit-breaker settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Health monitoring settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Transport and concurrency-guard settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Follow-up extraction settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Item retention settings
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Data storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Parse a configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the scheduling invariants
    pub fn validate(&self) -> Result<()> {
        let adaptive = &self.adaptive;
        if adaptive.min_interval_minutes < 1 {
            return Err(config_error(
                "minimum interval must be at least one minute",
                "adaptive.min_interval_minutes",
            ));
        }
        if adaptive.min_interval_minutes > adaptive.max_interval_minutes {
            return Err(config_error(
                "minimum interval exceeds maximum interval",
                "adaptive.min_interval_minutes",
            ));
        }
        if !(adaptive.increase_factor > 1.0 && adaptive.increase_factor.is_finite()) {
            return Err(config_error(
                "increase factor must be greater than 1",
                "adaptive.increase_factor",
            ));
        }
        if !(adaptive.decrease_factor > 0.0 && adaptive.decrease_factor < 1.0) {
            return Err(config_error(
                "decrease factor must be between 0 and 1",
                "adaptive.decrease_factor",
            ));
        }
        if !(adaptive.failure_increase_factor >= 1.0 && adaptive.failure_increase_factor.is_finite())
        {
            return Err(config_error(
                "failure increase factor must be at least 1",
                "adaptive.failure_increase_factor",
            ));
        }
        if !(0.0..100.0).contains(&adaptive.jitter_percent) {
            return Err(config_error(
                "jitter percent must be in [0, 100)",
                "adaptive.jitter_percent",
            ));
        }

        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(config_error(
                "backoff multiplier must be at least 1",
                "retry.backoff_multiplier",
            ));
        }

        let health = &self.health;
        if health.window_size == 0 {
            return Err(config_error(
                "health window must hold at least one attempt",
                "health.window_size",
            ));
        }
        for (value, key) in [
            (health.healthy_threshold, "health.healthy_threshold"),
            (health.warning_threshold, "health.warning_threshold"),
            (health.pause_threshold, "health.pause_threshold"),
            (health.resume_threshold, "health.resume_threshold"),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(config_error("threshold must be within [0, 1]", key));
            }
        }
        if health.warning_threshold > health.healthy_threshold {
            return Err(config_error(
                "warning threshold exceeds healthy threshold",
                "health.warning_threshold",
            ));
        }
        if health.resume_threshold < health.pause_threshold {
            return Err(config_error(
                "resume threshold must not be below pause threshold",
                "health.resume_threshold",
            ));
        }

        if self.scheduler.worker_concurrency == 0 {
            return Err(config_error(
                "at least one worker is required",
                "scheduler.worker_concurrency",
            ));
        }
        if self.fetch.lock_ttl < Duration::from_secs(3) {
            return Err(config_error(
                "lock TTL must be at least 3 seconds to allow heartbeat renewal",
                "fetch.lock_ttl",
            ));
        }

        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Scheduler tick and worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between scheduler ticks (default: 60 seconds)
    #[serde(default = "default_tick_interval", with = "duration_serde")]
    pub tick_interval: Duration,

    /// Maximum sources enqueued per tick (default: 100)
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Age after which a queued source is considered stalled (default: 15 minutes)
    #[serde(default = "default_stale_after", with = "duration_serde")]
    pub stale_queued_after: Duration,

    /// Age after which a fetching source is considered stalled (default: 15 minutes)
    #[serde(default = "default_stale_after", with = "duration_serde")]
    pub stale_fetching_after: Duration,

    /// Concurrent fetch workers in the local task queue (default: 4)
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Delay before a task that lost the per-source lock is retried (default: 30 seconds)
    #[serde(default = "default_lock_retry_delay", with = "duration_serde")]
    pub lock_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            batch_limit: default_batch_limit(),
            stale_queued_after: default_stale_after(),
            stale_fetching_after: default_stale_after(),
            worker_concurrency: default_worker_concurrency(),
            lock_retry_delay: default_lock_retry_delay(),
        }
    }
}

/// Adaptive fetch-interval configuration
///
/// Intervals are whole minutes. After every successful fetch the interval is
/// multiplied by `increase_factor` (content unchanged) or `decrease_factor`
/// (content changed); after a failure by `failure_increase_factor`. The result
/// is rounded and clamped to `[min_interval_minutes, max_interval_minutes]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Lower interval bound in minutes (default: 5)
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: i64,

    /// Upper interval bound in minutes (default: 1440)
    #[serde(default = "default_max_interval")]
    pub max_interval_minutes: i64,

    /// Multiplier applied when content is unchanged (default: 1.25)
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,

    /// Multiplier applied when content changed (default: 0.75)
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Multiplier applied after a failed fetch (default: 2.0)
    #[serde(default = "default_failure_increase_factor")]
    pub failure_increase_factor: f64,

    /// Symmetric randomization of the scheduling delay, in percent (default: 10)
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: default_min_interval(),
            max_interval_minutes: default_max_interval(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            failure_increase_factor: default_failure_increase_factor(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

/// Retry behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before the circuit opens (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 60 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 minutes)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// How long an open circuit suppresses scheduling (default: 1 hour)
    #[serde(default = "default_circuit_cooldown", with = "duration_serde")]
    pub circuit_cooldown: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            circuit_cooldown: default_circuit_cooldown(),
        }
    }
}

/// Health monitoring configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of most recent attempts in the rolling window (default: 20)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Success rate at or above which a source is healthy (default: 0.9)
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: f64,

    /// Success rate at or above which a source is in warning, below is critical (default: 0.7)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Success rate below which a source is auto-paused (default: 0.3)
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: f64,

    /// Success rate at or above which an auto-paused source resumes (default: 0.6)
    #[serde(default = "default_resume_threshold")]
    pub resume_threshold: f64,

    /// How long an auto-pause lasts (default: 6 hours)
    #[serde(default = "default_pause_cooldown", with = "duration_serde")]
    pub pause_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            healthy_threshold: default_healthy_threshold(),
            warning_threshold: default_warning_threshold(),
            pause_threshold: default_pause_threshold(),
            resume_threshold: default_resume_threshold(),
            pause_cooldown: default_pause_cooldown(),
        }
    }
}

/// Transport and concurrency-guard configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// HTTP request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Lifetime of a per-source lock without heartbeat renewal (default: 120 seconds)
    #[serde(default = "default_lock_ttl", with = "duration_serde")]
    pub lock_ttl: Duration,

    /// Namespace used for per-source fetch locks
    #[serde(default = "default_lock_namespace")]
    pub lock_namespace: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            lock_ttl: default_lock_ttl(),
            lock_namespace: default_lock_namespace(),
        }
    }
}

/// Follow-up extraction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum extraction tasks in flight per source (default: 5)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_source: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_source: default_max_in_flight(),
        }
    }
}

/// Item retention configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Newest items kept per source (None = keep everything, default: 500)
    #[serde(default = "default_max_items")]
    pub max_items_per_source: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_items_per_source: default_max_items(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (default: "feedpulse.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_batch_limit() -> usize {
    100
}

fn default_stale_after() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_lock_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_min_interval() -> i64 {
    5
}

fn default_max_interval() -> i64 {
    1440
}

fn default_increase_factor() -> f64 {
    1.25
}

fn default_decrease_factor() -> f64 {
    0.75
}

fn default_failure_increase_factor() -> f64 {
    2.0
}

fn default_jitter_percent() -> f64 {
    10.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_circuit_cooldown() -> Duration {
    Duration::from_secs(3600)
}

fn default_true() -> bool {
    true
}

fn default_window_size() -> usize {
    20
}

fn default_healthy_threshold() -> f64 {
    0.9
}

fn default_warning_threshold() -> f64 {
    0.7
}

fn default_pause_threshold() -> f64 {
    0.3
}

fn default_resume_threshold() -> f64 {
    0.6
}

fn default_pause_cooldown() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("feedpulse/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_lock_namespace() -> String {
    "feed-fetch".to_string()
}

fn default_max_in_flight() -> usize {
    5
}

fn default_max_items() -> Option<usize> {
    Some(500)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("feedpulse.db")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
