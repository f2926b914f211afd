//! Retry policy and circuit breaker
//!
//! [`RetryPolicy::evaluate`] is a pure decision over the retries already spent,
//! the error and the current time. It never sleeps and never touches the
//! database; the caller applies the decision to the source.
//!
//! # Example
//!
//! ```no_run
//! use feedpulse::config::RetryConfig;
//! use feedpulse::error::FetchError;
//! use feedpulse::retry::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let err = FetchError::HttpStatus { status: 503 };
//! match policy.evaluate(0, &err, chrono::Utc::now()) {
//!     Ok(RetryDecision::Retry { retry_at, .. }) => println!("retry at {retry_at}"),
//!     Ok(other) => println!("{other:?}"),
//!     Err(e) => eprintln!("policy failed: {e}"),
//! }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FetchError, PolicyError};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, refused connections, overloaded servers) return `true`.
/// Permanent failures (missing feeds, forbidden endpoints) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) => true,
            // A malformed body is often a truncated or half-deployed document
            FetchError::Parse(_) => true,
            FetchError::Storage(_) => true,
            FetchError::HttpStatus { status } => *status == 429 || (500..600).contains(status),
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            // Contention is rescheduled by the task entry point, not retried here
            Error::Concurrency(_) => false,
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::Policy(_) => false,
            Error::SourceNotFound(_) | Error::InvalidUrl { .. } | Error::InvalidInterval(_) => {
                false
            }
            Error::ShuttingDown => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// What to do after a failed attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the same task again at `retry_at`
    Retry {
        /// Retries spent once this one is scheduled
        attempt: u32,
        /// Wait before the retry
        delay: Duration,
        /// `now + delay`
        retry_at: DateTime<Utc>,
    },
    /// Retries are exhausted; suppress scheduling until `until`
    OpenCircuit {
        /// End of the cooldown
        until: DateTime<Utc>,
    },
    /// The error is permanent
    GiveUp,
}

/// Exponential backoff with a circuit breaker on exhaustion
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration this policy evaluates
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide how to continue after `error`, with `attempt` retries already spent
    pub fn evaluate<E>(
        &self,
        attempt: u32,
        error: &E,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, PolicyError>
    where
        E: IsRetryable + ?Sized,
    {
        if !error.is_retryable() {
            return Ok(RetryDecision::GiveUp);
        }

        if attempt < self.config.max_attempts {
            let delay = self.backoff(attempt)?;
            let delay = if self.config.jitter {
                add_jitter(delay)
            } else {
                delay
            };
            let retry_at = add_to(now, delay)?;

            return Ok(RetryDecision::Retry {
                attempt: attempt + 1,
                delay,
                retry_at,
            });
        }

        Ok(RetryDecision::OpenCircuit {
            until: add_to(now, self.config.circuit_cooldown)?,
        })
    }

    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, without jitter
    pub fn backoff(&self, attempt: u32) -> Result<Duration, PolicyError> {
        let exponent = i32::try_from(attempt).map_err(|_| PolicyError::InvalidBackoff { attempt })?;
        let secs = self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);

        if secs.is_nan() || secs < 0.0 {
            return Err(PolicyError::InvalidBackoff { attempt });
        }

        let max = self.config.max_delay.as_secs_f64();
        Ok(Duration::from_secs_f64(secs.min(max)))
    }
}

fn add_to(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, PolicyError> {
    let delta = chrono::Duration::from_std(delay).map_err(|_| PolicyError::TimeOverflow)?;
    now.checked_add_signed(delta).ok_or(PolicyError::TimeOverflow)
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
