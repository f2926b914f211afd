//! Adaptive interval arithmetic.

use crate::config::AdaptiveConfig;
use chrono::Duration;
use rand::Rng;

/// What the last attempt revealed about the feed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalSignal {
    /// Content identical to the previous fetch (or 304)
    Unchanged,
    /// Content changed
    Changed,
    /// The attempt failed
    Failure,
}

/// Scale `current` by the factor for `signal`, round to whole minutes and clamp
pub fn next_interval(current_minutes: i64, signal: IntervalSignal, config: &AdaptiveConfig) -> i64 {
    let factor = match signal {
        IntervalSignal::Unchanged => config.increase_factor,
        IntervalSignal::Changed => config.decrease_factor,
        IntervalSignal::Failure => config.failure_increase_factor,
    };

    let scaled = (current_minutes as f64 * factor).round();
    // `as` saturates on out-of-range floats
    (scaled as i64).clamp(config.min_interval_minutes, config.max_interval_minutes)
}

/// Delay until the next fetch: the interval randomized by ±`jitter_percent`
///
/// Only the delay is randomized; the stored interval stays exact so repeated
/// jitter never compounds.
pub fn jittered_delay(interval_minutes: i64, jitter_percent: f64) -> Duration {
    let base_secs = interval_minutes.saturating_mul(60) as f64;
    let spread = (jitter_percent / 100.0).clamp(0.0, 1.0);

    let factor = if spread > 0.0 {
        1.0 + rand::thread_rng().gen_range(-spread..=spread)
    } else {
        1.0
    };

    Duration::try_seconds((base_secs * factor).round() as i64).unwrap_or(Duration::MAX)
}
