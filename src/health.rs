//! Source health classification and auto-pause
//!
//! After every completed fetch the monitor recomputes the rolling success rate
//! over the most recent attempts, derives a [`HealthStatus`], and pauses or
//! resumes the source. The pure part lives in [`apply_health`]; the
//! [`HealthMonitor`] loads the attempt window, persists the result atomically
//! and broadcasts transitions.

use crate::config::HealthConfig;
use crate::db::Database;
use crate::events::EventHandler;
use crate::source::Source;
use crate::types::{Event, HealthStatus, SourceId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Consecutive failures at the head of the window that mark a source declining
const DECLINING_RUN: usize = 3;

/// Newest successes needed on top of a failure to report improving
const IMPROVING_RUN: usize = 2;

/// Transition produced by one evaluation
#[derive(Clone, Debug, PartialEq)]
pub struct HealthChange {
    /// Status before the evaluation
    pub from: HealthStatus,
    /// Status after the evaluation
    pub to: HealthStatus,
    /// Rolling success rate, when any attempts exist
    pub success_rate: Option<f64>,
    /// Set when this evaluation started an auto-pause
    pub paused_until: Option<DateTime<Utc>>,
    /// Set when this evaluation lifted an auto-pause
    pub resumed: bool,
}

/// Apply one health evaluation to `source`
///
/// `outcomes` are the success flags of the most recent attempts, newest first,
/// at most `window_size` of them.
pub fn apply_health(
    source: &mut Source,
    outcomes: &[bool],
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> HealthChange {
    let from = source.health_status;
    let window = config.window_size.max(1);
    let outcomes = &outcomes[..outcomes.len().min(window)];
    let full = outcomes.len() >= window;

    let mut paused_until = None;
    let mut resumed = false;

    if !outcomes.is_empty() {
        let successes = outcomes.iter().filter(|ok| **ok).count();
        let rate = successes as f64 / outcomes.len() as f64;
        source.rolling_success_rate = Some(rate);

        if full {
            let pause_threshold = source.pause_threshold.unwrap_or(config.pause_threshold);
            if rate < pause_threshold {
                let was_paused = source.is_paused(now);
                let until = pause_boundary(source, config, now);
                source.auto_paused_until = Some(until);
                if source.auto_paused_at.is_none() {
                    source.auto_paused_at = Some(now);
                }
                if source.next_fetch_at.is_none_or(|at| at < until) {
                    source.next_fetch_at = Some(until);
                }
                if source.backoff_until.is_none_or(|at| at < until) {
                    source.backoff_until = Some(until);
                }
                if !was_paused {
                    paused_until = Some(until);
                }
            } else if source.auto_paused_until.is_some() && rate >= config.resume_threshold {
                lift_pause(source, now);
                resumed = true;
            }
        }
    }

    if !source.adaptive_fetching_enabled
        && !source.is_paused(now)
        && !source.circuit_open(now)
        && source.backoff_until.is_some()
    {
        source.backoff_until = None;
        source.next_fetch_at = Some(source.next_fixed_fetch(now));
    }

    source.health_status = derive_status(source, outcomes, full, config, now);

    HealthChange {
        from,
        to: source.health_status,
        success_rate: source.rolling_success_rate,
        paused_until,
        resumed,
    }
}

fn pause_boundary(source: &Source, config: &HealthConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let cooldown = Duration::from_std(config.pause_cooldown).unwrap_or(Duration::MAX);
    let fresh = now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
    match source.auto_paused_until {
        Some(existing) if existing > fresh => existing,
        _ => fresh,
    }
}

/// Clear the pause and any scheduling state tied to its boundary
fn lift_pause(source: &mut Source, now: DateTime<Utc>) {
    let boundary = source.auto_paused_until.take();
    source.auto_paused_at = None;

    if boundary.is_some() {
        if source.backoff_until == boundary {
            source.backoff_until = None;
        }
        if source.next_fetch_at == boundary {
            source.next_fetch_at = Some(now);
        }
    }
}

fn derive_status(
    source: &Source,
    outcomes: &[bool],
    full: bool,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> HealthStatus {
    if source.is_paused(now) {
        return HealthStatus::AutoPaused;
    }

    if outcomes.len() >= DECLINING_RUN && outcomes[..DECLINING_RUN].iter().all(|ok| !ok) {
        return HealthStatus::Declining;
    }

    let recovering = outcomes.iter().take_while(|ok| **ok).count();
    if recovering >= IMPROVING_RUN && outcomes.get(recovering) == Some(&false) {
        return HealthStatus::Improving;
    }

    match (full, source.rolling_success_rate) {
        (true, Some(rate)) if rate >= config.healthy_threshold => HealthStatus::Healthy,
        (true, Some(rate)) if rate >= config.warning_threshold => HealthStatus::Warning,
        (true, Some(_)) => HealthStatus::Critical,
        _ if source.health_status == HealthStatus::AutoPaused => HealthStatus::Healthy,
        _ => source.health_status,
    }
}

/// Keeps health state current; registered on the event bus
pub struct HealthMonitor {
    db: Arc<Database>,
    config: HealthConfig,
    tx: broadcast::Sender<Event>,
}

impl HealthMonitor {
    /// Transitions are broadcast on `tx`
    pub fn new(db: Arc<Database>, config: HealthConfig, tx: broadcast::Sender<Event>) -> Self {
        Self { db, config, tx }
    }

    /// Re-evaluate a source as of `now`; `None` when nothing changed
    pub async fn evaluate(&self, source_id: SourceId, now: DateTime<Utc>) -> Result<Option<HealthChange>> {
        let window = u32::try_from(self.config.window_size).unwrap_or(u32::MAX);
        let outcomes = self.db.recent_outcomes(source_id, window).await?;

        let updated = self
            .db
            .update_source(source_id, |s| {
                let before = s.clone();
                let change = apply_health(s, &outcomes, &self.config, now);
                (*s != before).then_some(change)
            })
            .await?;

        let Some((_, change)) = updated else {
            return Ok(None);
        };

        self.broadcast(source_id, &change);
        Ok(Some(change))
    }

    /// Manual override: lift any pause, forget the rolling rate and mark healthy
    pub async fn reset_health(&self, source_id: SourceId) -> Result<HealthChange> {
        let now = Utc::now();
        let (_, change) = self
            .db
            .update_source(source_id, |s| {
                let from = s.health_status;
                let resumed = s.auto_paused_until.is_some();
                lift_pause(s, now);
                s.rolling_success_rate = None;
                s.health_status = HealthStatus::Healthy;
                Some(HealthChange {
                    from,
                    to: HealthStatus::Healthy,
                    success_rate: None,
                    paused_until: None,
                    resumed,
                })
            })
            .await?
            .ok_or(crate::Error::SourceNotFound(source_id.get()))?;

        info!(source_id = %source_id, "health reset manually");
        self.broadcast(source_id, &change);
        Ok(change)
    }

    fn broadcast(&self, source_id: SourceId, change: &HealthChange) {
        if change.from != change.to {
            debug!(
                source_id = %source_id,
                from = ?change.from,
                to = ?change.to,
                success_rate = ?change.success_rate,
                "health changed"
            );
            self.tx
                .send(Event::HealthChanged {
                    source_id,
                    from: change.from,
                    to: change.to,
                    success_rate: change.success_rate,
                })
                .ok();
        }

        if let Some(until) = change.paused_until {
            info!(source_id = %source_id, until = %until, "source auto-paused");
            self.tx.send(Event::SourceAutoPaused { source_id, until }).ok();
        }

        if change.resumed {
            info!(source_id = %source_id, "source resumed");
            self.tx.send(Event::SourceResumed { source_id }).ok();
        }
    }
}

#[async_trait]
impl EventHandler for HealthMonitor {
    fn name(&self) -> &'static str {
        "health-monitor"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        if let Event::FetchCompleted { source_id, .. } = event {
            self.evaluate(*source_id, Utc::now()).await?;
        }
        Ok(())
    }
}
