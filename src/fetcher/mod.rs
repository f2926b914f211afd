//! One fetch attempt and its effect on the source's schedule
//!
//! [`FeedFetcher::fetch`] performs a conditional request, classifies the
//! answer, hands entries to the [`ItemStore`] and persists the outcome: cache
//! validators, content signature, failure counters and the next due time. It
//! leaves `fetch_status` and retry bookkeeping to the runner.

mod interval;

pub use interval::{IntervalSignal, jittered_delay, next_interval};

use crate::config::AdaptiveConfig;
use crate::db::{Database, NewFetchAttempt};
use crate::error::FetchError;
use crate::events::EventBus;
use crate::feed::{content_signature, parse_feed};
use crate::items::{ItemStore, ProcessResult};
use crate::source::Source;
use crate::transport::{ConditionalRequest, Transport, TransportResponse};
use crate::types::Event;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Successful attempt as seen by the runner
#[derive(Clone, Debug, PartialEq)]
pub struct FetchOutcome {
    /// HTTP status (200-class or 304)
    pub status_code: u16,
    /// Whether the content signature changed
    pub content_changed: bool,
    /// What the item store did (empty for 304)
    pub items: ProcessResult,
    /// Interval after adaptation, in minutes
    pub interval_minutes: i64,
    /// When the source is due next
    pub next_fetch_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

/// Performs fetch attempts and adapts the fetch interval
pub struct FeedFetcher {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    items: Arc<dyn ItemStore>,
    events: Arc<EventBus>,
    config: AdaptiveConfig,
}

struct Attempt {
    started_at: DateTime<Utc>,
    clock: Instant,
}

impl Attempt {
    fn start() -> Self {
        Self {
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl FeedFetcher {
    /// Create a fetcher
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        items: Arc<dyn ItemStore>,
        events: Arc<EventBus>,
        config: AdaptiveConfig,
    ) -> Self {
        Self {
            db,
            transport,
            items,
            events,
            config,
        }
    }

    /// Run one attempt against `source`
    ///
    /// Failures are persisted (attempt log, failure counters, backoff) before
    /// the typed error is returned.
    pub async fn fetch(&self, source: &Source) -> Result<FetchOutcome> {
        let attempt = Attempt::start();
        let request = ConditionalRequest {
            url: source.url.clone(),
            etag: source.etag.clone(),
            last_modified: source.last_modified.clone(),
        };

        debug!(source_id = %source.id, url = %source.url, "fetching feed");

        let response = match self.transport.fetch(&request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(source, &attempt, e).await),
        };

        match response.status {
            304 => self.not_modified(source, &attempt, response).await,
            200..=299 => self.modified(source, &attempt, response).await,
            status => Err(self.fail(source, &attempt, FetchError::HttpStatus { status }).await),
        }
    }

    async fn not_modified(
        &self,
        source: &Source,
        attempt: &Attempt,
        response: TransportResponse,
    ) -> Result<FetchOutcome> {
        let now = Utc::now();
        let updated = self
            .db
            .modify_source(source.id, |s| {
                if response.etag.is_some() {
                    s.etag = response.etag.clone();
                }
                if response.last_modified.is_some() {
                    s.last_modified = response.last_modified.clone();
                }
                self.apply_success(s, IntervalSignal::Unchanged, now);
            })
            .await?;

        let outcome = FetchOutcome {
            status_code: response.status,
            content_changed: false,
            items: ProcessResult::default(),
            interval_minutes: updated.fetch_interval_minutes,
            next_fetch_at: updated.next_fetch_at,
            duration_ms: attempt.elapsed_ms(),
        };
        self.log_success(source, attempt, &outcome).await;

        debug!(source_id = %source.id, "feed not modified");
        Ok(outcome)
    }

    async fn modified(
        &self,
        source: &Source,
        attempt: &Attempt,
        response: TransportResponse,
    ) -> Result<FetchOutcome> {
        let entries = match parse_feed(&response.body) {
            Ok(entries) => entries,
            Err(e) => return Err(self.fail(source, attempt, e).await),
        };

        let signature = content_signature(&entries);
        let content_changed = source.content_signature.as_deref() != Some(signature.as_str());

        let items = match self.items.process(source, &entries).await {
            Ok(items) => items,
            Err(e) => {
                let error = FetchError::Storage(e.to_string());
                self.record_failure(source, attempt, error.kind(), &error.to_string(), Some(response.status))
                    .await;
                return Err(Error::Fetch(error));
            }
        };

        self.events
            .publish(Event::ItemProcessed {
                source_id: source.id,
                created: items.created,
                updated: items.updated,
                failed: items.failed,
            })
            .await;

        let signal = if content_changed {
            IntervalSignal::Changed
        } else {
            IntervalSignal::Unchanged
        };

        let now = Utc::now();
        let updated = self
            .db
            .modify_source(source.id, |s| {
                s.etag = response.etag.clone();
                s.last_modified = response.last_modified.clone();
                s.content_signature = Some(signature.clone());
                self.apply_success(s, signal, now);
            })
            .await?;

        let outcome = FetchOutcome {
            status_code: response.status,
            content_changed,
            items,
            interval_minutes: updated.fetch_interval_minutes,
            next_fetch_at: updated.next_fetch_at,
            duration_ms: attempt.elapsed_ms(),
        };
        self.log_success(source, attempt, &outcome).await;

        info!(
            source_id = %source.id,
            entries = entries.len(),
            created = outcome.items.created,
            updated = outcome.items.updated,
            changed = content_changed,
            interval_minutes = outcome.interval_minutes,
            "feed fetched"
        );
        Ok(outcome)
    }

    /// Reset failure state and schedule the next fetch
    fn apply_success(&self, source: &mut Source, signal: IntervalSignal, now: DateTime<Utc>) {
        source.failure_count = 0;
        source.last_error = None;
        source.last_error_at = None;
        source.last_fetched_at = Some(now);
        source.last_success_at = Some(now);

        if source.adaptive_fetching_enabled {
            source.fetch_interval_minutes =
                next_interval(source.fetch_interval_minutes, signal, &self.config);
            source.next_fetch_at = Some(
                now + jittered_delay(source.fetch_interval_minutes, self.config.jitter_percent),
            );
            source.backoff_until = None;
        } else {
            source.next_fetch_at = Some(source.next_fixed_fetch(now));
        }
    }

    async fn fail(&self, source: &Source, attempt: &Attempt, error: FetchError) -> Error {
        self.record_failure(source, attempt, error.kind(), &error.to_string(), error.status())
            .await;
        Error::Fetch(error)
    }

    /// Persist a failed attempt; bookkeeping errors are logged, never raised
    async fn record_failure(
        &self,
        source: &Source,
        attempt: &Attempt,
        kind: &str,
        message: &str,
        status: Option<u16>,
    ) {
        warn!(source_id = %source.id, kind, error = message, "fetch attempt failed");

        let now = Utc::now();
        let log = NewFetchAttempt {
            source_id: source.id,
            success: false,
            http_status: status,
            duration_ms: attempt.elapsed_ms(),
            started_at: attempt.started_at,
            completed_at: now,
            error_kind: Some(kind.to_string()),
            error_message: Some(message.to_string()),
            items_created: 0,
            items_updated: 0,
            items_failed: 0,
        };
        if let Err(e) = self.db.record_attempt(&log).await {
            warn!(source_id = %source.id, error = %e, "failed to record fetch attempt");
        }

        let result = self
            .db
            .modify_source(source.id, |s| {
                s.failure_count += 1;
                s.last_error = Some(message.to_string());
                s.last_error_at = Some(now);
                s.last_fetched_at = Some(now);

                if s.adaptive_fetching_enabled {
                    s.fetch_interval_minutes =
                        next_interval(s.fetch_interval_minutes, IntervalSignal::Failure, &self.config);
                    let next =
                        now + jittered_delay(s.fetch_interval_minutes, self.config.jitter_percent);
                    s.next_fetch_at = Some(next);
                    s.backoff_until = Some(next);
                } else {
                    s.next_fetch_at = Some(s.next_fixed_fetch(now));
                }
            })
            .await;
        if let Err(e) = result {
            warn!(source_id = %source.id, error = %e, "failed to persist fetch failure");
        }
    }

    async fn log_success(&self, source: &Source, attempt: &Attempt, outcome: &FetchOutcome) {
        let log = NewFetchAttempt {
            source_id: source.id,
            success: true,
            http_status: Some(outcome.status_code),
            duration_ms: outcome.duration_ms,
            started_at: attempt.started_at,
            completed_at: Utc::now(),
            error_kind: None,
            error_message: None,
            items_created: outcome.items.created,
            items_updated: outcome.items.updated,
            items_failed: outcome.items.failed,
        };
        if let Err(e) = self.db.record_attempt(&log).await {
            warn!(source_id = %source.id, error = %e, "failed to record fetch attempt");
        }
    }
}
