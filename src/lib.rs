//! # feedpulse
//!
//! Adaptive scheduling and resilience core for periodic feed fetching.
//!
//! Every registered source is polled on its own interval. The interval
//! stretches while a feed is quiet and shrinks when it publishes, failing
//! sources back off and eventually trip a circuit breaker, and sources whose
//! recent success rate collapses are paused automatically until they recover.
//!
//! ## Quick Start
//!
//! ```no_run
//! use feedpulse::{Config, FeedService, NewSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = FeedService::new(Config::default()).await?;
//!     service
//!         .add_source(&NewSource::new("example", "https://example.com/feed.xml"))
//!         .await?;
//!
//!     let mut events = service.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     service.start().await?;
//!     feedpulse::run_with_shutdown(service).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Event bus and handlers
pub mod events;
/// Follow-up extraction dispatch
pub mod extraction;
/// RSS and Atom parsing
pub mod feed;
/// Single-source fetch pipeline
pub mod fetcher;
/// Success-rate tracking and auto-pause
pub mod health;
/// Item persistence
pub mod items;
/// Per-source mutual exclusion
pub mod lock;
/// Task queue and worker pool
pub mod queue;
/// Recovery of stalled tasks
pub mod reconciler;
/// Item retention
pub mod retention;
/// Retry logic with exponential backoff
pub mod retry;
/// Task execution around a fetch
pub mod runner;
/// Due-source selection
pub mod scheduler;
/// Component wiring
pub mod service;
/// Source domain model
pub mod source;
/// HTTP transport
pub mod transport;
/// Core types and events
pub mod types;

#[cfg(test)]
mod test_helpers;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, NewSource};
pub use error::{ConcurrencyError, DatabaseError, Error, FetchError, PolicyError, Result};
pub use events::{EventBus, EventHandler};
pub use health::{HealthChange, HealthMonitor};
pub use runner::RunOutcome;
pub use service::{FeedService, FeedServiceBuilder};
pub use source::Source;
pub use types::{Event, FetchResult, FetchStatus, HealthStatus, SourceId, TaskId};

/// Run a started service until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use feedpulse::{Config, FeedService, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = FeedService::new(Config::default()).await?;
///     service.start().await?;
///     run_with_shutdown(service).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(service: FeedService) -> Result<()> {
    wait_for_signal().await;
    service.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments
    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT, shutting down");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, shutting down");
        }
        (Err(term), Err(int)) => {
            tracing::error!(
                sigterm_error = %term,
                sigint_error = %int,
                "could not register any signal handlers, using ctrl_c fallback"
            );
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
