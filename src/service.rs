//! Service wiring
//!
//! [`FeedService`] owns one instance of every component, connected the way a
//! deployment runs them: the scheduler ticks in the background, tasks flow
//! through an in-process queue into a worker pool, and the health monitor
//! listens on the event bus.

use crate::config::{AdaptiveConfig, Config};
use crate::db::{Database, NewSource};
use crate::events::{EventBus, EventBusBuilder, EventHandler};
use crate::extraction::{ExtractionDispatcher, NoOpExtractionDispatcher};
use crate::fetcher::FeedFetcher;
use crate::health::{HealthChange, HealthMonitor};
use crate::items::{DbItemStore, ItemStore};
use crate::lock::SqliteKeyedLock;
use crate::queue::{LocalTaskQueue, TaskReceiver, TaskWorkerPool};
use crate::reconciler::{ReconcileReport, StalledTaskReconciler};
use crate::retention::{DbRetentionPruner, RetentionPruner};
use crate::retry::RetryPolicy;
use crate::runner::{FetchRunner, FetchRunnerParams};
use crate::scheduler::{Scheduler, SchedulerTask};
use crate::source::Source;
use crate::transport::{HttpTransport, Transport};
use crate::types::{Event, SourceId};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Events buffered per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 1000;

/// How long shutdown waits for background tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a [`FeedService`], optionally replacing the built-in collaborators
pub struct FeedServiceBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    items: Option<Arc<dyn ItemStore>>,
    retention: Option<Arc<dyn RetentionPruner>>,
    extraction: Option<Arc<dyn ExtractionDispatcher>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl FeedServiceBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            items: None,
            retention: None,
            extraction: None,
            handlers: Vec::new(),
        }
    }

    /// Replace the HTTP transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the item store
    pub fn item_store(mut self, items: Arc<dyn ItemStore>) -> Self {
        self.items = Some(items);
        self
    }

    /// Replace the retention policy
    pub fn retention(mut self, retention: Arc<dyn RetentionPruner>) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Send created items to an extraction backend
    pub fn extraction(mut self, extraction: Arc<dyn ExtractionDispatcher>) -> Self {
        self.extraction = Some(extraction);
        self
    }

    /// Register an additional event handler, run after the health monitor
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validate the configuration, open the database and wire every component
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the database cannot be
    /// opened or migrated, or the HTTP client cannot be created.
    pub async fn build(self) -> Result<FeedService> {
        let config = self.config;
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let cancel = CancellationToken::new();

        let mut bus = EventBusBuilder::new(EVENT_CAPACITY);
        let health = Arc::new(HealthMonitor::new(
            db.clone(),
            config.health.clone(),
            bus.sender(),
        ));
        bus = bus.register(health.clone());
        for handler in self.handlers {
            bus = bus.register(handler);
        }
        let events = Arc::new(bus.build());

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config.fetch)?),
        };
        let items = self
            .items
            .unwrap_or_else(|| Arc::new(DbItemStore::new(db.clone())));
        let retention = self.retention.unwrap_or_else(|| {
            Arc::new(DbRetentionPruner::new(
                db.clone(),
                config.retention.max_items_per_source,
            ))
        });
        let extraction = self
            .extraction
            .unwrap_or_else(|| Arc::new(NoOpExtractionDispatcher));

        let fetcher = Arc::new(FeedFetcher::new(
            db.clone(),
            transport,
            items,
            events.clone(),
            config.adaptive.clone(),
        ));

        let (queue, receiver) = LocalTaskQueue::new(db.clone(), cancel.clone());
        let queue = Arc::new(queue);

        let runner = Arc::new(FetchRunner::new(FetchRunnerParams {
            db: db.clone(),
            lock: Arc::new(SqliteKeyedLock::new(db.clone(), config.fetch.lock_ttl)),
            fetcher,
            policy: RetryPolicy::new(config.retry.clone()),
            queue: queue.clone(),
            retention,
            extraction,
            events: events.clone(),
            lock_namespace: config.fetch.lock_namespace.clone(),
            lock_retry_delay: config.scheduler.lock_retry_delay,
            max_extraction_in_flight: config.extraction.max_in_flight_per_source,
        }));

        let reconciler = Arc::new(StalledTaskReconciler::new(
            db.clone(),
            queue,
            events.clone(),
            config.scheduler.stale_queued_after,
            config.scheduler.stale_fetching_after,
        ));

        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            runner.clone(),
            reconciler.clone(),
            &config.scheduler,
        ));

        tracing::info!(
            database = %config.persistence.database_path.display(),
            workers = config.scheduler.worker_concurrency,
            "feed service ready"
        );

        Ok(FeedService {
            db,
            config,
            events,
            health,
            runner,
            reconciler,
            scheduler,
            cancel,
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Every component of the fetch pipeline, wired together
pub struct FeedService {
    db: Arc<Database>,
    config: Config,
    events: Arc<EventBus>,
    health: Arc<HealthMonitor>,
    runner: Arc<FetchRunner>,
    reconciler: Arc<StalledTaskReconciler>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    receiver: Mutex<Option<TaskReceiver>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedService {
    /// [`FeedServiceBuilder`] with the built-in collaborators
    pub async fn new(config: Config) -> Result<Self> {
        FeedServiceBuilder::new(config).build().await
    }

    /// Start the worker pool and the scheduler loop
    ///
    /// # Errors
    ///
    /// Fails if the service was already started.
    pub async fn start(&self) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("feed service already started".into()))?;

        let workers = TaskWorkerPool::new(
            self.runner.clone(),
            self.db.clone(),
            self.config.scheduler.worker_concurrency,
            self.cancel.clone(),
        )
        .spawn(receiver);

        let ticker = tokio::spawn(
            SchedulerTask::new(
                self.scheduler.clone(),
                self.config.scheduler.tick_interval,
                self.config.scheduler.batch_limit,
                self.cancel.clone(),
            )
            .run(),
        );

        self.tasks.lock().await.extend([workers, ticker]);
        tracing::info!("feed service started");
        Ok(())
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Shared database handle
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a new source
    ///
    /// Adaptive sources start with their interval clamped to the configured
    /// bounds.
    ///
    /// # Errors
    ///
    /// Rejects URLs that are not absolute `http` or `https` URLs and
    /// intervals below one minute.
    pub async fn add_source(&self, source: &NewSource) -> Result<SourceId> {
        let source = prepare_source(source, &self.config.adaptive)?;
        let id = self.db.insert_source(&source).await?;
        tracing::info!(source_id = %id, url = %source.url, "source added");
        Ok(id)
    }

    /// Current state of a source
    pub async fn source(&self, id: SourceId) -> Result<Option<Source>> {
        self.db.get_source(id).await
    }

    /// Activate or deactivate a source; in-flight fetches finish normally
    pub async fn set_active(&self, id: SourceId, active: bool) -> Result<Source> {
        self.db.set_source_active(id, active).await
    }

    /// Submit a fetch now; see [`FetchRunner::enqueue`]
    pub async fn enqueue(&self, id: SourceId, force: bool) -> Result<bool> {
        self.runner.enqueue(id, force).await
    }

    /// Lift an auto-pause and mark the source healthy
    pub async fn reset_health(&self, id: SourceId) -> Result<HealthChange> {
        self.health.reset_health(id).await
    }

    /// Run one scheduler tick outside the background loop
    pub async fn tick(&self) -> Result<usize> {
        self.scheduler.run(self.config.scheduler.batch_limit).await
    }

    /// Run stalled-task recovery outside a scheduler tick
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile().await
    }

    /// Stop the background tasks and wait for in-flight fetches
    ///
    /// Tasks still waiting in the queue are dropped; their sources stay queued
    /// and are recovered by the reconciler after the next start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks)).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "background task ended abnormally");
                    }
                }
                tracing::info!("graceful shutdown complete");
            }
            Err(_) => {
                tracing::warn!("timeout waiting for background tasks, proceeding with shutdown");
            }
        }
        Ok(())
    }
}

fn prepare_source(source: &NewSource, adaptive: &AdaptiveConfig) -> Result<NewSource> {
    validate_source_url(&source.url)?;
    if source.fetch_interval_minutes < 1 {
        return Err(Error::InvalidInterval(source.fetch_interval_minutes));
    }

    let mut source = source.clone();
    if source.adaptive_fetching_enabled {
        source.fetch_interval_minutes = source
            .fetch_interval_minutes
            .clamp(adaptive.min_interval_minutes, adaptive.max_interval_minutes);
    }
    Ok(source)
}

fn validate_source_url(raw: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}
