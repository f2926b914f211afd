//! Shared test helpers: a wired fetch pipeline with scripted collaborators.

use crate::config::Config;
use crate::db::{Database, NewSource};
use crate::error::FetchError;
use crate::events::EventBus;
use crate::extraction::ExtractionDispatcher;
use crate::fetcher::FeedFetcher;
use crate::items::{DbItemStore, ItemRef};
use crate::lock::SqliteKeyedLock;
use crate::queue::{FetchTask, TaskQueue};
use crate::retention::DbRetentionPruner;
use crate::retry::RetryPolicy;
use crate::runner::{FetchRunner, FetchRunnerParams};
use crate::transport::{ConditionalRequest, Transport, TransportResponse};
use crate::types::{SourceId, TaskId};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Configuration with every source of randomness switched off
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.adaptive.jitter_percent = 0.0;
    config.retry.jitter = false;
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_secs(60);
    config.retry.circuit_cooldown = Duration::from_secs(3600);
    config.extraction.max_in_flight_per_source = 2;
    config.retention.max_items_per_source = Some(100);
    config
}

/// RSS 2.0 document with one item per `(guid, title)` pair
pub(crate) fn rss_body(items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><guid>{guid}</guid><title>{title}</title><link>https://example.com/{guid}</link></item>"
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Test</title><link>https://example.com</link><description>Test feed</description>{items}</channel></rss>"#
    )
}

/// 200 response carrying `body` and an ETag
pub(crate) fn ok_response(body: String) -> TransportResponse {
    TransportResponse {
        status: 200,
        etag: Some("\"v1\"".to_string()),
        last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        body,
    }
}

/// Response with only a status
pub(crate) fn status_response(status: u16) -> TransportResponse {
    TransportResponse {
        status,
        ..TransportResponse::default()
    }
}

/// Transport answering from a script, in order
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<std::result::Result<TransportResponse, FetchError>>>,
    requests: Mutex<Vec<ConditionalRequest>>,
    panic_next: AtomicBool,
}

impl ScriptedTransport {
    /// The next fetch panics instead of answering
    pub(crate) fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn push(&self, response: TransportResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn push_err(&self, error: FetchError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn requests(&self) -> Vec<ConditionalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        request: &ConditionalRequest,
    ) -> std::result::Result<TransportResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted transport panic");
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Connection("no scripted response".into())))
    }
}

/// Queue that records submissions instead of running them
#[derive(Default)]
pub(crate) struct RecordingQueue {
    dispatched: Mutex<Vec<FetchTask>>,
    delayed: Mutex<Vec<(FetchTask, Duration)>>,
    discarded: Mutex<Vec<TaskId>>,
    reject: AtomicBool,
}

impl RecordingQueue {
    pub(crate) fn dispatched(&self) -> Vec<FetchTask> {
        self.dispatched.lock().unwrap().clone()
    }

    pub(crate) fn delayed(&self) -> Vec<(FetchTask, Duration)> {
        self.delayed.lock().unwrap().clone()
    }

    pub(crate) fn discarded(&self) -> Vec<TaskId> {
        self.discarded.lock().unwrap().clone()
    }

    /// Make every further submission fail
    pub(crate) fn reject_all(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn dispatch(&self, task: FetchTask) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        self.dispatched.lock().unwrap().push(task);
        Ok(())
    }

    async fn dispatch_after(&self, task: FetchTask, delay: Duration) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        self.delayed.lock().unwrap().push((task, delay));
        Ok(())
    }

    async fn discard_failure(&self, task_id: &TaskId) -> Result<bool> {
        self.discarded.lock().unwrap().push(task_id.clone());
        Ok(true)
    }
}

/// Extraction dispatcher with a settable backlog
#[derive(Default)]
pub(crate) struct RecordingExtraction {
    pub(crate) in_flight: AtomicUsize,
    dispatched: Mutex<Vec<ItemRef>>,
}

impl RecordingExtraction {
    pub(crate) fn dispatched(&self) -> Vec<ItemRef> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionDispatcher for RecordingExtraction {
    async fn in_flight(&self, _source_id: SourceId) -> Result<usize> {
        Ok(self.in_flight.load(Ordering::SeqCst))
    }

    async fn dispatch(&self, _source_id: SourceId, item: &ItemRef) -> Result<()> {
        self.dispatched.lock().unwrap().push(item.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Fetch pipeline on a throwaway database
///
/// The temp file must stay alive as long as the database is used.
pub(crate) struct Harness {
    pub(crate) db: Arc<Database>,
    pub(crate) config: Config,
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) queue: Arc<RecordingQueue>,
    pub(crate) extraction: Arc<RecordingExtraction>,
    pub(crate) lock: Arc<SqliteKeyedLock>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) fetcher: Arc<FeedFetcher>,
    pub(crate) runner: Arc<FetchRunner>,
    _temp_file: NamedTempFile,
}

pub(crate) async fn create_test_harness() -> Harness {
    create_test_harness_with(test_config()).await
}

pub(crate) async fn create_test_harness_with(config: Config) -> Harness {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp_file.path()).await.unwrap());

    let transport = Arc::new(ScriptedTransport::default());
    let queue = Arc::new(RecordingQueue::default());
    let extraction = Arc::new(RecordingExtraction::default());
    let lock = Arc::new(SqliteKeyedLock::new(db.clone(), config.fetch.lock_ttl));
    let events = Arc::new(EventBus::new(64));

    let fetcher = Arc::new(FeedFetcher::new(
        db.clone(),
        transport.clone(),
        Arc::new(DbItemStore::new(db.clone())),
        events.clone(),
        config.adaptive.clone(),
    ));

    let runner = Arc::new(FetchRunner::new(FetchRunnerParams {
        db: db.clone(),
        lock: lock.clone(),
        fetcher: fetcher.clone(),
        policy: RetryPolicy::new(config.retry.clone()),
        queue: queue.clone(),
        retention: Arc::new(DbRetentionPruner::new(
            db.clone(),
            config.retention.max_items_per_source,
        )),
        extraction: extraction.clone(),
        events: events.clone(),
        lock_namespace: config.fetch.lock_namespace.clone(),
        lock_retry_delay: config.scheduler.lock_retry_delay,
        max_extraction_in_flight: config.extraction.max_in_flight_per_source,
    }));

    Harness {
        db,
        config,
        transport,
        queue,
        extraction,
        lock,
        events,
        fetcher,
        runner,
        _temp_file: temp_file,
    }
}

impl Harness {
    /// Insert an active adaptive source
    pub(crate) async fn insert_source(&self, name: &str) -> SourceId {
        self.db
            .insert_source(&NewSource::new(name, format!("https://{name}.example.com/feed.xml")))
            .await
            .unwrap()
    }

    /// Submit a task through the runner and return it as the queue saw it
    pub(crate) async fn enqueue(&self, source_id: SourceId) -> FetchTask {
        assert!(self.runner.enqueue(source_id, false).await.unwrap());
        self.queue
            .dispatched()
            .into_iter()
            .rev()
            .find(|task| task.source_id == source_id)
            .unwrap()
    }
}
