//! Fetch task queue
//!
//! The runner only needs [`TaskQueue`]: submit now, submit later, and forget a
//! failure record. [`LocalTaskQueue`] implements it in-process on an unbounded
//! channel drained by a [`TaskWorkerPool`].

use crate::db::Database;
use crate::runner::FetchRunner;
use crate::types::{SourceId, TaskId};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One unit of work: fetch `source_id` once
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTask {
    /// Identity of this task; retries keep it
    pub id: TaskId,
    /// Source to fetch
    pub source_id: SourceId,
    /// Submitted by a manual retry
    pub force: bool,
}

impl FetchTask {
    /// Task with a fresh id
    pub fn new(source_id: SourceId) -> Self {
        Self {
            id: TaskId::generate(),
            source_id,
            force: false,
        }
    }
}

/// Where fetch tasks are submitted
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Submit a task for immediate execution
    async fn dispatch(&self, task: FetchTask) -> Result<()>;

    /// Submit a task to run once `delay` has passed
    async fn dispatch_after(&self, task: FetchTask, delay: Duration) -> Result<()>;

    /// Forget the failure record of a task; true when one existed
    async fn discard_failure(&self, task_id: &TaskId) -> Result<bool>;
}

/// In-process [`TaskQueue`]
///
/// Failure records live in the `task_failures` table so they outlive the
/// process that ran the task.
pub struct LocalTaskQueue {
    tx: mpsc::UnboundedSender<FetchTask>,
    db: Arc<Database>,
    cancel: CancellationToken,
}

/// Receiving half of a [`LocalTaskQueue`]
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<FetchTask>,
}

impl LocalTaskQueue {
    /// Create the queue and the receiver a worker pool drains
    pub fn new(db: Arc<Database>, cancel: CancellationToken) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, db, cancel }, TaskReceiver { rx })
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn dispatch(&self, task: FetchTask) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.tx.send(task).map_err(|_| Error::ShuttingDown)
    }

    async fn dispatch_after(&self, task: FetchTask, delay: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if tx.send(task).is_err() {
                        debug!("task queue closed before delayed task was due");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
        Ok(())
    }

    async fn discard_failure(&self, task_id: &TaskId) -> Result<bool> {
        self.db.delete_task_failure(task_id).await
    }
}

/// Runs tasks from a [`TaskReceiver`] with bounded concurrency
pub struct TaskWorkerPool {
    runner: Arc<FetchRunner>,
    db: Arc<Database>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl TaskWorkerPool {
    /// At most `concurrency` tasks run at the same time
    pub fn new(
        runner: Arc<FetchRunner>,
        db: Arc<Database>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            db,
            concurrency: concurrency.clamp(1, Semaphore::MAX_PERMITS),
            cancel,
        }
    }

    /// Start draining `receiver` in a background task
    pub fn spawn(self, receiver: TaskReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }

    async fn run(self, mut receiver: TaskReceiver) {
        info!(concurrency = self.concurrency, "fetch workers started");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => break,
                task = receiver.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let runner = self.runner.clone();
            let db = self.db.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::execute(runner, db, task).await;
            });
        }

        // Wait for in-flight tasks to finish
        let all = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        match permits.acquire_many(all).await {
            Ok(_drained) => info!("fetch workers stopped"),
            Err(e) => warn!(error = %e, "fetch workers stopped without draining in-flight tasks"),
        }
    }

    async fn execute(runner: Arc<FetchRunner>, db: Arc<Database>, task: FetchTask) {
        match runner.execute(task.clone()).await {
            Ok(outcome) => {
                debug!(task_id = %task.id, source_id = %task.source_id, ?outcome, "fetch task finished");
            }
            Err(e) => {
                warn!(task_id = %task.id, source_id = %task.source_id, error = %e, "fetch task failed");
                if let Err(record_err) = db
                    .record_task_failure(&task.id, task.source_id, &e.to_string(), Utc::now())
                    .await
                {
                    error!(task_id = %task.id, error = %record_err, "failed to record task failure");
                }
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup() -> (LocalTaskQueue, TaskReceiver, CancellationToken, Arc<Database>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let cancel = CancellationToken::new();
        let (queue, receiver) = LocalTaskQueue::new(db.clone(), cancel.clone());
        (queue, receiver, cancel, db, temp_file)
    }

    #[tokio::test]
    async fn dispatch_delivers_in_order() {
        let (queue, mut receiver, _cancel, _db, _temp) = setup().await;
        let first = FetchTask::new(SourceId(1));
        let second = FetchTask::new(SourceId(2));

        queue.dispatch(first.clone()).await.unwrap();
        queue.dispatch(second.clone()).await.unwrap();

        assert_eq!(receiver.rx.recv().await.unwrap(), first);
        assert_eq!(receiver.rx.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn delayed_dispatch_waits() {
        let (queue, mut receiver, _cancel, _db, _temp) = setup().await;
        let task = FetchTask::new(SourceId(1));

        queue
            .dispatch_after(task.clone(), Duration::from_millis(200))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.rx.try_recv().is_err());

        let delivered = tokio::time::timeout(Duration::from_secs(2), receiver.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, task);
    }

    #[tokio::test]
    async fn cancellation_drops_delayed_tasks() {
        let (queue, mut receiver, cancel, _db, _temp) = setup().await;

        queue
            .dispatch_after(FetchTask::new(SourceId(1)), Duration::from_millis(100))
            .await
            .unwrap();
        cancel.cancel();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(receiver.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_queue_rejects_work() {
        let (queue, _receiver, cancel, _db, _temp) = setup().await;
        cancel.cancel();

        let result = queue.dispatch(FetchTask::new(SourceId(1))).await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn discard_failure_removes_record() {
        let (queue, _receiver, _cancel, db, _temp) = setup().await;
        let source_id = db
            .insert_source(&crate::db::NewSource::new("q", "https://example.com/feed"))
            .await
            .unwrap();
        let task = FetchTask::new(source_id);

        db.record_task_failure(&task.id, source_id, "boom", Utc::now())
            .await
            .unwrap();

        assert!(queue.discard_failure(&task.id).await.unwrap());
        assert!(!queue.discard_failure(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn worker_pool_drains_and_stops_with_oversized_concurrency() {
        use crate::test_helpers::{create_test_harness, ok_response, rss_body};
        use crate::types::FetchStatus;

        let h = create_test_harness().await;
        let id = h.insert_source("pooled").await;
        h.transport.push(ok_response(rss_body(&[("a", "Alpha")])));
        let task = h.enqueue(id).await;

        let cancel = CancellationToken::new();
        let (queue, receiver) = LocalTaskQueue::new(h.db.clone(), cancel.clone());
        let handle = TaskWorkerPool::new(h.runner.clone(), h.db.clone(), usize::MAX, cancel.clone())
            .spawn(receiver);
        queue.dispatch(task).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.db.get_source(id).await.unwrap().unwrap().fetch_status != FetchStatus::Idle {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
