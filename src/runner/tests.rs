use super::*;
use crate::error::FetchError;
use crate::lock::KeyedLock;
use crate::test_helpers::{
    Harness, create_test_harness, create_test_harness_with, ok_response, rss_body,
    status_response, test_config,
};
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;

async fn load(h: &Harness, id: SourceId) -> Source {
    h.db.get_source(id).await.unwrap().unwrap()
}

/// Next `FetchCompleted` on the broadcast channel, skipping other events
async fn next_completion(rx: &mut broadcast::Receiver<Event>) -> (SourceId, FetchResult) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("completion event")
            .unwrap();
        if let Event::FetchCompleted { source_id, result } = event {
            return (source_id, result);
        }
    }
}

#[tokio::test]
async fn successful_run_returns_source_to_idle() {
    let h = create_test_harness().await;
    let id = h.insert_source("ok").await;
    let task = h.enqueue(id).await;
    h.transport.push(ok_response(rss_body(&[("a", "Alpha"), ("b", "Beta")])));
    let mut events = h.events.subscribe();

    let outcome = h.runner.execute(task).await.unwrap();

    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert!(result.success);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.created, 2);
    assert!(result.content_changed);

    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Idle);
    assert!(stored.task_id.is_none());
    assert!(stored.queued_at.is_none());
    assert!(stored.last_fetch_started_at.is_some());
    assert_eq!(stored.retry_attempt, 0);

    let (source_id, published) = next_completion(&mut events).await;
    assert_eq!(source_id, id);
    assert!(published.success);

    let now_ms = Utc::now().timestamp_millis();
    let holder = h
        .db
        .lock_holder(&h.config.fetch.lock_namespace, &id.to_string(), now_ms)
        .await
        .unwrap();
    assert!(holder.is_none(), "lock must be released after the run");
}

#[tokio::test]
async fn held_lock_defers_task() {
    let h = create_test_harness().await;
    let id = h.insert_source("busy").await;
    let task = h.enqueue(id).await;
    let guard = h
        .lock
        .try_acquire(&h.config.fetch.lock_namespace, &id.to_string())
        .await
        .unwrap();

    let outcome = h.runner.execute(task.clone()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Deferred);
    assert_eq!(
        h.queue.delayed(),
        vec![(task, h.config.scheduler.lock_retry_delay)]
    );
    assert!(h.transport.requests().is_empty());
    assert_eq!(load(&h, id).await.fetch_status, FetchStatus::Queued);

    h.lock.release(guard).await.unwrap();
}

#[tokio::test]
async fn run_surfaces_lock_contention() {
    let h = create_test_harness().await;
    let id = h.insert_source("contended").await;
    let task = h.enqueue(id).await;
    let _guard = h
        .lock
        .try_acquire(&h.config.fetch.lock_namespace, &id.to_string())
        .await
        .unwrap();

    let err = h.runner.run(&task).await.unwrap_err();

    assert!(err.is_concurrency());
}

#[tokio::test]
async fn transient_failure_schedules_retry_with_same_task() {
    let h = create_test_harness().await;
    let id = h.insert_source("transient").await;
    let task = h.enqueue(id).await;
    h.transport.push(status_response(503));
    let mut events = h.events.subscribe();

    let before = Utc::now();
    let outcome = h.runner.execute(task.clone()).await.unwrap();

    let RunOutcome::RetryScheduled { attempt, retry_at } = outcome else {
        panic!("expected retry, got {outcome:?}");
    };
    assert_eq!(attempt, 1);
    assert!(retry_at >= before + chrono::Duration::seconds(60));

    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Queued);
    assert_eq!(stored.retry_attempt, 1);
    assert_eq!(stored.task_id, Some(task.id.clone()));
    assert_eq!(stored.queued_at, stored.next_fetch_at);
    assert_eq!(stored.next_fetch_at.unwrap().timestamp(), retry_at.timestamp());

    assert_eq!(h.queue.delayed(), vec![(task, Duration::from_secs(60))]);

    let (_, result) = next_completion(&mut events).await;
    assert!(!result.success);
    assert_eq!(result.status_code, Some(503));
    assert_eq!(result.error_kind.as_deref(), Some("http_status"));
    assert_eq!(result.next_fetch_at, Some(retry_at));
}

#[tokio::test]
async fn exhausted_retries_open_circuit() {
    let h = create_test_harness().await;
    let id = h.insert_source("down").await;
    let task = h.enqueue(id).await;
    for _ in 0..3 {
        h.transport.push(status_response(503));
    }

    let first = h.runner.execute(task.clone()).await.unwrap();
    assert!(matches!(first, RunOutcome::RetryScheduled { attempt: 1, .. }));
    let second = h.runner.execute(task.clone()).await.unwrap();
    assert!(matches!(second, RunOutcome::RetryScheduled { attempt: 2, .. }));

    let now = Utc::now();
    let err = h.runner.execute(task).await.unwrap_err();
    assert_eq!(err.as_fetch(), Some(&FetchError::HttpStatus { status: 503 }));

    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Failed);
    assert_eq!(stored.retry_attempt, 0);
    assert!(stored.task_id.is_none());
    assert!(stored.circuit_opened_at.is_some());
    let until = stored.circuit_until.unwrap();
    assert!(until > now + chrono::Duration::minutes(59));
    assert_eq!(stored.next_fetch_at, Some(until));
    assert!(!stored.is_schedulable(Utc::now()));
    assert_eq!(h.queue.delayed().len(), 2);
}

#[tokio::test]
async fn permanent_failure_gives_up_immediately() {
    let h = create_test_harness().await;
    let id = h.insert_source("gone").await;
    let task = h.enqueue(id).await;
    h.transport.push(status_response(404));
    let mut events = h.events.subscribe();

    let err = h.runner.execute(task).await.unwrap_err();

    assert_eq!(err.as_fetch(), Some(&FetchError::HttpStatus { status: 404 }));
    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Failed);
    assert!(stored.circuit_until.is_none());
    assert!(stored.task_id.is_none());
    assert!(h.queue.delayed().is_empty());

    let (_, result) = next_completion(&mut events).await;
    assert_eq!(result.status_code, Some(404));
}

#[tokio::test]
async fn superseded_task_is_dropped() {
    let h = create_test_harness().await;
    let id = h.insert_source("superseded").await;
    let stale = h.enqueue(id).await;
    h.db.modify_source(id, |s| s.task_id = Some(TaskId::generate()))
        .await
        .unwrap();

    let outcome = h.runner.execute(stale).await.unwrap();

    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(h.transport.requests().is_empty());
    assert_eq!(load(&h, id).await.fetch_status, FetchStatus::Queued);
}

#[tokio::test]
async fn deactivated_source_is_released() {
    let h = create_test_harness().await;
    let id = h.insert_source("retired").await;
    let task = h.enqueue(id).await;
    h.db.set_source_active(id, false).await.unwrap();

    let outcome = h.runner.execute(task).await.unwrap();

    assert_eq!(outcome, RunOutcome::Skipped);
    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Idle);
    assert!(stored.task_id.is_none());
    assert!(h.transport.requests().is_empty());
}

#[tokio::test]
async fn extraction_respects_in_flight_budget() {
    let h = create_test_harness().await;
    let id = h.insert_source("extract").await;
    h.db.modify_source(id, |s| s.extraction_enabled = true)
        .await
        .unwrap();
    h.extraction.in_flight.store(1, Ordering::SeqCst);
    let task = h.enqueue(id).await;
    h.transport
        .push(ok_response(rss_body(&[("a", "A"), ("b", "B"), ("c", "C")])));

    h.runner.execute(task).await.unwrap();

    // Budget of 2 with one already running
    assert_eq!(h.extraction.dispatched().len(), 1);
}

#[tokio::test]
async fn extraction_only_for_new_items() {
    let h = create_test_harness().await;
    let id = h.insert_source("repeat").await;
    h.db.modify_source(id, |s| s.extraction_enabled = true)
        .await
        .unwrap();
    let body = rss_body(&[("a", "A")]);

    h.transport.push(ok_response(body.clone()));
    let task = h.enqueue(id).await;
    h.runner.execute(task).await.unwrap();

    h.transport.push(ok_response(body));
    assert!(h.runner.enqueue(id, true).await.unwrap());
    let task = h.queue.dispatched().last().cloned().unwrap();
    h.runner.execute(task).await.unwrap();

    assert_eq!(h.extraction.dispatched().len(), 1);
}

#[tokio::test]
async fn extraction_disabled_dispatches_nothing() {
    let h = create_test_harness().await;
    let id = h.insert_source("plain").await;
    let task = h.enqueue(id).await;
    h.transport.push(ok_response(rss_body(&[("a", "A")])));

    h.runner.execute(task).await.unwrap();

    assert!(h.extraction.dispatched().is_empty());
}

#[tokio::test]
async fn retention_prunes_after_success() {
    let mut config = test_config();
    config.retention.max_items_per_source = Some(1);
    let h = create_test_harness_with(config).await;
    let id = h.insert_source("retained").await;
    let task = h.enqueue(id).await;
    h.transport
        .push(ok_response(rss_body(&[("a", "A"), ("b", "B"), ("c", "C")])));

    h.runner.execute(task).await.unwrap();

    assert_eq!(h.db.count_items(id).await.unwrap(), 1);
}

#[tokio::test]
async fn panicking_attempt_still_publishes_completion() {
    let h = create_test_harness().await;
    let id = h.insert_source("panics").await;
    let task = h.enqueue(id).await;
    h.transport.panic_next();
    let mut events = h.events.subscribe();

    let runner = h.runner.clone();
    let joined = tokio::spawn(async move { runner.execute(task).await }).await;
    assert!(joined.unwrap_err().is_panic());

    let (source_id, result) = next_completion(&mut events).await;
    assert_eq!(source_id, id);
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("aborted"));
}

#[tokio::test]
async fn enqueue_skips_sources_not_due() {
    let h = create_test_harness().await;
    let id = h.insert_source("later").await;
    h.db.modify_source(id, |s| {
        s.next_fetch_at = Some(Utc::now() + chrono::Duration::hours(1));
    })
    .await
    .unwrap();

    assert!(!h.runner.enqueue(id, false).await.unwrap());
    assert!(h.queue.dispatched().is_empty());
    assert_eq!(load(&h, id).await.fetch_status, FetchStatus::Idle);
}

#[tokio::test]
async fn enqueue_does_not_double_submit() {
    let h = create_test_harness().await;
    let id = h.insert_source("once").await;

    assert!(h.runner.enqueue(id, false).await.unwrap());
    assert!(!h.runner.enqueue(id, false).await.unwrap());
    assert_eq!(h.queue.dispatched().len(), 1);
}

#[tokio::test]
async fn forced_enqueue_clears_circuit() {
    let h = create_test_harness().await;
    let id = h.insert_source("forced").await;
    h.db.modify_source(id, |s| {
        s.fetch_status = FetchStatus::Failed;
        s.retry_attempt = 2;
        s.circuit_opened_at = Some(Utc::now());
        s.circuit_until = Some(Utc::now() + chrono::Duration::hours(1));
    })
    .await
    .unwrap();

    assert!(!h.runner.enqueue(id, false).await.unwrap());
    assert!(h.runner.enqueue(id, true).await.unwrap());

    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Queued);
    assert_eq!(stored.retry_attempt, 0);
    assert!(stored.circuit_until.is_none());
    assert!(stored.next_fetch_at.unwrap() <= Utc::now());

    let task = h.queue.dispatched().pop().unwrap();
    assert!(task.force);
    assert_eq!(stored.task_id, Some(task.id));
}

#[tokio::test]
async fn failed_submission_reverts_queued_mark() {
    let h = create_test_harness().await;
    let id = h.insert_source("rejected").await;
    h.queue.reject_all();

    let result = h.runner.enqueue(id, false).await;

    assert!(matches!(result, Err(Error::ShuttingDown)));
    let stored = load(&h, id).await;
    assert_eq!(stored.fetch_status, FetchStatus::Idle);
    assert!(stored.task_id.is_none());
}

#[tokio::test]
async fn stale_snapshot_loses_candidate_claim() {
    let h = create_test_harness().await;
    let id = h.insert_source("raced").await;
    let snapshot = load(&h, id).await;
    h.db.modify_source(id, |s| s.name = "renamed".into())
        .await
        .unwrap();

    let claimed = h.runner.enqueue_candidate(&snapshot, Utc::now()).await.unwrap();

    assert!(!claimed);
    assert!(h.queue.dispatched().is_empty());
}
