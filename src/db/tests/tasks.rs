use super::{insert_test_source, setup_db};
use crate::types::TaskId;
use chrono::Utc;

#[tokio::test]
async fn test_task_failure_record_lifecycle() {
    let (db, _temp) = setup_db().await;
    let source_id = insert_test_source(&db, "tasks").await;
    let task = TaskId("deadbeef".into());

    db.record_task_failure(&task, source_id, "first", Utc::now())
        .await
        .unwrap();
    db.record_task_failure(&task, source_id, "second", Utc::now())
        .await
        .unwrap();

    let row = db.get_task_failure(&task).await.unwrap().unwrap();
    assert_eq!(row.error, "second");
    assert_eq!(row.source_id, source_id.get());

    assert!(db.delete_task_failure(&task).await.unwrap());
    assert!(!db.delete_task_failure(&task).await.unwrap());
    assert!(db.get_task_failure(&task).await.unwrap().is_none());
}

#[tokio::test]
async fn test_source_keeps_only_latest_failure() {
    let (db, _temp) = setup_db().await;
    let flaky = insert_test_source(&db, "flaky").await;
    let other = insert_test_source(&db, "other").await;
    let other_task = TaskId("other".into());
    db.record_task_failure(&other_task, other, "elsewhere", Utc::now())
        .await
        .unwrap();

    let tasks: Vec<TaskId> = (0..3).map(|i| TaskId(format!("task-{i}"))).collect();
    for task in &tasks {
        db.record_task_failure(task, flaky, "gave up", Utc::now())
            .await
            .unwrap();
    }

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_failures WHERE source_id = ?")
        .bind(flaky)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(db.get_task_failure(&tasks[0]).await.unwrap().is_none());
    assert!(db.get_task_failure(&tasks[2]).await.unwrap().is_some());
    assert!(db.get_task_failure(&other_task).await.unwrap().is_some());
}
