use super::setup_db;
use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let (db, _temp) = setup_db().await;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();

    for table in [
        "sources",
        "fetch_attempts",
        "fetch_locks",
        "task_failures",
        "feed_items",
        "schema_version",
    ] {
        assert!(tables.contains(&table.to_string()), "missing table {table}");
    }

    db.close().await;
}

#[tokio::test]
async fn test_reopening_does_not_reapply_migrations() {
    let temp_file = NamedTempFile::new().unwrap();

    let db = Database::new(temp_file.path()).await.unwrap();
    db.close().await;

    let db = Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version")
        .fetch_all(db.pool())
        .await
        .unwrap();

    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_query_after_pool_close_returns_error() {
    let (db, _temp) = setup_db().await;
    let id = super::insert_test_source(&db, "closing").await;

    db.pool().close().await;

    let result = db.get_source(id).await;
    assert!(
        result.is_err(),
        "get_source after pool close should return an error, got: {:?}",
        result
    );
}
