use crate::db::*;
use tempfile::NamedTempFile;

mod items;
mod migrations;
mod tasks;

/// Helper: create a fresh database with migrations applied
async fn setup_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

/// Helper: insert an active adaptive source, returning its ID
async fn insert_test_source(db: &Database, name: &str) -> crate::types::SourceId {
    db.insert_source(&NewSource::new(name, format!("https://{name}.example.com/feed.xml")))
        .await
        .unwrap()
}
