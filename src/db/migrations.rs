//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

/// One migration step: a description used in error messages plus its SQL
type Step = (&'static str, &'static str);

const V1_SOURCES: &[Step] = &[
    (
        "sources table",
        r#"
        CREATE TABLE sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            fetch_status INTEGER NOT NULL DEFAULT 0,
            next_fetch_at INTEGER,
            fetch_interval_minutes INTEGER NOT NULL DEFAULT 60,
            adaptive_fetching INTEGER NOT NULL DEFAULT 1,
            etag TEXT,
            last_modified TEXT,
            content_signature TEXT,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_error_at INTEGER,
            retry_attempt INTEGER NOT NULL DEFAULT 0,
            circuit_opened_at INTEGER,
            circuit_until INTEGER,
            backoff_until INTEGER,
            rolling_success_rate REAL,
            health_status INTEGER NOT NULL DEFAULT 0,
            auto_paused_at INTEGER,
            auto_paused_until INTEGER,
            pause_threshold REAL,
            extraction_enabled INTEGER NOT NULL DEFAULT 0,
            last_fetch_started_at INTEGER,
            queued_at INTEGER,
            last_fetched_at INTEGER,
            last_success_at INTEGER,
            task_id TEXT,
            created_at INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "sources due index",
        "CREATE INDEX idx_sources_due ON sources(active, fetch_status, next_fetch_at)",
    ),
    (
        "fetch_attempts table",
        r#"
        CREATE TABLE fetch_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            success INTEGER NOT NULL,
            http_status INTEGER,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            items_created INTEGER NOT NULL DEFAULT 0,
            items_updated INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "fetch_attempts index",
        "CREATE INDEX idx_fetch_attempts_source ON fetch_attempts(source_id, completed_at DESC, id DESC)",
    ),
];

const V2_COORDINATION: &[Step] = &[
    (
        "fetch_locks table",
        r#"
        CREATE TABLE fetch_locks (
            namespace TEXT NOT NULL,
            lock_key TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, lock_key)
        )
        "#,
    ),
    (
        "task_failures table",
        r#"
        CREATE TABLE task_failures (
            task_id TEXT PRIMARY KEY,
            source_id INTEGER NOT NULL,
            error TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        )
        "#,
    ),
];

const V3_ITEMS: &[Step] = &[
    (
        "feed_items table",
        r#"
        CREATE TABLE feed_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            guid TEXT NOT NULL,
            title TEXT NOT NULL,
            link TEXT,
            published_at INTEGER,
            content_hash TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_id, guid)
        )
        "#,
    ),
    (
        "feed_items recency index",
        "CREATE INDEX idx_feed_items_recency ON feed_items(source_id, first_seen_at DESC, id DESC)",
    ),
];

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Foreign keys for cascading deletes, WAL so readers don't block the writer
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Bring the schema up to the latest version
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::apply_migration(&mut conn, 1, V1_SOURCES).await?;
        }
        if current_version < 2 {
            Self::apply_migration(&mut conn, 2, V2_COORDINATION).await?;
        }
        if current_version < 3 {
            Self::apply_migration(&mut conn, 3, V3_ITEMS).await?;
        }

        Ok(())
    }

    /// Run every step of one migration inside a single transaction
    async fn apply_migration(
        conn: &mut SqliteConnection,
        version: i32,
        steps: &[Step],
    ) -> Result<()> {
        tracing::info!(version, "applying database migration");

        // Partial failures must not leave the schema half-applied
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            for (what, sql) in steps {
                sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "Failed to create {}: {}",
                        what, e
                    )))
                })?;
            }
            Self::record_migration(conn, version).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "database migration complete");
        Ok(())
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
