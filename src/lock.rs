//! Distributed keyed lock
//!
//! Guarantees at most one in-flight fetch per source across every worker
//! sharing the database. A lock row carries an expiry that the holder keeps
//! pushing forward from a heartbeat task; a holder that dies stops renewing
//! and the lock frees itself once the TTL runs out.

use crate::db::Database;
use crate::error::ConcurrencyError;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Ownership of one keyed lock
///
/// Dropping the guard without [`KeyedLock::release`] stops the heartbeat, so the
/// lock lapses after its TTL instead of being held forever.
#[must_use = "the lock is released when the guard is dropped or its TTL lapses"]
#[derive(Debug)]
pub struct LockGuard {
    namespace: String,
    key: String,
    holder: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    /// Namespace the lock lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key within the namespace
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque identity of this holder
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// Mutual exclusion keyed by `(namespace, key)`
#[async_trait]
pub trait KeyedLock: Send + Sync {
    /// Take the lock without waiting
    ///
    /// Fails with [`ConcurrencyError::LockHeld`] when another holder owns it.
    async fn try_acquire(&self, namespace: &str, key: &str) -> Result<LockGuard>;

    /// Give the lock back
    async fn release(&self, guard: LockGuard) -> Result<()>;
}

/// [`KeyedLock`] backed by the `fetch_locks` table
pub struct SqliteKeyedLock {
    db: Arc<Database>,
    ttl: Duration,
}

impl SqliteKeyedLock {
    /// Locks expire `ttl` after the last heartbeat
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn spawn_heartbeat(&self, namespace: String, key: String, holder: String) -> JoinHandle<()> {
        let db = self.db.clone();
        let ttl_ms = self.ttl_ms();
        let period = self.ttl / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                match db.renew_lock(&namespace, &key, &holder, now_ms, ttl_ms).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(namespace = %namespace, key = %key, "lock lost before release");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(namespace = %namespace, key = %key, error = %e, "lock heartbeat failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl KeyedLock for SqliteKeyedLock {
    async fn try_acquire(&self, namespace: &str, key: &str) -> Result<LockGuard> {
        let holder = format!("{:016x}", rand::random::<u64>());
        let now_ms = chrono::Utc::now().timestamp_millis();

        if !self
            .db
            .try_acquire_lock(namespace, key, &holder, now_ms, self.ttl_ms())
            .await?
        {
            return Err(ConcurrencyError::LockHeld {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }
            .into());
        }

        tracing::trace!(namespace, key, holder = %holder, "lock acquired");

        let heartbeat = self.spawn_heartbeat(namespace.to_string(), key.to_string(), holder.clone());
        Ok(LockGuard {
            namespace: namespace.to_string(),
            key: key.to_string(),
            holder,
            heartbeat: Some(heartbeat),
        })
    }

    async fn release(&self, mut guard: LockGuard) -> Result<()> {
        if let Some(heartbeat) = guard.heartbeat.take() {
            heartbeat.abort();
        }

        if !self
            .db
            .release_lock(&guard.namespace, &guard.key, &guard.holder)
            .await?
        {
            tracing::debug!(
                namespace = %guard.namespace,
                key = %guard.key,
                "lock already expired at release"
            );
        }

        Ok(())
    }
}
