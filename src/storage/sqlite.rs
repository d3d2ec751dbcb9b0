// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed snapshot storage.
//!
//! # Write-Behind Cache
//!
//! The replication pipeline is synchronous, so [`Persistence`] calls never
//! touch the database directly:
//! - `open()` loads every row into an in-memory cache (read-once-at-startup)
//! - `write()`/`delete()` update the cache immediately and mark the key dirty
//! - `flush_dirty()` persists all dirty keys to disk in one pass
//! - the node runtime calls `flush_dirty()` periodically and on shutdown
//!
//! A crash between a write and the next flush loses at most one flush
//! interval of local changes. Peers still hold those writes and re-send them
//! in the dump that follows the next link open.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (up to
//! 5 attempts). A key that still fails stays dirty for the next flush.

use super::Persistence;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_storage_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Inner {
    pool: SqlitePool,
    cache: Mutex<HashMap<String, String>>,
    /// Keys changed since the last flush (present in cache = upsert, absent = delete).
    dirty: Mutex<HashSet<String>>,
    path: String,
}

/// Persistent key/value storage backed by SQLite.
///
/// Cheap to clone; clones share the cache and the pool, so the engine can own
/// one handle while a background task flushes through another.
#[derive(Clone)]
pub struct SqliteStorage {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and load all rows.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening snapshot storage");

        let journal_mode = if wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM kv")
            .fetch_all(&pool)
            .await?;

        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored snapshot entries from previous run");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                cache: Mutex::new(cache),
                dirty: Mutex::new(HashSet::new()),
                path: path_str,
            }),
        })
    }

    /// Flush all dirty keys to disk.
    ///
    /// Returns the number of keys written or deleted.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let pending: Vec<(String, Option<String>)> = {
            let mut dirty = lock(&self.inner.dirty);
            let cache = lock(&self.inner.cache);
            dirty
                .drain()
                .map(|key| {
                    let value = cache.get(&key).cloned();
                    (key, value)
                })
                .collect()
        };

        if pending.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.inner.pool;
        let mut flushed = 0;
        let mut errors = 0;
        let mut last_error = None;

        for (key, value) in pending {
            let result = match &value {
                Some(value) => {
                    execute_with_retry("snapshot_upsert", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO kv (key, value, updated_at)
                            VALUES (?, ?, ?)
                            ON CONFLICT(key) DO UPDATE SET
                                value = excluded.value,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(&key)
                        .bind(value)
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await
                }
                None => {
                    execute_with_retry("snapshot_delete", || async {
                        sqlx::query("DELETE FROM kv WHERE key = ?")
                            .bind(&key)
                            .execute(pool)
                            .await
                    })
                    .await
                }
            };

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(key = %key, error = %e, "Failed to flush snapshot entry");
                    lock(&self.inner.dirty).insert(key);
                    last_error = Some(e);
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty snapshot entries");
        }
        metrics::record_storage_flush(flushed, errors);

        match last_error {
            Some(e) => Err(ReplicationError::Storage(e)),
            None => Ok(flushed),
        }
    }

    /// Number of keys waiting for a flush.
    pub fn dirty_count(&self) -> usize {
        lock(&self.inner.dirty).len()
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty_count() > 0
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.inner.pool;
        execute_with_retry("snapshot_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush pending entries, checkpoint, and close the pool.
    pub async fn close(&self) {
        if self.has_dirty() {
            match self.flush_dirty().await {
                Ok(count) => info!(count, "Flushed dirty snapshot entries on close"),
                Err(e) => warn!(error = %e, "Failed to flush snapshot entries on close"),
            }
        }
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.inner.pool.close().await;
        info!(path = %self.inner.path, "Snapshot storage closed");
    }

    /// Spawn a task that flushes dirty entries every `interval`.
    ///
    /// The task performs a final flush and closes the storage when
    /// `shutdown_rx` turns `true`.
    pub fn spawn_flush_task(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match storage.flush_dirty().await {
                            Ok(_) => {}
                            Err(e) if e.is_retryable() => {
                                warn!(error = %e, pending = storage.dirty_count(), "Snapshot flush failed, retrying next tick");
                            }
                            Err(e) => error!(error = %e, "Snapshot flush failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Snapshot flush task stopping");
                            break;
                        }
                    }
                }
            }
            storage.close().await;
        })
    }
}

impl Persistence for SqliteStorage {
    fn read(&self, key: &str) -> Option<String> {
        lock(&self.inner.cache).get(key).cloned()
    }

    fn write(&mut self, key: &str, value: String) {
        lock(&self.inner.cache).insert(key.to_string(), value);
        lock(&self.inner.dirty).insert(key.to_string());
    }

    fn delete(&mut self, key: &str) {
        if lock(&self.inner.cache).remove(key).is_some() {
            lock(&self.inner.dirty).insert(key.to_string());
        }
    }
}
