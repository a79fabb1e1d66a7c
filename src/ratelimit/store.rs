//! Backing stores for the distributed counter.
//!
//! A store owns one counter per key plus a set of holder keys with an expiry.
//! Both mutating operations are single atomic steps inside the store, so two
//! callers racing for the last slot can never both win and a duplicate release
//! can never drive a counter below zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;

/// Errors raised by a shared store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store cannot be reached at all. The limiter degrades to local mode.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store is reachable but could not serve this attempt.
    #[error("store busy: {0}")]
    Busy(String),

    /// Any other SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the limiter should stop using the store for the rest of the run.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Operation set the rate limiter needs from a shared key-value store.
pub trait SharedStore: Send + Sync {
    /// Current counter value for `key`.
    fn count(&self, key: &str) -> StoreResult<u32>;

    /// Atomically increment `key` if it is below `limit`, registering `holder` with `ttl`.
    ///
    /// Returns `false` when no slot is free.
    fn try_acquire(&self, key: &str, holder: &str, limit: u32, ttl: Duration) -> StoreResult<bool>;

    /// Atomically decrement `key` if `holder` is still registered.
    ///
    /// Returns `false` for unknown or expired holders; the counter is left alone.
    fn release(&self, key: &str, holder: &str) -> StoreResult<bool>;
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct MemoryCounter {
    value: u32,
    holders: HashMap<String, i64>,
}

impl MemoryCounter {
    fn purge_expired(&mut self, now: i64) {
        self.holders.retain(|_, expires_at| *expires_at > now);
        self.value = self.value.min(self.holders.len() as u32);
    }
}

/// In-process store with the same semantics as the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, MemoryCounter>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counter<T>(&self, key: &str, f: impl FnOnce(&mut MemoryCounter) -> T) -> StoreResult<T> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        let counter = counters.entry(key.to_string()).or_default();
        Ok(f(counter))
    }
}

impl SharedStore for MemoryStore {
    fn count(&self, key: &str) -> StoreResult<u32> {
        self.with_counter(key, |counter| {
            counter.purge_expired(now_ms());
            counter.value
        })
    }

    fn try_acquire(&self, key: &str, holder: &str, limit: u32, ttl: Duration) -> StoreResult<bool> {
        self.with_counter(key, |counter| {
            let now = now_ms();
            counter.purge_expired(now);
            if counter.value >= limit {
                return false;
            }
            counter.value += 1;
            counter
                .holders
                .insert(holder.to_string(), now + ttl.as_millis() as i64);
            true
        })
    }

    fn release(&self, key: &str, holder: &str) -> StoreResult<bool> {
        self.with_counter(key, |counter| {
            if counter.holders.remove(holder).is_none() {
                return false;
            }
            counter.value = counter.value.saturating_sub(1);
            true
        })
    }
}

/// SQLite-backed store shared by independent processes through one database file.
///
/// Every check-and-set runs in an `IMMEDIATE` transaction, which takes the
/// database write lock up front so concurrent processes serialize on it.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(&path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS limiter_counters (
              key TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS limiter_holders (
              key TEXT NOT NULL,
              holder TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL,
              PRIMARY KEY (key, holder)
            );
            "#,
        )
        .map_err(classify)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Database file backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
        f(&mut conn).map_err(classify)
    }
}

/// Purge expired holders and clamp the counter to the live holder count.
fn reconcile_tx(tx: &rusqlite::Transaction<'_>, key: &str, now: i64) -> rusqlite::Result<u32> {
    tx.execute(
        "DELETE FROM limiter_holders WHERE key = ?1 AND expires_at_ms <= ?2",
        params![key, now],
    )?;
    let live: i64 = tx.query_row(
        "SELECT COUNT(*) FROM limiter_holders WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    let stored: Option<i64> = tx
        .query_row(
            "SELECT value FROM limiter_counters WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    let value = stored.unwrap_or(0).clamp(0, live);
    tx.execute(
        "INSERT INTO limiter_counters(key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(value as u32)
}

impl SharedStore for SqliteStore {
    fn count(&self, key: &str) -> StoreResult<u32> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = reconcile_tx(&tx, key, now_ms())?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn try_acquire(&self, key: &str, holder: &str, limit: u32, ttl: Duration) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = reconcile_tx(&tx, key, now)?;
            if value >= limit {
                tx.commit()?;
                return Ok(false);
            }
            tx.execute(
                "UPDATE limiter_counters SET value = value + 1 WHERE key = ?1",
                params![key],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO limiter_holders(key, holder, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, holder, now + ttl.as_millis() as i64],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn release(&self, key: &str, holder: &str) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM limiter_holders WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )?;
            if removed > 0 {
                tx.execute(
                    "UPDATE limiter_counters SET value = MAX(value - 1, 0) WHERE key = ?1",
                    params![key],
                )?;
            }
            tx.commit()?;
            Ok(removed > 0)
        })
    }
}

fn classify(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Busy(err.to_string())
        }
        Some(ErrorCode::CannotOpen)
        | Some(ErrorCode::NotADatabase)
        | Some(ErrorCode::SystemIoFailure)
        | Some(ErrorCode::PermissionDenied)
        | Some(ErrorCode::ReadOnly) => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Sqlite(err),
    }
}
