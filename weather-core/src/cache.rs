//! Durable key → (payload, expiry) storage.
//!
//! The store holds no TTL policy of its own: the caller supplies a TTL on every
//! `put`, and `get` never returns an entry whose expiry has passed. Expired rows
//! are removed lazily on read and in bulk by [`spawn_sweeper`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use std::{collections::HashMap, fmt::Debug, path::Path, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    error::CacheError,
};

pub trait CacheStore: Send + Sync + Debug {
    /// Payload for `key`, or `None` if it was never stored or has expired.
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `payload` under `key`, replacing any previous entry.
    fn put(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError>;

    fn invalidate(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every expired entry, returning how many were removed.
    fn purge_expired(&self) -> Result<usize, CacheError>;
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// SQLite-backed cache. One connection behind a mutex, so every read and
/// write of a key is atomic with respect to the others.
#[derive(Debug)]
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::Unavailable(format!(
                    "Failed to create cache directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::with_connection(conn, Arc::new(SystemClock))
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS weather_cache (
                cache_key  TEXT PRIMARY KEY,
                payload    TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_weather_cache_expires ON weather_cache(expires_at);
            "#,
        )?;
        tracing::debug!("Weather cache schema ready");
        Ok(Self { conn: Mutex::new(conn), clock })
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.conn.lock();

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload, expires_at FROM weather_cache WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((payload, expires_at)) if now < expires_at => Ok(Some(payload)),
            Some(_) => {
                conn.execute("DELETE FROM weather_cache WHERE cache_key = ?1", params![key])?;
                tracing::debug!(key, "Dropped expired cache entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = expiry(self.clock.now(), ttl).timestamp_millis();
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO weather_cache (cache_key, payload, expires_at) VALUES (?1, ?2, ?3)",
            params![key, payload, expires_at],
        )?;
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.conn.lock().execute("DELETE FROM weather_cache WHERE cache_key = ?1", params![key])?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now().timestamp_millis();
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM weather_cache WHERE expires_at <= ?1", params![now])?;
        Ok(removed)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: String,
    expires_at: DateTime<Utc>,
}

/// Process-local cache, used when the database cannot be opened.
#[derive(Debug)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()), clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if now < entry.expires_at => return Ok(Some(entry.payload.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Re-check under the write lock: a fresh `put` may have landed in between.
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| now >= entry.expires_at) {
            entries.remove(key);
        }
        Ok(None)
    }

    fn put(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), CacheError> {
        let entry =
            MemoryEntry { payload: payload.to_owned(), expires_at: expiry(self.clock.now(), ttl) };
        self.entries.write().insert(key.to_owned(), entry);
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        Ok(before - entries.len())
    }
}

/// Periodically purge expired entries until `shutdown` is cancelled.
pub fn spawn_sweeper(
    store: Arc<dyn CacheStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match store.purge_expired() {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Purged expired cache entries"),
                        Err(e) => tracing::warn!("Cache sweep failed: {e}"),
                    }
                }
            }
        }
    })
}
