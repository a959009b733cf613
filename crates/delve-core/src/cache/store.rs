//! Response cache storage.
//!
//! [`CacheStore`] wraps a [`StoreBackend`] and keeps the hit/miss counters;
//! backends only move entries in and out of storage.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::normalize::{CacheKey, Fingerprint};
use crate::provider::CompletionResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Exact-match digest of the request that produced this entry.
    pub exact_key: CacheKey,
    pub response: CompletionResponse,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: &Fingerprint, response: CompletionResponse) -> Self {
        Self {
            key: fingerprint.key.clone(),
            exact_key: fingerprint.exact.clone(),
            response,
            created_at: Utc::now(),
        }
    }
}

/// Storage for cache entries. Implementations must be safe to share between
/// threads; [`CacheStore`] calls them from the blocking threadpool.
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, Error>;

    /// Insert or replace the entry stored under `entry.key`.
    fn save(&self, entry: &CacheEntry) -> Result<(), Error>;

    /// Remove all entries, returning how many were removed.
    fn clear(&self) -> Result<usize, Error>;

    fn len(&self) -> Result<usize, Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits whose exact request differs from the one that wrote the entry.
    /// Every repeat of such a variant counts again, so this is an upper
    /// bound on the hits an exact-match cache would have missed.
    pub normalized_hits: u64,
    pub writes: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lookups: {}, hits: {} ({} via normalization), misses: {}, writes: {}, hit rate: {:.1}%",
            self.lookups(),
            self.hits,
            self.normalized_hits,
            self.misses,
            self.writes,
            self.hit_rate() * 100.0
        )
    }
}

/// Fingerprint-keyed response store with process-wide statistics.
pub struct CacheStore {
    backend: Box<dyn StoreBackend>,
    stats: Mutex<CacheStats>,
}

impl CacheStore {
    pub fn new(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryBackend::default())
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Ok(Self::new(SqliteBackend::open(path)?))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn stats_mut(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a request. Every call counts as exactly one hit or one miss;
    /// a backend failure counts as a miss and is returned to the caller.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, Error> {
        let result = self.backend.load(&fingerprint.key);

        let mut stats = self.stats_mut();
        match &result {
            Ok(Some(entry)) => {
                stats.hits += 1;
                if entry.exact_key != fingerprint.exact {
                    stats.normalized_hits += 1;
                }
            }
            Ok(None) | Err(_) => stats.misses += 1,
        }
        result
    }

    /// Store a response. An existing entry under the same key is replaced.
    pub fn put(&self, fingerprint: &Fingerprint, response: CompletionResponse) -> Result<(), Error> {
        let entry = CacheEntry::new(fingerprint, response);
        self.backend.save(&entry)?;
        self.stats_mut().writes += 1;
        debug!(key = %entry.key, backend = self.backend.name(), "Stored response");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats_mut()
    }

    pub fn reset_stats(&self) {
        *self.stats_mut() = CacheStats::default();
    }

    pub fn clear(&self) -> Result<usize, Error> {
        self.backend.clear()
    }

    pub fn len(&self) -> Result<usize, Error> {
        self.backend.len()
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }
}

/// Non-durable backend for tests and cache-less configurations.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryBackend {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, Error> {
        Ok(self.entries().get(key).cloned())
    }

    fn save(&self, entry: &CacheEntry) -> Result<(), Error> {
        self.entries().insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn clear(&self) -> Result<usize, Error> {
        let mut entries = self.entries();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn len(&self) -> Result<usize, Error> {
        Ok(self.entries().len())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS responses (
    key TEXT PRIMARY KEY,
    exact_key TEXT NOT NULL,
    model TEXT NOT NULL,
    response TEXT NOT NULL,
    created_at TEXT NOT NULL
)";

/// SQLite-backed durable store.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::storage(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(SCHEMA, [])?;
        debug!(path = %path.display(), "Opened response cache");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Error> {
        self.conn
            .lock()
            .map_err(|_| Error::storage("cache connection lock poisoned"))
    }
}

impl StoreBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, Error> {
        let conn = self.conn()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT exact_key, response, created_at FROM responses WHERE key = ?",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((exact_key, response, created_at)) = row else {
            return Ok(None);
        };

        let response: CompletionResponse = serde_json::from_str(&response)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::storage(format!("Bad created_at for {}: {}", key, e)))?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            exact_key: CacheKey::from_stored(exact_key),
            response,
            created_at,
        }))
    }

    fn save(&self, entry: &CacheEntry) -> Result<(), Error> {
        let response = serde_json::to_string(&entry.response)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO responses (key, exact_key, model, response, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                entry.key.as_str(),
                entry.exact_key.as_str(),
                entry.response.model,
                response,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<usize, Error> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM responses", [])?)
    }

    fn len(&self) -> Result<usize, Error> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
