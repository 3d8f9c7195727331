//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedEntry, CachedResponse};

/// Metadata of one stored entry, used when enumerating a bucket.
#[derive(Debug, Clone)]
pub struct EntryInfo {
  pub key: String,
  pub url: String,
  pub cached_at: DateTime<Utc>,
}

/// Per-bucket counts for `doorstep cache list`.
#[derive(Debug, Clone)]
pub struct BucketSummary {
  pub bucket: String,
  pub entries: usize,
  pub oldest: Option<DateTime<Utc>>,
  pub newest: Option<DateTime<Utc>>,
}

/// Trait for bucketed cache storage backends.
///
/// Entries inside a bucket are ordered by insertion. Rewriting an existing
/// key moves it to the newest position.
pub trait CacheStorage: Send + Sync {
  /// Get an entry by key.
  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store an entry, then evict the oldest-inserted entries until the bucket
  /// holds at most `max_entries`. Returns the number of evicted entries.
  /// A bound of 0 stores nothing.
  fn put(
    &self,
    bucket: &str,
    key: &str,
    url: &str,
    entry: &CachedEntry,
    max_entries: usize,
  ) -> Result<usize>;

  /// Delete a single entry. Returns whether it existed.
  fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

  /// All entries of a bucket, oldest-inserted first.
  fn entries_by_age(&self, bucket: &str) -> Result<Vec<EntryInfo>>;

  /// Delete every entry of a bucket cached before `cutoff`.
  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Summaries of every non-empty bucket.
  fn buckets(&self) -> Result<Vec<BucketSummary>>;

  /// Drop one bucket, or everything when `bucket` is None.
  fn clear(&self, bucket: Option<&str>) -> Result<usize>;
}

impl<T: CacheStorage + ?Sized> CacheStorage for Box<T> {
  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    (**self).get(bucket, key)
  }

  fn put(
    &self,
    bucket: &str,
    key: &str,
    url: &str,
    entry: &CachedEntry,
    max_entries: usize,
  ) -> Result<usize> {
    (**self).put(bucket, key, url, entry, max_entries)
  }

  fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
    (**self).delete(bucket, key)
  }

  fn entries_by_age(&self, bucket: &str) -> Result<Vec<EntryInfo>> {
    (**self).entries_by_age(bucket)
  }

  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    (**self).purge_older_than(bucket, cutoff)
  }

  fn buckets(&self) -> Result<Vec<BucketSummary>> {
    (**self).buckets()
  }

  fn clear(&self, bucket: Option<&str>) -> Result<usize> {
    (**self).clear(bucket)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _bucket: &str, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(
    &self,
    _bucket: &str,
    _key: &str,
    _url: &str,
    _entry: &CachedEntry,
    _max_entries: usize,
  ) -> Result<usize> {
    Ok(0) // Discard
  }

  fn delete(&self, _bucket: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn entries_by_age(&self, _bucket: &str) -> Result<Vec<EntryInfo>> {
    Ok(Vec::new())
  }

  fn purge_older_than(&self, _bucket: &str, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn buckets(&self) -> Result<Vec<BucketSummary>> {
    Ok(Vec::new())
  }

  fn clear(&self, _bucket: Option<&str>) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory cache.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("doorstep").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cached response; seq records insertion order for FIFO eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    UNIQUE (bucket, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_bucket_seq
    ON cache_entries(bucket, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM cache_entries WHERE bucket = ? AND cache_key = ?",
        params![bucket, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, cached_at_str)) => {
        let response: CachedResponse = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    bucket: &str,
    key: &str,
    url: &str,
    entry: &CachedEntry,
    max_entries: usize,
  ) -> Result<usize> {
    if max_entries == 0 {
      return Ok(0);
    }

    let conn = self.lock()?;
    let data = serde_json::to_vec(&entry.response)
      .map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;

    // Rolled back on drop if any step below fails
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // REPLACE deletes the old row, so a rewritten key gets a fresh seq
    tx
      .execute(
        "INSERT OR REPLACE INTO cache_entries (bucket, cache_key, url, data, cached_at)
         VALUES (?, ?, ?, ?, ?)",
        params![bucket, key, url, data, format_datetime(entry.cached_at)],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    let evicted = tx
      .execute(
        "DELETE FROM cache_entries WHERE bucket = ?1 AND seq NOT IN (
           SELECT seq FROM cache_entries WHERE bucket = ?1 ORDER BY seq DESC LIMIT ?2
         )",
        params![bucket, max_entries as i64],
      )
      .map_err(|e| eyre!("Failed to evict cache entries: {}", e))?;

    tx
      .commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(evicted)
  }

  fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute(
        "DELETE FROM cache_entries WHERE bucket = ? AND cache_key = ?",
        params![bucket, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(deleted > 0)
  }

  fn entries_by_age(&self, bucket: &str) -> Result<Vec<EntryInfo>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT cache_key, url, cached_at FROM cache_entries
         WHERE bucket = ? ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map(params![bucket], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(key, url, cached_at)| {
        Ok(EntryInfo {
          key,
          url,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }

  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE bucket = ? AND cached_at < ?",
        params![bucket, format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to purge cache entries: {}", e))
  }

  fn buckets(&self) -> Result<Vec<BucketSummary>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT bucket, COUNT(*), MIN(cached_at), MAX(cached_at) FROM cache_entries
         GROUP BY bucket ORDER BY bucket",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, i64, Option<String>, Option<String>)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query buckets: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    rows
      .into_iter()
      .map(|(bucket, count, oldest, newest)| {
        Ok(BucketSummary {
          bucket,
          entries: count as usize,
          oldest: oldest.as_deref().map(parse_datetime).transpose()?,
          newest: newest.as_deref().map(parse_datetime).transpose()?,
        })
      })
      .collect()
  }

  fn clear(&self, bucket: Option<&str>) -> Result<usize> {
    let conn = self.lock()?;
    let deleted = match bucket {
      Some(b) => conn.execute("DELETE FROM cache_entries WHERE bucket = ?", params![b]),
      None => conn.execute("DELETE FROM cache_entries", []),
    }
    .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(deleted)
  }
}

/// Timestamps are stored as fixed-width RFC 3339 so text comparison orders them.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
