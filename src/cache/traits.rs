//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a request is served relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Always fetch; never read or write a bucket
  NetworkOnly,
  /// Serve an unexpired entry, otherwise fetch and store
  CacheFirst,
  /// Serve any entry immediately and refresh it in the background
  StaleWhileRevalidate,
  /// Fetch with a timeout, falling back to the bucket
  NetworkFirst,
  /// App shell assets bundled with the build, cache-first without expiry
  Precache,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::NetworkOnly => "NetworkOnly",
      Self::CacheFirst => "CacheFirst",
      Self::StaleWhileRevalidate => "StaleWhileRevalidate",
      Self::NetworkFirst => "NetworkFirst",
      Self::Precache => "Precache",
    };
    f.write_str(s)
  }
}

/// Size and age bounds of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
  /// 0 means the bucket never retains anything
  pub max_entries: usize,
  /// 0 means no age limit
  pub max_age_secs: u64,
}

impl Limits {
  /// Bounds for buckets that must never hold a response.
  pub const NEVER_RETAIN: Limits = Limits {
    max_entries: 0,
    max_age_secs: 0,
  };
}

/// Everything the executor needs to serve a request: strategy, target bucket and bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
  pub strategy: Strategy,
  pub bucket: String,
  pub limits: Limits,
  /// Only consulted by `NetworkFirst`
  pub network_timeout: Duration,
}

impl Policy {
  pub fn new(strategy: Strategy, bucket: &str, limits: Limits) -> Self {
    Self {
      strategy,
      bucket: bucket.to_string(),
      limits,
      network_timeout: Duration::from_secs(10),
    }
  }

  pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
    self.network_timeout = timeout;
    self
  }
}

/// A network response in the form it is stored in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  /// Build a 200 response with the given body and no headers.
  #[cfg(test)]
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self {
      status: 200,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Only plain successful responses are ever written to a bucket.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }
}

/// A cached response together with the moment it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  pub fn new(response: CachedResponse) -> Self {
    Self {
      response,
      cached_at: Utc::now(),
    }
  }

  /// Whether the entry is older than `max_age_secs`. A limit of 0 never expires.
  pub fn is_expired(&self, max_age_secs: u64) -> bool {
    if max_age_secs == 0 {
      return false;
    }
    let age = Utc::now() - self.cached_at;
    age.num_seconds() > max_age_secs as i64
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its age, served while a revalidation runs
  CacheStale,
  /// Network failed or timed out, serving cached data
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::CacheStale => "cache (stale)",
      Self::Offline => "cache (offline)",
    };
    f.write_str(s)
  }
}
