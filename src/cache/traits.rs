//! Result and statistics types shared by the cache and its consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result from a cache-aware fetch, including data and metadata about the source.
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

  /// Create a new cache result from a valid cache entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for a stale fallback after a failed refresh.
  pub fn stale(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Stale,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::Stale
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Fresh data from the network
  Network,
  /// Valid, unexpired cache entry
  Cache,
  /// Invalidated or expired entry served because the refresh failed
  Stale,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Stale => "stale",
    }
  }
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Point-in-time counters for the cache store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  /// All entries currently held, readable or not
  pub total_entries: usize,
  /// Entries that `get` would return
  pub valid_entries: usize,
  /// Entries past their expiry
  pub expired_entries: usize,
  /// Entries marked invalid by a broadcast
  pub invalidated_entries: usize,
  /// Reads that returned a payload
  pub hits: u64,
  /// Reads that found nothing usable
  pub misses: u64,
}

impl CacheStats {
  /// Calculate the hit rate (0.0 to 1.0).
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}
