//! In-memory endpoint cache with lazy eviction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::keys::{key_variants, matches_scope};
use super::traits::CacheStats;

/// Default time-to-live for cached endpoint data.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// A single cached endpoint payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Value,
  /// Monotonic time of the write
  pub cached_at: Instant,
  /// Wall-clock time of the write, for diagnostics
  pub stored_at: DateTime<Utc>,
  pub expires_at: Instant,
  pub valid: bool,
  pub invalidated_at: Option<Instant>,
}

impl CacheEntry {
  fn is_readable(&self, now: Instant) -> bool {
    self.valid && now < self.expires_at
  }
}

#[derive(Debug, Default)]
struct StoreState {
  entries: HashMap<String, CacheEntry>,
  hits: u64,
  misses: u64,
}

/// Map from endpoint key to a timestamped, expiring, invalidatable entry.
///
/// Reads never return invalid or expired payloads; such entries are removed
/// on the read that finds them instead of by a sweep timer.
#[derive(Debug, Default)]
pub struct CacheStore {
  state: Mutex<StoreState>,
}

static GLOBAL: OnceLock<Arc<CacheStore>> = OnceLock::new();

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Process-wide store, created on first use and never torn down.
  pub fn global() -> Arc<CacheStore> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(CacheStore::new())))
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    // Every critical section leaves the map consistent, so a poisoned lock is still usable
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store a payload, replacing any existing entry for `key`.
  pub fn put(&self, key: &str, payload: Value, ttl: Duration) {
    let now = Instant::now();
    let entry = CacheEntry {
      key: key.to_string(),
      payload,
      cached_at: now,
      stored_at: Utc::now(),
      expires_at: now + ttl,
      valid: true,
      invalidated_at: None,
    };
    self.lock().entries.insert(key.to_string(), entry);
    debug!(key, ttl_ms = ttl.as_millis() as u64, "Cached endpoint data");
  }

  /// Get a payload if it is present, valid and unexpired.
  pub fn get(&self, key: &str) -> Option<Value> {
    self.get_entry(key).map(|entry| entry.payload)
  }

  /// Like [`get`](Self::get) but returns the whole entry.
  pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
    let now = Instant::now();
    let mut state = self.lock();

    let readable = match state.entries.get(key) {
      Some(entry) => entry.is_readable(now),
      None => {
        state.misses += 1;
        return None;
      }
    };

    if readable {
      state.hits += 1;
      return state.entries.get(key).cloned();
    }

    if let Some(evicted) = state.entries.remove(key) {
      let reason = if evicted.valid { "expired" } else { "invalidated" };
      debug!(key, reason, "Evicted unreadable cache entry");
    }
    state.misses += 1;
    None
  }

  /// Mark an entry unreadable without deleting it.
  ///
  /// Returns whether an entry existed. Invalidating an invalid entry is a no-op.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut state = self.lock();
    match state.entries.get_mut(key) {
      Some(entry) => {
        if entry.valid {
          entry.valid = false;
          entry.invalidated_at = Some(Instant::now());
          debug!(key, "Invalidated cache entry");
        }
        true
      }
      None => false,
    }
  }

  /// Invalidate an endpoint under both its relative and origin-prefixed keys.
  ///
  /// Returns the number of entries found.
  pub fn invalidate_endpoint(&self, endpoint: &str, origin: Option<&str>) -> usize {
    let found = key_variants(endpoint, origin)
      .iter()
      .filter(|variant| self.invalidate(variant))
      .count();
    if found == 0 {
      debug!(endpoint, "Endpoint not cached under any key variant");
    }
    found
  }

  /// Last stored payload for `key`, ignoring validity and expiry.
  ///
  /// Does not evict. Used to serve stale data when a refresh fails.
  pub fn last_known(&self, key: &str) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  /// Delete every entry belonging to the scope with the given path prefix.
  ///
  /// Returns the number of deleted entries.
  pub fn clear_scope(&self, prefix: &str) -> usize {
    let mut state = self.lock();
    let before = state.entries.len();
    state.entries.retain(|key, _| !matches_scope(key, prefix));
    let removed = before - state.entries.len();
    debug!(prefix, removed, "Cleared scope from cache");
    removed
  }

  /// Delete every entry.
  pub fn clear_all(&self) -> usize {
    let mut state = self.lock();
    let removed = state.entries.len();
    state.entries.clear();
    removed
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let now = Instant::now();
    let state = self.lock();
    let mut stats = CacheStats {
      total_entries: state.entries.len(),
      hits: state.hits,
      misses: state.misses,
      ..Default::default()
    };
    for entry in state.entries.values() {
      if entry.is_readable(now) {
        stats.valid_entries += 1;
      }
      if now >= entry.expires_at {
        stats.expired_entries += 1;
      }
      if !entry.valid {
        stats.invalidated_entries += 1;
      }
    }
    stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test(start_paused = true)]
  async fn test_put_then_get_until_expiry() {
    let store = CacheStore::new();
    store.put("E1", json!({"v": 1}), Duration::from_millis(30_000));
    assert_eq!(store.get("E1"), Some(json!({"v": 1})));

    tokio::time::advance(Duration::from_millis(31_000)).await;
    assert_eq!(store.get("E1"), None);
    // Evicted on that read
    assert!(store.last_known("E1").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_exactly_at_deadline() {
    let store = CacheStore::new();
    store.put("k", json!(1), Duration::from_secs(10));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(store.get("k"), None);
  }

  #[tokio::test]
  async fn test_invalidate_is_terminal_until_put() {
    let store = CacheStore::new();
    store.put("k", json!("a"), Duration::from_secs(60));

    assert!(store.invalidate("k"));
    // Still introspectable before any read
    let last = store.last_known("k").unwrap();
    assert!(!last.valid);
    assert!(last.invalidated_at.is_some());

    assert_eq!(store.get("k"), None);
    assert_eq!(store.get("k"), None);

    store.put("k", json!("b"), Duration::from_secs(60));
    assert_eq!(store.get("k"), Some(json!("b")));
  }

  #[tokio::test]
  async fn test_invalidate_missing_and_repeated() {
    let store = CacheStore::new();
    assert!(!store.invalidate("nothing"));

    store.put("k", json!(1), Duration::from_secs(60));
    assert!(store.invalidate("k"));
    let first = store.last_known("k").unwrap().invalidated_at;
    assert!(store.invalidate("k"));
    assert_eq!(store.last_known("k").unwrap().invalidated_at, first);
  }

  #[tokio::test]
  async fn test_invalidate_endpoint_variants() {
    let store = CacheStore::new();
    store.put("/live/event/E1", json!(1), Duration::from_secs(60));
    store.put("https://artb.art/live/event/E1", json!(2), Duration::from_secs(60));

    let found = store.invalidate_endpoint("/live/event/E1", Some("https://artb.art"));
    assert_eq!(found, 2);
    assert!(store.get("/live/event/E1").is_none());
    assert!(store.get("https://artb.art/live/event/E1").is_none());
  }

  #[tokio::test]
  async fn test_clear_scope() {
    let store = CacheStore::new();
    let ttl = Duration::from_secs(60);
    store.put("/live/event/E1", json!(1), ttl);
    store.put("/live/event/E1/media", json!(2), ttl);
    store.put("/live/event/E1-1-2/bids", json!(3), ttl);
    store.put("/live/event/E10", json!(4), ttl);

    assert_eq!(store.clear_scope("/live/event/E1"), 3);
    assert_eq!(store.len(), 1);
    assert!(store.get("/live/event/E10").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stats() {
    let store = CacheStore::new();
    store.put("a", json!(1), Duration::from_secs(5));
    store.put("b", json!(2), Duration::from_secs(60));
    store.put("c", json!(3), Duration::from_secs(60));
    store.invalidate("c");
    tokio::time::advance(Duration::from_secs(6)).await;

    store.get("b");
    store.get("zzz");

    let stats = store.stats();
    assert_eq!(stats.total_entries, 3);
    assert_eq!(stats.valid_entries, 1);
    assert_eq!(stats.expired_entries, 1);
    assert_eq!(stats.invalidated_entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
  }

  #[tokio::test]
  async fn test_last_write_wins() {
    let store = CacheStore::new();
    store.put("k", json!(1), Duration::from_secs(60));
    store.put("k", json!(2), Duration::from_secs(60));
    assert_eq!(store.get("k"), Some(json!(2)));
    assert_eq!(store.len(), 1);
  }
}
