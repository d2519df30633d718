use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// How often the processed-message set is wiped.
pub const DEFAULT_CLEAR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Set of already processed `scope-timestamp` keys.
///
/// Memory is bounded by clearing the whole set on a schedule rather than
/// evicting per item. A duplicate that arrives right after a clear is
/// processed again; invalidation is idempotent so that only costs a refresh.
#[derive(Debug)]
pub struct DedupRecord {
  seen: HashSet<String>,
  last_clear: Instant,
  clear_interval: Duration,
}

impl DedupRecord {
  pub fn new(clear_interval: Duration) -> Self {
    Self {
      seen: HashSet::new(),
      last_clear: Instant::now(),
      clear_interval,
    }
  }

  /// Record `key` and report whether it is new.
  pub fn check_and_insert(&mut self, key: &str) -> bool {
    self.check_and_insert_at(key, Instant::now())
  }

  pub fn check_and_insert_at(&mut self, key: &str, now: Instant) -> bool {
    if self.seen.contains(key) {
      return false;
    }

    if now.duration_since(self.last_clear) > self.clear_interval {
      let cleared = self.seen.len();
      self.seen.clear();
      self.last_clear = now;
      info!(cleared, "Cleared processed broadcast record");
    }

    self.seen.insert(key.to_string());
    true
  }

  pub fn len(&self) -> usize {
    self.seen.len()
  }

  pub fn is_empty(&self) -> bool {
    self.seen.is_empty()
  }
}

impl Default for DedupRecord {
  fn default() -> Self {
    Self::new(DEFAULT_CLEAR_INTERVAL)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_duplicate_rejected() {
    let mut record = DedupRecord::default();
    assert!(record.check_and_insert("evt-42-1000"));
    assert!(!record.check_and_insert("evt-42-1000"));
    assert!(record.check_and_insert("evt-42-1001"));
    assert_eq!(record.len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_full_clear_after_interval() {
    let mut record = DedupRecord::new(Duration::from_secs(300));
    record.check_and_insert("a");
    record.check_and_insert("b");

    tokio::time::advance(Duration::from_secs(301)).await;
    // A new key triggers the clear; it survives it
    assert!(record.check_and_insert("c"));
    assert_eq!(record.len(), 1);

    // Old keys are forgotten
    assert!(record.check_and_insert("a"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_clear_within_interval() {
    let mut record = DedupRecord::new(Duration::from_secs(300));
    record.check_and_insert("a");
    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(record.check_and_insert("b"));
    assert!(!record.check_and_insert("a"));
  }
}
