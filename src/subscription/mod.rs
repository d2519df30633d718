//! Invalidation fan-out.
//!
//! One push channel per scope; every raw broadcast is parsed, deduplicated,
//! applied to the cache store, then delivered to the scope's listeners.

mod dedup;
mod manager;

pub use dedup::{DedupRecord, DEFAULT_CLEAR_INTERVAL};
pub use manager::{
  Listener, ListenerId, StatusEvent, SubscriptionConfig, SubscriptionManager, SubscriptionStats,
};
