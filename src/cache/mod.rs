//! Local read cache for server-computed snapshot endpoints.
//!
//! This module provides:
//! - An in-memory store keyed by endpoint, with TTL expiry and broadcast invalidation
//! - Lazy eviction: unreadable entries are dropped by the read that finds them
//! - Endpoint key patterns and scope matching for live event data
//! - Result metadata telling callers whether data came from the network, cache, or a stale fallback

mod keys;
mod store;
mod traits;

pub use keys::{key_path, key_variants, matches_scope, EndpointKey};
pub use store::{CacheEntry, CacheStore, DEFAULT_TTL};
pub use traits::{CacheResult, CacheSource, CacheStats};
