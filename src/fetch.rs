//! Cache-aware fetching of one endpoint.

use color_eyre::{eyre::WrapErr, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheResult, CacheStore, DEFAULT_TTL};

/// A factory that fetches fresh data for an endpoint.
pub type FetchFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Fetches an endpoint through the cache store.
///
/// Fresh data is written back with the configured TTL. When a fetch fails
/// the last known payload is served as stale, if there is one.
#[derive(Clone)]
pub struct CachedFetch {
  endpoint: String,
  cache: Arc<CacheStore>,
  fetcher: FetchFn,
  ttl: Duration,
}

impl CachedFetch {
  /// Create a fetch helper from any closure returning a future.
  ///
  /// ```ignore
  /// let fetch = CachedFetch::new("/live/event/AB3028", cache, move |endpoint| {
  ///   let client = client.clone();
  ///   async move { client.fetch(&endpoint).await }
  /// });
  /// ```
  pub fn new<F, Fut>(endpoint: &str, cache: Arc<CacheStore>, fetcher: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    Self::from_fn(
      endpoint,
      cache,
      Arc::new(move |endpoint: String| -> BoxFuture<'static, Result<Value>> {
        Box::pin(fetcher(endpoint))
      }),
    )
  }

  pub fn from_fn(endpoint: &str, cache: Arc<CacheStore>, fetcher: FetchFn) -> Self {
    Self {
      endpoint: endpoint.to_string(),
      cache,
      fetcher,
      ttl: DEFAULT_TTL,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Always hit the fetcher; fall back to the last known payload on failure.
  pub async fn fetch_data(&self) -> Result<CacheResult<Value>> {
    debug!(endpoint = %self.endpoint, "Fetching");
    match (self.fetcher)(self.endpoint.clone()).await {
      Ok(data) => {
        self.cache.put(&self.endpoint, data.clone(), self.ttl);
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match self.cache.last_known(&self.endpoint) {
        Some(entry) => {
          warn!(endpoint = %self.endpoint, error = %e, "Fetch failed, serving stale data");
          Ok(CacheResult::stale(entry.payload, entry.stored_at))
        }
        None => Err(e).wrap_err_with(|| format!("Failed to fetch {}", self.endpoint)),
      },
    }
  }

  /// Serve a valid cache entry, or fetch.
  pub async fn get_cached_or_fetch(&self) -> Result<CacheResult<Value>> {
    if let Some(entry) = self.cache.get_entry(&self.endpoint) {
      debug!(endpoint = %self.endpoint, "Serving cached data");
      return Ok(CacheResult::from_cache(entry.payload, entry.stored_at));
    }
    self.fetch_data().await
  }
}

impl std::fmt::Debug for CachedFetch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedFetch")
      .field("endpoint", &self.endpoint)
      .field("ttl", &self.ttl)
      .finish_non_exhaustive()
  }
}
