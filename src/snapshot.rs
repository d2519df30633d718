//! HTTP client for live snapshot endpoints.

use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::fetch::FetchFn;

/// Fetches JSON snapshots from `{origin}{endpoint}`.
#[derive(Clone, Debug)]
pub struct SnapshotClient {
  client: reqwest::Client,
  origin: String,
}

impl SnapshotClient {
  pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: origin.trim_end_matches('/').to_string(),
    })
  }

  pub fn origin(&self) -> &str {
    &self.origin
  }

  /// Full URL for an endpoint. Absolute URLs are used as-is.
  pub fn url_for(&self, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
      endpoint.to_string()
    } else {
      format!("{}{}", self.origin, endpoint)
    }
  }

  pub async fn fetch(&self, endpoint: &str) -> Result<Value> {
    let url = self.url_for(endpoint);
    debug!(url = %url, "GET snapshot");

    let response = self
      .client
      .get(&url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("HTTP {}", status));
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;
    serde_json::from_slice(&body).map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// This client as a fetch function for [`CachedFetch`](crate::fetch::CachedFetch).
  pub fn fetcher(&self) -> FetchFn {
    let client = self.clone();
    std::sync::Arc::new(move |endpoint: String| {
      let client = client.clone();
      async move { client.fetch(&endpoint).await }.boxed()
    })
  }
}
