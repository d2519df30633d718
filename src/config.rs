use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::consumer::ConsumerConfig;
use crate::health::HealthConfig;
use crate::poller::PollerConfig;
use crate::subscription::SubscriptionConfig;
use crate::visibility::VisibilityConfig;

/// Durations are configured in milliseconds.
fn ms(millis: u64) -> Duration {
  Duration::from_millis(millis)
}

fn as_ms(duration: Duration) -> u64 {
  duration.as_millis() as u64
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin serving the snapshot endpoints (e.g. `https://artb.art`)
  pub origin: Option<String>,
  pub log: LogConfig,
  pub cache: CacheSection,
  pub subscription: SubscriptionSection,
  pub health: HealthSection,
  pub poller: PollerSection,
  pub visibility: VisibilitySection,
  pub consumer: ConsumerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Fallback filter when `RUST_LOG` is unset
  pub level: String,
  /// Write daily rolling files here instead of stderr
  pub directory: Option<PathBuf>,
  pub file_prefix: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
      file_prefix: "livecache.log".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub ttl_ms: u64,
  pub request_timeout_ms: u64,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      ttl_ms: as_ms(crate::cache::DEFAULT_TTL),
      request_timeout_ms: 10_000,
    }
  }
}

impl CacheSection {
  pub fn ttl(&self) -> Duration {
    ms(self.ttl_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    ms(self.request_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionSection {
  pub channel_prefix: String,
  pub event_name: String,
  pub reconnect_delay_ms: u64,
  pub dedup_clear_interval_ms: u64,
}

impl Default for SubscriptionSection {
  fn default() -> Self {
    let d = SubscriptionConfig::default();
    Self {
      channel_prefix: d.channel_prefix,
      event_name: d.event_name,
      reconnect_delay_ms: as_ms(d.reconnect_delay),
      dedup_clear_interval_ms: as_ms(d.dedup_clear_interval),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
  pub error_threshold: u32,
  pub error_window_ms: u64,
  pub error_reset_ms: u64,
  pub closure_threshold: u32,
  pub closure_window_ms: u64,
}

impl Default for HealthSection {
  fn default() -> Self {
    let d = HealthConfig::default();
    Self {
      error_threshold: d.error_threshold,
      error_window_ms: as_ms(d.error_window),
      error_reset_ms: as_ms(d.error_reset),
      closure_threshold: d.closure_threshold,
      closure_window_ms: as_ms(d.closure_window),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSection {
  pub enabled: bool,
  pub fast_interval_ms: u64,
  pub medium_interval_ms: u64,
  pub slow_interval_ms: u64,
  pub recent_window_ms: u64,
  pub idle_window_ms: u64,
  pub backoff_factor: f64,
  pub max_interval_ms: u64,
}

impl Default for PollerSection {
  fn default() -> Self {
    let d = PollerConfig::default();
    Self {
      enabled: d.enabled,
      fast_interval_ms: as_ms(d.fast_interval),
      medium_interval_ms: as_ms(d.medium_interval),
      slow_interval_ms: as_ms(d.slow_interval),
      recent_window_ms: as_ms(d.recent_window),
      idle_window_ms: as_ms(d.idle_window),
      backoff_factor: d.backoff_factor,
      max_interval_ms: as_ms(d.max_interval),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisibilitySection {
  pub debounce_ms: u64,
  pub settle_delay_ms: u64,
}

impl Default for VisibilitySection {
  fn default() -> Self {
    let d = VisibilityConfig::default();
    Self {
      debounce_ms: as_ms(d.debounce),
      settle_delay_ms: as_ms(d.settle_delay),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
  pub coalesce_delay_ms: u64,
  pub auto_refresh: bool,
}

impl Default for ConsumerSection {
  fn default() -> Self {
    let d = ConsumerConfig::default();
    Self {
      coalesce_delay_ms: as_ms(d.coalesce_delay),
      auto_refresh: d.auto_refresh,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./livecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/livecache/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("livecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("livecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.validate_with_origin(self.origin().as_deref())
  }

  fn validate_with_origin(&self, origin: Option<&str>) -> Result<()> {
    if let Some(origin) = origin {
      let url = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
      if !url.has_host() {
        return Err(eyre!("Invalid origin {}: missing host", origin));
      }
    }
    // Also rejects NaN and infinity, which Duration::mul_f64 cannot take
    let factor = self.poller.backoff_factor;
    if !(factor.is_finite() && factor >= 1.0) {
      return Err(eyre!(
        "poller.backoff_factor must be a finite number of at least 1.0, got {}",
        factor
      ));
    }
    if self.health.error_threshold == 0 || self.health.closure_threshold == 0 {
      return Err(eyre!("health thresholds must be at least 1"));
    }
    Ok(())
  }

  /// Origin from the config, overridden by `LIVECACHE_ORIGIN`.
  pub fn origin(&self) -> Option<String> {
    std::env::var("LIVECACHE_ORIGIN")
      .ok()
      .filter(|v| !v.is_empty())
      .or_else(|| self.origin.clone())
  }

  pub fn subscription_config(&self) -> SubscriptionConfig {
    let s = &self.subscription;
    SubscriptionConfig {
      channel_prefix: s.channel_prefix.clone(),
      event_name: s.event_name.clone(),
      reconnect_delay: ms(s.reconnect_delay_ms),
      dedup_clear_interval: ms(s.dedup_clear_interval_ms),
      origin: self.origin(),
    }
  }

  pub fn health_config(&self) -> HealthConfig {
    let h = &self.health;
    HealthConfig {
      error_threshold: h.error_threshold,
      error_window: ms(h.error_window_ms),
      error_reset: ms(h.error_reset_ms),
      closure_threshold: h.closure_threshold,
      closure_window: ms(h.closure_window_ms),
    }
  }

  pub fn poller_config(&self) -> PollerConfig {
    let p = &self.poller;
    PollerConfig {
      enabled: p.enabled,
      fast_interval: ms(p.fast_interval_ms),
      medium_interval: ms(p.medium_interval_ms),
      slow_interval: ms(p.slow_interval_ms),
      recent_window: ms(p.recent_window_ms),
      idle_window: ms(p.idle_window_ms),
      backoff_factor: p.backoff_factor,
      max_interval: ms(p.max_interval_ms),
    }
  }

  pub fn visibility_config(&self) -> VisibilityConfig {
    VisibilityConfig {
      debounce: ms(self.visibility.debounce_ms),
      settle_delay: ms(self.visibility.settle_delay_ms),
    }
  }

  pub fn consumer_config(&self) -> ConsumerConfig {
    ConsumerConfig {
      coalesce_delay: ms(self.consumer.coalesce_delay_ms),
      auto_refresh: self.consumer.auto_refresh,
      default_ttl: self.cache.ttl(),
    }
  }
}
