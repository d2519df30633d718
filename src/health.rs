//! Transport health classification.
//!
//! Counts errors and closures over short windows and flips between healthy
//! and unhealthy. Purely reactive: no timers, every input is a tracking call.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why the transport was classified unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradeReason {
  /// Repeated channel errors in a short window
  Errors,
  /// Channel closed repeatedly in a short window
  RapidReconnect,
}

impl DegradeReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Errors => "errors",
      Self::RapidReconnect => "rapid_reconnect",
    }
  }
}

impl std::fmt::Display for DegradeReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
  Degraded(DegradeReason),
  Recovered,
}

/// Snapshot of a monitor's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
  pub error_count: u32,
  pub last_error_at: Option<Instant>,
  pub closure_count: u32,
  pub last_closure_at: Option<Instant>,
  pub healthy: bool,
}

impl Default for HealthState {
  fn default() -> Self {
    Self {
      error_count: 0,
      last_error_at: None,
      closure_count: 0,
      last_closure_at: None,
      healthy: true,
    }
  }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
  pub error_threshold: u32,
  /// Max gap between consecutive errors for them to count toward degradation
  pub error_window: Duration,
  /// Quiet period after which the error count starts over
  pub error_reset: Duration,
  pub closure_threshold: u32,
  pub closure_window: Duration,
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      error_threshold: 3,
      error_window: Duration::from_secs(30),
      error_reset: Duration::from_secs(60),
      closure_threshold: 2,
      closure_window: Duration::from_secs(10),
    }
  }
}

pub type TransitionCallback = Arc<dyn Fn(HealthTransition) + Send + Sync>;

/// Health monitor for one transport connection.
pub struct HealthMonitor {
  config: HealthConfig,
  state: Mutex<HealthState>,
  callback: Option<TransitionCallback>,
}

impl HealthMonitor {
  pub fn new(config: HealthConfig) -> Self {
    Self {
      config,
      state: Mutex::new(HealthState::default()),
      callback: None,
    }
  }

  /// Invoke `callback` once per state transition.
  pub fn with_callback(mut self, callback: TransitionCallback) -> Self {
    self.callback = Some(callback);
    self
  }

  fn lock(&self) -> MutexGuard<'_, HealthState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn health(&self) -> HealthState {
    self.lock().clone()
  }

  pub fn is_healthy(&self) -> bool {
    self.lock().healthy
  }

  pub fn track_error(&self, kind: &str) {
    self.track_error_at(kind, Instant::now());
  }

  pub fn track_error_at(&self, kind: &str, now: Instant) {
    let transition = {
      let mut state = self.lock();
      let mut transition = None;

      if let Some(last) = state.last_error_at {
        if now.saturating_duration_since(last) > self.config.error_reset {
          state.error_count = 0;
          if !state.healthy {
            state.healthy = true;
            transition = Some(HealthTransition::Recovered);
          }
        }
      }

      let within_window = state
        .last_error_at
        .is_some_and(|last| now.saturating_duration_since(last) <= self.config.error_window);
      state.error_count += 1;
      state.last_error_at = Some(now);
      debug!(kind, errors = state.error_count, "Transport error");

      if state.healthy && within_window && state.error_count >= self.config.error_threshold {
        state.healthy = false;
        transition = Some(HealthTransition::Degraded(DegradeReason::Errors));
      }
      transition
    };
    self.fire(transition);
  }

  pub fn track_closure(&self, reason: &str) {
    self.track_closure_at(reason, Instant::now());
  }

  pub fn track_closure_at(&self, reason: &str, now: Instant) {
    let transition = {
      let mut state = self.lock();
      if let Some(last) = state.last_closure_at {
        if now.saturating_duration_since(last) > self.config.closure_window {
          state.closure_count = 0;
        }
      }
      state.closure_count += 1;
      state.last_closure_at = Some(now);
      debug!(reason, closures = state.closure_count, "Transport closed");

      if state.healthy && state.closure_count >= self.config.closure_threshold {
        state.healthy = false;
        Some(HealthTransition::Degraded(DegradeReason::RapidReconnect))
      } else {
        None
      }
    };
    self.fire(transition);
  }

  pub fn track_recovery(&self) {
    self.track_recovery_at(Instant::now());
  }

  /// Count one successful (re)subscription.
  ///
  /// Recovery also waits until a burst of closures has left its window.
  pub fn track_recovery_at(&self, now: Instant) {
    let transition = {
      let mut state = self.lock();
      state.error_count = state.error_count.saturating_sub(1);
      self.try_recover(&mut state, now)
    };
    self.fire(transition);
  }

  /// Time left before a rapid-reconnect degradation may recover.
  pub fn recovery_hold_at(&self, now: Instant) -> Option<Duration> {
    let state = self.lock();
    if state.healthy {
      return None;
    }
    self.closure_hold(&state, now)
  }

  /// Recover if nothing holds the monitor unhealthy any more. Counters are left alone.
  pub fn recheck_at(&self, now: Instant) {
    let transition = {
      let mut state = self.lock();
      self.try_recover(&mut state, now)
    };
    self.fire(transition);
  }

  fn closure_hold(&self, state: &HealthState, now: Instant) -> Option<Duration> {
    if state.closure_count < self.config.closure_threshold {
      return None;
    }
    let elapsed = now.saturating_duration_since(state.last_closure_at?);
    self.config.closure_window.checked_sub(elapsed).filter(|left| !left.is_zero())
  }

  fn try_recover(&self, state: &mut HealthState, now: Instant) -> Option<HealthTransition> {
    if state.healthy || state.error_count > 0 {
      return None;
    }
    if let Some(left) = self.closure_hold(state, now) {
      debug!(hold_ms = left.as_millis() as u64, "Recovery held by recent closures");
      return None;
    }
    state.healthy = true;
    Some(HealthTransition::Recovered)
  }

  fn fire(&self, transition: Option<HealthTransition>) {
    let Some(transition) = transition else {
      return;
    };
    match transition {
      HealthTransition::Degraded(reason) => warn!(%reason, "Transport unhealthy"),
      HealthTransition::Recovered => info!("Transport healthy again"),
    }
    if let Some(callback) = &self.callback {
      callback(transition);
    }
  }
}

impl Default for HealthMonitor {
  fn default() -> Self {
    Self::new(HealthConfig::default())
  }
}

impl std::fmt::Debug for HealthMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HealthMonitor")
      .field("config", &self.config)
      .field("state", &*self.lock())
      .finish()
  }
}
