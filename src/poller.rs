//! Fallback polling while push delivery is unreliable.
//!
//! Dormant until started. Each poll schedules the next only after it
//! completes, so polls never overlap.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cleanup::Closeable;

/// Refresh function run on every poll.
pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PollerConfig {
  pub enabled: bool,
  /// Interval while there was activity within `recent_window`
  pub fast_interval: Duration,
  /// Interval while there was activity within `idle_window`
  pub medium_interval: Duration,
  pub slow_interval: Duration,
  pub recent_window: Duration,
  pub idle_window: Duration,
  pub backoff_factor: f64,
  pub max_interval: Duration,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      fast_interval: Duration::from_secs(15),
      medium_interval: Duration::from_secs(30),
      slow_interval: Duration::from_secs(60),
      recent_window: Duration::from_secs(60),
      idle_window: Duration::from_secs(5 * 60),
      backoff_factor: 1.5,
      max_interval: Duration::from_secs(120),
    }
  }
}

impl PollerConfig {
  /// Interval for the next poll given the last recorded activity.
  pub fn adaptive_interval(&self, last_activity: Option<Instant>, now: Instant) -> Duration {
    match last_activity.map(|at| now.saturating_duration_since(at)) {
      Some(idle) if idle <= self.recent_window => self.fast_interval,
      Some(idle) if idle <= self.idle_window => self.medium_interval,
      _ => self.slow_interval,
    }
  }

  fn backoff(&self, interval: Duration) -> Duration {
    interval.mul_f64(self.backoff_factor).min(self.max_interval)
  }
}

/// Exists only while the poller is active.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerState {
  pub reason: String,
  pub interval: Duration,
  pub last_poll_at: Option<Instant>,
  pub consecutive_failures: u32,
}

struct Run {
  state: PollerState,
  generation: u64,
  task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
  run: Option<Run>,
  last_activity: Option<Instant>,
  generation: u64,
  disabled: bool,
}

struct Inner {
  config: PollerConfig,
  poll: PollFn,
  shared: Mutex<Shared>,
}

#[derive(Clone)]
pub struct FallbackPoller {
  inner: Arc<Inner>,
}

impl FallbackPoller {
  pub fn new(config: PollerConfig, poll: PollFn) -> Self {
    let shared = Shared {
      disabled: !config.enabled,
      ..Default::default()
    };
    Self {
      inner: Arc::new(Inner {
        config,
        poll,
        shared: Mutex::new(shared),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Shared> {
    self.inner.lock()
  }

  /// Begin polling immediately. Returns false when already active or disabled.
  pub fn start(&self, reason: &str) -> bool {
    let mut shared = self.lock();
    if shared.disabled {
      debug!(reason, "Poller disabled, not starting");
      return false;
    }
    if shared.run.is_some() {
      return false;
    }

    shared.generation += 1;
    let generation = shared.generation;
    let interval = self
      .inner
      .config
      .adaptive_interval(shared.last_activity, Instant::now());
    let task = tokio::spawn(run_loop(Arc::downgrade(&self.inner), generation));

    info!(reason, interval_ms = interval.as_millis() as u64, "Fallback polling started");
    shared.run = Some(Run {
      state: PollerState {
        reason: reason.to_string(),
        interval,
        last_poll_at: None,
        consecutive_failures: 0,
      },
      generation,
      task,
    });
    true
  }

  /// Stop polling. Returns false when already inactive.
  pub fn stop(&self) -> bool {
    let Some(run) = self.lock().run.take() else {
      return false;
    };
    run.task.abort();
    info!(reason = %run.state.reason, "Fallback polling stopped");
    true
  }

  /// Enable or disable the poller. Disabling stops an active loop.
  pub fn set_enabled(&self, enabled: bool) {
    self.lock().disabled = !enabled;
    if !enabled {
      self.stop();
    }
  }

  /// Record a successful refresh that happened outside the poller.
  pub fn record_activity(&self) {
    self.lock().last_activity = Some(Instant::now());
  }

  pub fn is_polling(&self) -> bool {
    self.lock().run.is_some()
  }

  pub fn state(&self) -> Option<PollerState> {
    self.lock().run.as_ref().map(|run| run.state.clone())
  }
}

impl Closeable for FallbackPoller {
  fn close(&mut self) -> Result<()> {
    self.stop();
    Ok(())
  }
}

impl std::fmt::Debug for FallbackPoller {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FallbackPoller")
      .field("config", &self.inner.config)
      .field("state", &self.state())
      .finish()
  }
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, Shared> {
    self.shared.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Record a poll outcome and return the delay before the next one, if
  /// the run that issued it is still current.
  fn complete(&self, generation: u64, result: Result<()>) -> Option<Duration> {
    let mut shared = self.lock();
    let now = Instant::now();
    if result.is_ok() {
      shared.last_activity = Some(now);
    }
    let last_activity = shared.last_activity;

    let run = shared.run.as_mut().filter(|run| run.generation == generation)?;
    run.state.last_poll_at = Some(now);
    match result {
      Ok(()) => {
        run.state.consecutive_failures = 0;
        run.state.interval = self.config.adaptive_interval(last_activity, now);
        debug!(interval_ms = run.state.interval.as_millis() as u64, "Poll succeeded");
      }
      Err(e) => {
        run.state.consecutive_failures += 1;
        run.state.interval = self.config.backoff(run.state.interval);
        warn!(
          error = %e,
          failures = run.state.consecutive_failures,
          interval_ms = run.state.interval.as_millis() as u64,
          "Poll failed, backing off"
        );
      }
    }
    Some(run.state.interval)
  }
}

async fn run_loop(inner: Weak<Inner>, generation: u64) {
  loop {
    let Some(poll) = inner.upgrade().map(|inner| Arc::clone(&inner.poll)) else {
      return;
    };
    let result = poll().await;

    let Some(delay) = inner
      .upgrade()
      .and_then(|inner| inner.complete(generation, result))
    else {
      return;
    };
    tokio::time::sleep(delay).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use futures::FutureExt;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  fn poll_fn(calls: &Arc<AtomicUsize>, fail: &Arc<AtomicBool>) -> PollFn {
    let calls = Arc::clone(calls);
    let fail = Arc::clone(fail);
    Arc::new(move || {
      calls.fetch_add(1, Ordering::SeqCst);
      let fail = fail.load(Ordering::SeqCst);
      async move {
        if fail {
          Err(eyre!("refresh failed"))
        } else {
          Ok(())
        }
      }
      .boxed()
    })
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_grows_and_caps() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(true));
    let poller = FallbackPoller::new(PollerConfig::default(), poll_fn(&calls, &fail));

    assert!(poller.start("errors"));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(90));

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(120));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(120));
    assert_eq!(poller.state().unwrap().consecutive_failures, 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_twice_single_loop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let poller = FallbackPoller::new(PollerConfig::default(), poll_fn(&calls, &fail));

    assert!(poller.start("errors"));
    assert!(!poller.start("errors"));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Successful poll counts as activity
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(15));
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_adaptive_interval() {
    let config = PollerConfig::default();
    let now = Instant::now();
    tokio::time::advance(Duration::from_secs(600)).await;
    let later = Instant::now();

    assert_eq!(config.adaptive_interval(None, later), Duration::from_secs(60));
    assert_eq!(
      config.adaptive_interval(Some(later - Duration::from_secs(30)), later),
      Duration::from_secs(15)
    );
    assert_eq!(
      config.adaptive_interval(Some(later - Duration::from_secs(120)), later),
      Duration::from_secs(30)
    );
    assert_eq!(config.adaptive_interval(Some(now), later), Duration::from_secs(60));
  }

  #[tokio::test(start_paused = true)]
  async fn test_recorded_activity_sets_initial_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(true));
    let poller = FallbackPoller::new(PollerConfig::default(), poll_fn(&calls, &fail));

    poller.record_activity();
    poller.start("rapid_reconnect");
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(15));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_prevents_further_polls() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let poller = FallbackPoller::new(PollerConfig::default(), poll_fn(&calls, &fail));

    poller.start("errors");
    settle().await;
    assert!(poller.stop());
    assert!(!poller.stop());
    assert!(!poller.is_polling());
    assert!(poller.state().is_none());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_disabled_never_starts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let poller = FallbackPoller::new(
      PollerConfig {
        enabled: false,
        ..Default::default()
      },
      poll_fn(&calls, &fail),
    );

    assert!(!poller.start("errors"));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    poller.set_enabled(true);
    assert!(poller.start("errors"));
    poller.set_enabled(false);
    assert!(!poller.is_polling());
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_poll_does_not_reschedule_after_stop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let poll: PollFn = Arc::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, color_eyre::Report>(())
      }
      .boxed()
    });
    let poller = FallbackPoller::new(PollerConfig::default(), poll);

    poller.start("errors");
    settle().await;
    poller.stop();
    poller.start("errors");
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    // Only the current run reschedules
    assert_eq!(poller.state().unwrap().interval, Duration::from_secs(15));
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
