//! Reconnect when the host comes back to the foreground.

use color_eyre::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cleanup::Closeable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
  #[default]
  Foreground,
  Background,
}

#[derive(Debug, Clone)]
pub struct VisibilityConfig {
  /// Minimum time between two triggered reconnects
  pub debounce: Duration,
  /// Delay between the foreground transition and the reconnect
  pub settle_delay: Duration,
}

impl Default for VisibilityConfig {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(2),
      settle_delay: Duration::from_millis(100),
    }
  }
}

/// Latest visibility plus how many times the host entered the foreground.
///
/// `watch` keeps only the newest value, so a background and foreground
/// pair sent back to back collapses into one update. The counter still
/// records the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisibilityState {
  pub current: Visibility,
  pub foregrounds: u64,
}

/// Host side of a visibility signal.
#[derive(Debug)]
pub struct VisibilitySender {
  tx: watch::Sender<VisibilityState>,
}

impl VisibilitySender {
  /// Record the host's visibility. Entering the foreground bumps the counter.
  pub fn set(&self, visibility: Visibility) {
    self.tx.send_modify(|state| {
      if visibility == Visibility::Foreground && state.current != Visibility::Foreground {
        state.foregrounds += 1;
      }
      state.current = visibility;
    });
  }

  pub fn current(&self) -> Visibility {
    self.tx.borrow().current
  }
}

/// Create a visibility signal starting at `initial`.
pub fn channel(initial: Visibility) -> (VisibilitySender, watch::Receiver<VisibilityState>) {
  let (tx, rx) = watch::channel(VisibilityState {
    current: initial,
    foregrounds: 0,
  });
  (VisibilitySender { tx }, rx)
}

pub type ReconnectFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TriggerState {
  last_triggered: Option<Instant>,
  pending: Option<JoinHandle<()>>,
  observer: Option<JoinHandle<()>>,
  torn_down: bool,
}

/// Watches a visibility signal and requests a reconnect on foreground.
pub struct VisibilityTrigger {
  config: VisibilityConfig,
  on_reconnect: ReconnectFn,
  state: Arc<Mutex<TriggerState>>,
}

impl VisibilityTrigger {
  /// Start observing `signal`. Must be called from within a tokio runtime.
  pub fn spawn(
    mut signal: watch::Receiver<VisibilityState>,
    config: VisibilityConfig,
    on_reconnect: ReconnectFn,
  ) -> Arc<Self> {
    let trigger = Arc::new(Self {
      config,
      on_reconnect,
      state: Arc::new(Mutex::new(TriggerState::default())),
    });

    let weak = Arc::downgrade(&trigger);
    // Baseline taken before the task first runs
    let mut seen = signal.borrow_and_update().foregrounds;
    let observer = tokio::spawn(async move {
      while signal.changed().await.is_ok() {
        let foregrounds = signal.borrow_and_update().foregrounds;
        if foregrounds == seen {
          continue;
        }
        seen = foregrounds;
        match weak.upgrade() {
          Some(trigger) => trigger.on_foreground(),
          None => return,
        }
      }
    });
    trigger.lock().observer = Some(observer);
    trigger
  }

  fn lock(&self) -> MutexGuard<'_, TriggerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn on_foreground(&self) {
    let mut state = self.lock();
    if state.torn_down {
      return;
    }
    if state.pending.is_some() {
      debug!("Foreground while reconnect pending, ignoring");
      return;
    }
    if let Some(last) = state.last_triggered {
      if last.elapsed() < self.config.debounce {
        debug!("Foreground within debounce window, ignoring");
        return;
      }
    }

    let shared = Arc::clone(&self.state);
    let on_reconnect = Arc::clone(&self.on_reconnect);
    let delay = self.config.settle_delay;
    state.pending = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      {
        let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
        if state.torn_down {
          return;
        }
        state.last_triggered = Some(Instant::now());
        state.pending = None;
      }
      info!("Foreground regained, reconnecting");
      on_reconnect();
    }));
  }

  pub fn last_triggered(&self) -> Option<Instant> {
    self.lock().last_triggered
  }

  /// Stop observing and cancel a pending reconnect.
  pub fn teardown(&self) {
    let mut state = self.lock();
    if state.torn_down {
      return;
    }
    state.torn_down = true;
    if let Some(pending) = state.pending.take() {
      pending.abort();
    }
    if let Some(observer) = state.observer.take() {
      observer.abort();
    }
    debug!("Visibility trigger torn down");
  }
}

impl Closeable for Arc<VisibilityTrigger> {
  fn close(&mut self) -> Result<()> {
    self.teardown();
    Ok(())
  }
}

impl Drop for VisibilityTrigger {
  fn drop(&mut self) {
    self.teardown();
  }
}
