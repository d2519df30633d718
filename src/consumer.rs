//! Per-view glue over the shared cache and subscription manager.

use color_eyre::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{CacheStats, EndpointKey, DEFAULT_TTL};
use crate::cleanup::CleanupRegistry;
use crate::message::InvalidationMessage;
use crate::subscription::{Listener, ListenerId, SubscriptionManager};

/// View callback run after an invalidation.
pub type RefreshFn = Arc<dyn Fn(InvalidationMessage) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
  /// Quiet period before a burst of invalidations triggers one refresh
  pub coalesce_delay: Duration,
  /// When false, the refresh callback runs immediately for every message
  pub auto_refresh: bool,
  /// TTL used by `write` when none is given
  pub default_ttl: Duration,
}

impl Default for ConsumerConfig {
  fn default() -> Self {
    Self {
      coalesce_delay: Duration::from_secs(1),
      auto_refresh: true,
      default_ttl: DEFAULT_TTL,
    }
  }
}

#[derive(Default)]
struct ConsumerState {
  scope: Option<(String, ListenerId)>,
  pending: Option<JoinHandle<()>>,
  torn_down: bool,
}

impl ConsumerState {
  fn cancel_pending(&mut self) {
    if let Some(pending) = self.pending.take() {
      pending.abort();
    }
  }
}

/// Subscribes one view to one scope at a time and debounces its refreshes.
pub struct ConsumerAdapter {
  manager: SubscriptionManager,
  config: ConsumerConfig,
  on_refresh: RefreshFn,
  cleanup: CleanupRegistry,
  state: Arc<Mutex<ConsumerState>>,
}

impl ConsumerAdapter {
  pub fn new(manager: SubscriptionManager, config: ConsumerConfig, on_refresh: RefreshFn) -> Self {
    Self {
      manager,
      config,
      on_refresh,
      cleanup: CleanupRegistry::new(),
      state: Arc::new(Mutex::new(ConsumerState::default())),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ConsumerState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn scope(&self) -> Option<String> {
    self.lock().scope.as_ref().map(|(scope, _)| scope.clone())
  }

  pub fn is_subscribed(&self) -> bool {
    self.lock().scope.is_some()
  }

  /// Follow `scope`, or nothing when `None`. Re-setting the current scope is a no-op.
  pub fn set_scope(&self, scope: Option<&str>) {
    let mut state = self.lock();
    if state.torn_down {
      return;
    }
    let current = state.scope.as_ref().map(|(s, _)| s.as_str());
    if current == scope {
      return;
    }

    state.cancel_pending();
    if let Some((previous, id)) = state.scope.take() {
      info!(scope = %previous, "Leaving scope");
      self.manager.unsubscribe(&previous, id);
    }

    if let Some(scope) = scope {
      let id = self.manager.subscribe(scope, self.listener());
      state.scope = Some((scope.to_string(), id));
      info!(scope, "Following scope");
    }
  }

  fn listener(&self) -> Listener {
    let state = Arc::clone(&self.state);
    let on_refresh = Arc::clone(&self.on_refresh);
    let delay = self.config.coalesce_delay;
    let auto_refresh = self.config.auto_refresh;

    Arc::new(move |message: &InvalidationMessage| -> Result<()> {
      if !auto_refresh {
        if !lock_state(&state).torn_down {
          on_refresh(message.clone());
        }
        return Ok(());
      }

      let mut guard = lock_state(&state);
      if guard.torn_down {
        return Ok(());
      }
      guard.cancel_pending();

      let shared = Arc::clone(&state);
      let on_refresh = Arc::clone(&on_refresh);
      let message = message.clone();
      guard.pending = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        {
          let mut guard = lock_state(&shared);
          if guard.torn_down {
            return;
          }
          guard.pending = None;
        }
        debug!(scope = %message.scope, kind = %message.change_kind, "Coalesced refresh");
        on_refresh(message);
      }));
      Ok(())
    })
  }

  pub fn read(&self, key: &str) -> Option<Value> {
    self.manager.cache().get(key)
  }

  pub fn write(&self, key: &str, payload: Value, ttl: Option<Duration>) {
    self
      .manager
      .cache()
      .put(key, payload, ttl.unwrap_or(self.config.default_ttl));
  }

  /// Drop every cached endpoint of the current scope.
  pub fn clear_scope(&self) -> usize {
    match self.scope() {
      Some(scope) => self
        .manager
        .cache()
        .clear_scope(&EndpointKey::scope_prefix(&scope)),
      None => 0,
    }
  }

  pub fn stats(&self) -> CacheStats {
    self.manager.cache().stats()
  }

  /// Extra resources released on teardown.
  pub fn resources(&self) -> &CleanupRegistry {
    &self.cleanup
  }

  /// Cancel the pending refresh, unsubscribe, then release tracked resources.
  pub fn teardown(&self) {
    {
      let mut state = self.lock();
      if state.torn_down {
        return;
      }
      state.torn_down = true;
      state.cancel_pending();
      if let Some((scope, id)) = state.scope.take() {
        self.manager.unsubscribe(&scope, id);
        debug!(scope = %scope, "Consumer unsubscribed");
      }
    }
    self.cleanup.cleanup();
  }
}

impl Drop for ConsumerAdapter {
  fn drop(&mut self) {
    self.teardown();
  }
}

fn lock_state(state: &Mutex<ConsumerState>) -> MutexGuard<'_, ConsumerState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}
