//! One push channel per scope, shared by every listener of that scope.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dedup::{DedupRecord, DEFAULT_CLEAR_INTERVAL};
use crate::cache::CacheStore;
use crate::cleanup::panic_message;
use crate::message::InvalidationMessage;
use crate::transport::{Channel, ChannelEvent, ChannelId, ChannelStatus, PushTransport};

/// Callback invoked with every new invalidation message of a scope.
pub type Listener = Arc<dyn Fn(&InvalidationMessage) -> Result<()> + Send + Sync>;

/// Identity of a registered listener, derived from its allocation.
///
/// Registering the same `Arc` twice yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
  pub fn of(listener: &Listener) -> Self {
    Self(Arc::as_ptr(listener) as *const () as usize)
  }
}

/// A status change observed on a scope's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
  pub scope: String,
  pub status: ChannelStatus,
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
  /// Channel name is this prefix followed by the scope
  pub channel_prefix: String,
  /// Broadcast event name carrying invalidations
  pub event_name: String,
  /// Fixed delay before reopening a failed channel
  pub reconnect_delay: Duration,
  /// How often the processed-message record is wiped
  pub dedup_clear_interval: Duration,
  /// Origin under which endpoints may also be cached (e.g. `https://artb.art`)
  pub origin: Option<String>,
}

impl Default for SubscriptionConfig {
  fn default() -> Self {
    Self {
      channel_prefix: "cache_invalidate_".to_string(),
      event_name: "cache_invalidation".to_string(),
      reconnect_delay: Duration::from_secs(3),
      dedup_clear_interval: DEFAULT_CLEAR_INTERVAL,
      origin: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
  pub subscriptions: usize,
  pub listeners: usize,
  pub dedup_records: usize,
}

struct ScopeEntry {
  listeners: Vec<(ListenerId, Listener)>,
  channel: Option<ChannelId>,
  /// Identifies the current connection attempt; stale pumps and retries compare against it
  generation: u64,
  /// Message pump or pending retry
  task: Option<JoinHandle<()>>,
}

impl ScopeEntry {
  fn new() -> Self {
    Self {
      listeners: Vec::new(),
      channel: None,
      generation: 0,
      task: None,
    }
  }
}

struct Inner {
  transport: Arc<dyn PushTransport>,
  cache: Arc<CacheStore>,
  config: SubscriptionConfig,
  scopes: Mutex<HashMap<String, ScopeEntry>>,
  dedup: Mutex<DedupRecord>,
  status_tx: broadcast::Sender<StatusEvent>,
  generations: AtomicU64,
}

/// Owns the push channels and fans validated invalidations out to listeners.
///
/// Cheap to clone; clones share the same channels. Methods that open
/// channels must be called from within a tokio runtime.
#[derive(Clone)]
pub struct SubscriptionManager {
  inner: Arc<Inner>,
}

static GLOBAL: OnceLock<SubscriptionManager> = OnceLock::new();

impl SubscriptionManager {
  pub fn new(
    transport: Arc<dyn PushTransport>,
    cache: Arc<CacheStore>,
    config: SubscriptionConfig,
  ) -> Self {
    let (status_tx, _) = broadcast::channel(64);
    Self {
      inner: Arc::new(Inner {
        transport,
        cache,
        dedup: Mutex::new(DedupRecord::new(config.dedup_clear_interval)),
        config,
        scopes: Mutex::new(HashMap::new()),
        status_tx,
        generations: AtomicU64::new(0),
      }),
    }
  }

  /// Install the process-wide manager backed by [`CacheStore::global`].
  ///
  /// The first call wins; later calls return the existing manager and
  /// ignore their arguments.
  pub fn install_global(
    transport: Arc<dyn PushTransport>,
    config: SubscriptionConfig,
  ) -> &'static SubscriptionManager {
    GLOBAL.get_or_init(|| {
      info!("Installing global subscription manager");
      SubscriptionManager::new(transport, CacheStore::global(), config)
    })
  }

  pub fn global() -> Option<&'static SubscriptionManager> {
    GLOBAL.get()
  }

  pub fn cache(&self) -> &Arc<CacheStore> {
    &self.inner.cache
  }

  pub fn config(&self) -> &SubscriptionConfig {
    &self.inner.config
  }

  /// Channel name used for a scope.
  pub fn channel_name(&self, scope: &str) -> String {
    self.inner.channel_name(scope)
  }

  /// Register `listener` for `scope`, opening the scope's channel if needed.
  pub fn subscribe(&self, scope: &str, listener: Listener) -> ListenerId {
    let id = ListenerId::of(&listener);
    let mut scopes = self.inner.lock_scopes();
    let entry = scopes
      .entry(scope.to_string())
      .or_insert_with(ScopeEntry::new);

    if entry.listeners.iter().any(|(existing, _)| *existing == id) {
      debug!(scope, "Listener already registered");
      return id;
    }
    entry.listeners.push((id, listener));
    debug!(scope, listeners = entry.listeners.len(), "Added invalidation listener");

    if entry.channel.is_none() && entry.task.is_none() {
      self.inner.connect(scope, entry);
    }
    id
  }

  /// Remove a listener. The channel closes with the last listener.
  ///
  /// Returns whether the listener was registered.
  pub fn unsubscribe(&self, scope: &str, id: ListenerId) -> bool {
    let mut scopes = self.inner.lock_scopes();
    let Some(entry) = scopes.get_mut(scope) else {
      return false;
    };

    let before = entry.listeners.len();
    entry.listeners.retain(|(existing, _)| *existing != id);
    let removed = entry.listeners.len() != before;

    if entry.listeners.is_empty() {
      if let Some(mut entry) = scopes.remove(scope) {
        self.inner.disconnect(&mut entry);
        info!(scope, "Unsubscribed from scope");
      }
    }
    removed
  }

  /// Close and immediately reopen a scope's channel.
  pub fn reconnect(&self, scope: &str) -> bool {
    let mut scopes = self.inner.lock_scopes();
    match scopes.get_mut(scope) {
      Some(entry) if !entry.listeners.is_empty() => {
        self.inner.disconnect(entry);
        self.inner.connect(scope, entry);
        true
      }
      _ => false,
    }
  }

  /// Reconnect every scope that has listeners. Returns how many were reconnected.
  pub fn reconnect_all(&self) -> usize {
    let mut scopes = self.inner.lock_scopes();
    let mut count = 0;
    for (scope, entry) in scopes.iter_mut() {
      if entry.listeners.is_empty() {
        continue;
      }
      self.inner.disconnect(entry);
      self.inner.connect(scope, entry);
      count += 1;
    }
    info!(scopes = count, "Reconnected invalidation channels");
    count
  }

  /// Stream of channel status changes across all scopes.
  pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
    self.inner.status_tx.subscribe()
  }

  pub fn is_subscribed(&self, scope: &str) -> bool {
    self.inner.lock_scopes().contains_key(scope)
  }

  pub fn listener_count(&self, scope: &str) -> usize {
    self
      .inner
      .lock_scopes()
      .get(scope)
      .map(|entry| entry.listeners.len())
      .unwrap_or(0)
  }

  pub fn stats(&self) -> SubscriptionStats {
    let scopes = self.inner.lock_scopes();
    SubscriptionStats {
      subscriptions: scopes.len(),
      listeners: scopes.values().map(|entry| entry.listeners.len()).sum(),
      dedup_records: self.inner.lock_dedup().len(),
    }
  }
}

impl std::fmt::Debug for SubscriptionManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SubscriptionManager")
      .field("config", &self.inner.config)
      .finish_non_exhaustive()
  }
}

impl Inner {
  fn lock_scopes(&self) -> MutexGuard<'_, HashMap<String, ScopeEntry>> {
    self.scopes.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_dedup(&self) -> MutexGuard<'_, DedupRecord> {
    self.dedup.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn channel_name(&self, scope: &str) -> String {
    format!("{}{}", self.config.channel_prefix, scope)
  }

  /// Open the scope's channel and start its pump, or schedule a retry.
  fn connect(self: &Arc<Self>, scope: &str, entry: &mut ScopeEntry) {
    let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
    entry.generation = generation;

    let name = self.channel_name(scope);
    match self.transport.open_channel(&name, &self.config.event_name) {
      Ok(channel) => {
        info!(scope, channel = %channel.id, "Subscribed to invalidation channel");
        entry.channel = Some(channel.id);
        entry.task = Some(tokio::spawn(pump(
          Arc::downgrade(self),
          scope.to_string(),
          generation,
          channel,
        )));
      }
      Err(e) => {
        error!(scope, error = %e, "Failed to open invalidation channel");
        self.publish_status(scope, ChannelStatus::ChannelError);
        entry.channel = None;
        entry.task = Some(self.spawn_retry(scope, generation));
      }
    }
  }

  fn disconnect(&self, entry: &mut ScopeEntry) {
    if let Some(task) = entry.task.take() {
      task.abort();
    }
    if let Some(id) = entry.channel.take() {
      self.transport.close_channel(id);
    }
  }

  fn spawn_retry(self: &Arc<Self>, scope: &str, generation: u64) -> JoinHandle<()> {
    let inner = Arc::downgrade(self);
    let scope = scope.to_string();
    let delay = self.config.reconnect_delay;
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      if let Some(inner) = inner.upgrade() {
        inner.retry(&scope, generation);
      }
    })
  }

  fn retry(self: &Arc<Self>, scope: &str, generation: u64) {
    let mut scopes = self.lock_scopes();
    let Some(entry) = scopes.get_mut(scope) else {
      return;
    };
    if entry.generation != generation || entry.listeners.is_empty() {
      return;
    }
    info!(scope, "Retrying invalidation channel");
    // The retry task is the one running this; dropping its handle detaches it
    entry.task = None;
    self.connect(scope, entry);
  }

  /// Called by a pump whose channel failed. Replaces the pump with a retry.
  fn schedule_reconnect(self: &Arc<Self>, scope: &str, generation: u64, status: ChannelStatus) {
    let mut scopes = self.lock_scopes();
    let Some(entry) = scopes.get_mut(scope) else {
      return;
    };
    if entry.generation != generation {
      return;
    }
    warn!(
      scope,
      %status,
      delay_ms = self.config.reconnect_delay.as_millis() as u64,
      "Invalidation channel lost, will retry"
    );
    if let Some(id) = entry.channel.take() {
      self.transport.close_channel(id);
    }
    entry.task = Some(self.spawn_retry(scope, generation));
  }

  fn publish_status(&self, scope: &str, status: ChannelStatus) {
    debug!(scope, %status, "Channel status");
    // No receivers is fine
    let _ = self.status_tx.send(StatusEvent {
      scope: scope.to_string(),
      status,
    });
  }

  fn handle_raw(&self, scope: &str, raw: &Value) {
    match InvalidationMessage::from_raw(scope, raw) {
      Ok(message) => self.dispatch(message),
      Err(e) => warn!(scope, error = %e, "Dropping malformed invalidation message"),
    }
  }

  fn dispatch(&self, message: InvalidationMessage) {
    let scope = message.scope.as_str();
    if !self.lock_dedup().check_and_insert(&message.dedup_key()) {
      debug!(scope, timestamp = message.timestamp, "Skipping duplicate broadcast");
      return;
    }

    info!(
      scope,
      kind = %message.change_kind,
      endpoints = message.affected_keys.len(),
      "Broadcast received"
    );

    let origin = self.config.origin.as_deref();
    for key in &message.affected_keys {
      self.cache.invalidate_endpoint(key, origin);
    }

    let listeners: Vec<Listener> = self
      .lock_scopes()
      .get(scope)
      .map(|entry| entry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
      .unwrap_or_default();

    for listener in listeners {
      match catch_unwind(AssertUnwindSafe(|| listener(&message))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(scope, error = %e, "Invalidation listener failed"),
        Err(panic) => error!(
          scope,
          panic = %panic_message(panic.as_ref()),
          "Invalidation listener panicked"
        ),
      }
    }
  }
}

/// Drain one channel in delivery order until it fails or is aborted.
async fn pump(inner: Weak<Inner>, scope: String, generation: u64, mut channel: Channel) {
  while let Some(event) = channel.events.recv().await {
    let Some(inner) = inner.upgrade() else {
      return;
    };
    match event {
      ChannelEvent::Message(raw) => inner.handle_raw(&scope, &raw),
      ChannelEvent::Status(status) => {
        inner.publish_status(&scope, status);
        if status.needs_reconnect() {
          inner.schedule_reconnect(&scope, generation, status);
          return;
        }
      }
    }
  }

  // Transport dropped the stream without reporting a status
  if let Some(inner) = inner.upgrade() {
    inner.publish_status(&scope, ChannelStatus::Closed);
    inner.schedule_reconnect(&scope, generation, ChannelStatus::Closed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::LocalTransport;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  const EVENT: &str = "cache_invalidation";

  fn setup() -> (LocalTransport, SubscriptionManager) {
    let transport = LocalTransport::new();
    let manager = SubscriptionManager::new(
      Arc::new(transport.clone()),
      Arc::new(CacheStore::new()),
      SubscriptionConfig::default(),
    );
    (transport, manager)
  }

  fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = Arc::clone(counter);
    Arc::new(move |_msg: &InvalidationMessage| -> Result<()> {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    })
  }

  /// Let spawned pumps run.
  async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_duplicate_delivery_fans_out_once() {
    let (transport, manager) = setup();
    manager
      .cache()
      .put("E1", json!({"v": 1}), Duration::from_secs(30));

    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("evt-42", counting_listener(&calls));
    settle().await;

    let msg = json!({"scope": "evt-42", "type": "vote_cast", "endpoints": ["E1"], "timestamp": 1000});
    transport.broadcast("cache_invalidate_evt-42", EVENT, msg.clone());
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.cache().get("E1").is_none());

    transport.broadcast("cache_invalidate_evt-42", EVENT, msg);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.cache().get("E1").is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_typeless_affected_keys_delivered_once() {
    let (transport, manager) = setup();
    manager
      .cache()
      .put("E1", json!({"v": 1}), Duration::from_secs(30));
    manager
      .cache()
      .put("/live/event/evt-42", json!({"v": 2}), Duration::from_secs(30));

    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("evt-42", counting_listener(&calls));
    settle().await;

    let msg = json!({"scope": "evt-42", "affectedKeys": ["E1"], "timestamp": 1000});
    transport.broadcast("cache_invalidate_evt-42", EVENT, msg.clone());
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.cache().get("E1").is_none());

    transport.broadcast("cache_invalidate_evt-42", EVENT, msg);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(manager.cache().get("E1").is_none());
    // Only the listed keys are touched
    assert!(manager.cache().get("/live/event/evt-42").is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_listener_registered_once() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let listener = counting_listener(&calls);

    let first = manager.subscribe("s", Arc::clone(&listener));
    let second = manager.subscribe("s", listener);
    assert_eq!(first, second);
    assert_eq!(manager.listener_count("s"), 1);
    assert_eq!(transport.open_count(), 1);
    settle().await;

    transport.broadcast("cache_invalidate_s", EVENT, json!({"type": "vote_cast", "timestamp": 1}));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_channel_shared_and_closed_with_last_listener() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = manager.subscribe("s", counting_listener(&calls));
    let b = manager.subscribe("s", counting_listener(&calls));
    assert_eq!(transport.open_channels("cache_invalidate_s"), 1);

    assert!(manager.unsubscribe("s", a));
    assert_eq!(transport.open_channels("cache_invalidate_s"), 1);
    assert!(manager.is_subscribed("s"));

    assert!(manager.unsubscribe("s", b));
    assert_eq!(transport.open_channels("cache_invalidate_s"), 0);
    assert!(!manager.is_subscribed("s"));
    assert!(!manager.unsubscribe("s", b));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failing_listener_does_not_block_others() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));

    manager.subscribe(
      "s",
      Arc::new(|_: &InvalidationMessage| -> Result<()> { Err(eyre!("boom")) }),
    );
    manager.subscribe(
      "s",
      Arc::new(|_: &InvalidationMessage| -> Result<()> { panic!("listener bug") }),
    );
    manager.subscribe("s", counting_listener(&calls));
    settle().await;

    transport.broadcast("cache_invalidate_s", EVENT, json!({"type": "vote_cast", "timestamp": 5}));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_malformed_message_dropped_and_loop_continues() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("s", counting_listener(&calls));
    settle().await;

    transport.broadcast("cache_invalidate_s", EVENT, json!("garbage"));
    transport.broadcast("cache_invalidate_s", EVENT, json!({"type": "vote_cast", "timestamp": 9}));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_channel_error_reconnects_after_delay() {
    let (transport, manager) = setup();
    let mut statuses = manager.status_events();
    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("s", counting_listener(&calls));
    settle().await;
    assert_eq!(statuses.recv().await.unwrap().status, ChannelStatus::Subscribed);

    transport.send_status("cache_invalidate_s", ChannelStatus::ChannelError);
    settle().await;
    assert_eq!(statuses.recv().await.unwrap().status, ChannelStatus::ChannelError);
    assert_eq!(transport.open_channels("cache_invalidate_s"), 0);

    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(transport.open_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.open_channels("cache_invalidate_s"), 1);

    // Still delivering on the new channel
    transport.broadcast("cache_invalidate_s", EVENT, json!({"type": "vote_cast", "timestamp": 77}));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_failures_retried_indefinitely() {
    let (transport, manager) = setup();
    transport.fail_next_opens(3);
    manager.subscribe("s", counting_listener(&Arc::new(AtomicUsize::new(0))));
    assert_eq!(transport.open_count(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(transport.open_channels("cache_invalidate_s"), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_no_retry_after_unsubscribe() {
    let (transport, manager) = setup();
    transport.fail_next_opens(1);
    let id = manager.subscribe("s", counting_listener(&Arc::new(AtomicUsize::new(0))));
    manager.unsubscribe("s", id);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.open_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_all() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("a", counting_listener(&calls));
    manager.subscribe("b", counting_listener(&calls));
    assert_eq!(transport.open_count(), 2);

    assert_eq!(manager.reconnect_all(), 2);
    assert_eq!(transport.open_count(), 4);
    assert_eq!(transport.open_channels("cache_invalidate_a"), 1);
    assert_eq!(transport.open_channels("cache_invalidate_b"), 1);
    assert!(!manager.reconnect("missing"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_origin_variants_invalidated() {
    let transport = LocalTransport::new();
    let manager = SubscriptionManager::new(
      Arc::new(transport.clone()),
      Arc::new(CacheStore::new()),
      SubscriptionConfig {
        origin: Some("https://artb.art".to_string()),
        ..Default::default()
      },
    );
    let url = "https://artb.art/live/event/E1/media";
    manager.cache().put(url, json!([]), Duration::from_secs(30));
    manager.subscribe("E1", counting_listener(&Arc::new(AtomicUsize::new(0))));
    settle().await;

    transport.broadcast(
      "cache_invalidate_E1",
      EVENT,
      json!({"payload": {"type": "media_updated", "endpoints": ["/live/event/E1/media"], "timestamp": 3}}),
    );
    settle().await;
    assert!(manager.cache().get(url).is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stats() {
    let (transport, manager) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    manager.subscribe("a", counting_listener(&calls));
    manager.subscribe("a", counting_listener(&calls));
    manager.subscribe("b", counting_listener(&calls));
    settle().await;
    transport.broadcast("cache_invalidate_a", EVENT, json!({"type": "vote_cast", "timestamp": 1}));
    settle().await;

    assert_eq!(
      manager.stats(),
      SubscriptionStats {
        subscriptions: 2,
        listeners: 3,
        dedup_records: 1,
      }
    );
  }
}
