//! In-process transport.
//!
//! Used by the CLI to replay a feed and by tests as a transport double.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, ChannelEvent, ChannelId, ChannelStatus, PushTransport};

#[derive(Debug)]
struct LocalChannel {
  name: String,
  event: String,
  tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Debug, Default)]
struct LocalState {
  next_id: u64,
  channels: HashMap<ChannelId, LocalChannel>,
  /// Number of upcoming opens that should fail
  failing_opens: u32,
  opens: u64,
}

/// Transport that routes broadcasts between handles in the same process.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
  state: Arc<Mutex<LocalState>>,
}

impl LocalTransport {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, LocalState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Deliver a broadcast to every open channel with this name listening for `event`.
  ///
  /// Returns how many channels received it.
  pub fn broadcast(&self, name: &str, event: &str, payload: Value) -> usize {
    let state = self.lock();
    state
      .channels
      .values()
      .filter(|ch| ch.name == name && ch.event == event)
      .filter(|ch| ch.tx.send(ChannelEvent::Message(payload.clone())).is_ok())
      .count()
  }

  /// Report a status change on every open channel with this name.
  pub fn send_status(&self, name: &str, status: ChannelStatus) -> usize {
    let state = self.lock();
    state
      .channels
      .values()
      .filter(|ch| ch.name == name)
      .filter(|ch| ch.tx.send(ChannelEvent::Status(status)).is_ok())
      .count()
  }

  /// Make the next `count` calls to `open_channel` fail.
  pub fn fail_next_opens(&self, count: u32) {
    self.lock().failing_opens = count;
  }

  /// Total successful opens since creation.
  pub fn open_count(&self) -> u64 {
    self.lock().opens
  }

  /// Currently open channels with this name.
  pub fn open_channels(&self, name: &str) -> usize {
    self
      .lock()
      .channels
      .values()
      .filter(|ch| ch.name == name)
      .count()
  }
}

impl PushTransport for LocalTransport {
  fn open_channel(&self, name: &str, event: &str) -> Result<Channel> {
    let mut state = self.lock();
    if state.failing_opens > 0 {
      state.failing_opens -= 1;
      return Err(eyre!("Failed to open channel {}", name));
    }

    state.next_id += 1;
    state.opens += 1;
    let id = ChannelId(state.next_id);
    let (tx, rx) = mpsc::unbounded_channel();
    // Joining is immediate in-process
    let _ = tx.send(ChannelEvent::Status(ChannelStatus::Subscribed));
    state.channels.insert(
      id,
      LocalChannel {
        name: name.to_string(),
        event: event.to_string(),
        tx,
      },
    );
    debug!(channel = %id, name, event, "Opened local channel");

    Ok(Channel {
      id,
      name: name.to_string(),
      events: rx,
    })
  }

  fn close_channel(&self, id: ChannelId) {
    if self.lock().channels.remove(&id).is_some() {
      debug!(channel = %id, "Closed local channel");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_open_broadcast_close() {
    let transport = LocalTransport::new();
    let mut channel = transport.open_channel("room", "ping").unwrap();

    assert_eq!(
      channel.events.recv().await,
      Some(ChannelEvent::Status(ChannelStatus::Subscribed))
    );

    assert_eq!(transport.broadcast("room", "ping", json!(1)), 1);
    assert_eq!(transport.broadcast("room", "other", json!(2)), 0);
    assert_eq!(channel.events.recv().await, Some(ChannelEvent::Message(json!(1))));

    transport.close_channel(channel.id);
    assert_eq!(transport.open_channels("room"), 0);
    assert_eq!(channel.events.recv().await, None);
  }

  #[tokio::test]
  async fn test_failing_opens() {
    let transport = LocalTransport::new();
    transport.fail_next_opens(2);

    assert!(transport.open_channel("a", "e").is_err());
    assert!(transport.open_channel("a", "e").is_err());
    assert!(transport.open_channel("a", "e").is_ok());
    assert_eq!(transport.open_count(), 1);
  }
}
