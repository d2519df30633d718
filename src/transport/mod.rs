//! Push transport seam.
//!
//! The transport delivers broadcasts at least once, possibly duplicated and
//! possibly late, on named channels. A channel is an id plus a stream of
//! events that interleaves messages with status changes in arrival order.

mod local;

use color_eyre::Result;
use serde_json::Value;
use tokio::sync::mpsc;

pub use local::LocalTransport;

/// Opaque handle for an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ch-{}", self.0)
  }
}

/// Channel lifecycle states reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
  Subscribed,
  ChannelError,
  TimedOut,
  Closed,
}

impl ChannelStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Subscribed => "SUBSCRIBED",
      Self::ChannelError => "CHANNEL_ERROR",
      Self::TimedOut => "TIMED_OUT",
      Self::Closed => "CLOSED",
    }
  }

  pub fn parse(raw: &str) -> Option<Self> {
    match raw.trim().to_ascii_uppercase().as_str() {
      "SUBSCRIBED" => Some(Self::Subscribed),
      "CHANNEL_ERROR" => Some(Self::ChannelError),
      "TIMED_OUT" => Some(Self::TimedOut),
      "CLOSED" => Some(Self::Closed),
      _ => None,
    }
  }

  /// Whether the channel must be reopened after this status.
  pub fn needs_reconnect(&self) -> bool {
    !matches!(self, Self::Subscribed)
  }
}

impl std::fmt::Display for ChannelStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
  /// A broadcast for the event name the channel listens to
  Message(Value),
  Status(ChannelStatus),
}

/// An open channel. Dropping the receiver stops delivery but does not close the handle.
#[derive(Debug)]
pub struct Channel {
  pub id: ChannelId,
  pub name: String,
  pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Push-transport primitive used by the subscription manager.
pub trait PushTransport: Send + Sync + 'static {
  /// Open a channel and listen for broadcasts named `event` on it.
  fn open_channel(&self, name: &str, event: &str) -> Result<Channel>;

  /// Close a channel. Closing an unknown or already closed channel is a no-op.
  fn close_channel(&self, id: ChannelId);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_parse() {
    assert_eq!(ChannelStatus::parse("subscribed"), Some(ChannelStatus::Subscribed));
    assert_eq!(ChannelStatus::parse("CHANNEL_ERROR"), Some(ChannelStatus::ChannelError));
    assert_eq!(ChannelStatus::parse("closed "), Some(ChannelStatus::Closed));
    assert_eq!(ChannelStatus::parse("joining"), None);
  }

  #[test]
  fn test_needs_reconnect() {
    assert!(!ChannelStatus::Subscribed.needs_reconnect());
    assert!(ChannelStatus::ChannelError.needs_reconnect());
    assert!(ChannelStatus::TimedOut.needs_reconnect());
    assert!(ChannelStatus::Closed.needs_reconnect());
  }
}
