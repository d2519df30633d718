use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::InvalidationMessage;
use crate::transport::ChannelStatus;
use crate::visibility::Visibility;

/// One line of the host feed read from stdin.
///
/// ```text
/// {"kind": "broadcast", "scope": "AB3028", "payload": {"type": "vote_cast", "timestamp": 1}}
/// {"kind": "status", "scope": "AB3028", "status": "CHANNEL_ERROR"}
/// {"kind": "visibility", "state": "background"}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
  Broadcast { scope: String, payload: Value },
  Status { scope: String, status: ChannelStatus },
  Visibility(Visibility),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FeedLine {
  Broadcast { scope: String, payload: Value },
  Status { scope: String, status: String },
  Visibility { state: String },
}

impl FeedEvent {
  pub fn parse(line: &str) -> Result<Self> {
    let parsed: FeedLine =
      serde_json::from_str(line).map_err(|e| eyre!("Invalid feed line: {}", e))?;

    match parsed {
      FeedLine::Broadcast { scope, payload } => Ok(Self::Broadcast { scope, payload }),
      FeedLine::Status { scope, status } => {
        let status = ChannelStatus::parse(&status)
          .ok_or_else(|| eyre!("Unknown channel status: {}", status))?;
        Ok(Self::Status { scope, status })
      }
      FeedLine::Visibility { state } => match state.to_ascii_lowercase().as_str() {
        "foreground" | "visible" => Ok(Self::Visibility(Visibility::Foreground)),
        "background" | "hidden" => Ok(Self::Visibility(Visibility::Background)),
        _ => Err(eyre!("Unknown visibility state: {}", state)),
      },
    }
  }
}

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Line from the host feed
  Feed(FeedEvent),
  /// Coalesced invalidation for the watched scope
  Invalidated(InvalidationMessage),
  /// Periodic tick for status reporting
  Tick,
  /// The feed reached end of input
  InputClosed,
}

/// Event handler that produces events from the feed, a tick timer and
/// in-process senders
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Read the feed from stdin, ticking at `tick_rate`
  pub fn new(tick_rate: Duration) -> Self {
    Self::from_reader(BufReader::new(tokio::io::stdin()), tick_rate)
  }

  pub fn from_reader<R>(reader: R, tick_rate: Duration) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn feed reader
    let feed_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = reader.lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match FeedEvent::parse(&line) {
              Ok(event) => {
                if feed_tx.send(Event::Feed(event)).is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "Skipping feed line"),
            }
          }
          Ok(None) => {
            debug!("Feed closed");
            let _ = feed_tx.send(Event::InputClosed);
            break;
          }
          Err(e) => {
            warn!(error = %e, "Failed to read feed");
            let _ = feed_tx.send(Event::InputClosed);
            break;
          }
        }
      }
    });

    // Spawn ticker
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for events produced inside the process
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
