//! Invalidation messages delivered over the push transport.
//!
//! The wire payload is separate from the domain type so the raw shape can
//! stay permissive (nested envelopes, missing fields) while the rest of the
//! crate works with a validated [`InvalidationMessage`].

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::EndpointKey;

/// What changed on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
  VoteCast,
  BidPlaced,
  ArtUpdated,
  MediaUpdated,
  ArtistsUpdated,
  RoundContestantsUpdated,
  PaymentMade,
  ArtworkPurchased,
  DepositPaid,
  AuctionOpened,
  AuctionClosed,
  AuctionExtended,
  TimerUpdated,
  WinnerAnnounced,
  WinnerUpdated,
  RoundWinnerSet,
  RoundChanged,
  EventStatusUpdated,
  #[serde(untagged)]
  Other(String),
}

impl ChangeKind {
  pub fn parse(raw: &str) -> Self {
    serde_json::from_value(Value::String(raw.to_string()))
      .unwrap_or_else(|_| ChangeKind::Other(raw.to_string()))
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::VoteCast => "vote_cast",
      Self::BidPlaced => "bid_placed",
      Self::ArtUpdated => "art_updated",
      Self::MediaUpdated => "media_updated",
      Self::ArtistsUpdated => "artists_updated",
      Self::RoundContestantsUpdated => "round_contestants_updated",
      Self::PaymentMade => "payment_made",
      Self::ArtworkPurchased => "artwork_purchased",
      Self::DepositPaid => "deposit_paid",
      Self::AuctionOpened => "auction_opened",
      Self::AuctionClosed => "auction_closed",
      Self::AuctionExtended => "auction_extended",
      Self::TimerUpdated => "timer_updated",
      Self::WinnerAnnounced => "winner_announced",
      Self::WinnerUpdated => "winner_updated",
      Self::RoundWinnerSet => "round_winner_set",
      Self::RoundChanged => "round_changed",
      Self::EventStatusUpdated => "event_status_updated",
      Self::Other(raw) => raw,
    }
  }
}

impl std::fmt::Display for ChangeKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A validated notice that some cache keys of a scope are stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationMessage {
  pub scope: String,
  pub change_kind: ChangeKind,
  /// Endpoint keys to invalidate, in broadcast order
  pub affected_keys: Vec<String>,
  /// Server timestamp in epoch milliseconds, or receipt time if the server sent none
  pub timestamp: i64,
}

impl InvalidationMessage {
  /// Build a message from a raw broadcast payload.
  ///
  /// Accepts both `{type, endpoints, timestamp}` and the same object nested
  /// under `payload`. The key list may also be named `affectedKeys`. When it
  /// is missing the affected keys are derived from the change kind. A
  /// missing `type` becomes an empty [`ChangeKind::Other`].
  pub fn from_raw(scope: &str, raw: &Value) -> Result<Self> {
    let body = match raw.get("payload") {
      Some(inner) if inner.is_object() => inner,
      _ => raw,
    };

    let wire: WireMessage = serde_json::from_value(body.clone())
      .map_err(|e| eyre!("Malformed invalidation payload for {}: {}", scope, e))?;

    let change_kind = match wire.kind.as_deref() {
      Some(kind) if !kind.is_empty() => ChangeKind::parse(kind),
      _ => ChangeKind::Other(String::new()),
    };

    let affected_keys = match wire.endpoints {
      Some(endpoints) => endpoints,
      None => EndpointKey::for_change(&change_kind, scope)
        .iter()
        .map(EndpointKey::path)
        .collect(),
    };

    Ok(Self {
      scope: scope.to_string(),
      change_kind,
      affected_keys,
      timestamp: wire
        .timestamp
        .unwrap_or_else(|| Utc::now().timestamp_millis()),
    })
  }

  /// Composite key used for duplicate detection.
  pub fn dedup_key(&self) -> String {
    format!("{}-{}", self.scope, self.timestamp)
  }
}

/// Broadcast body as emitted by the database trigger.
#[derive(Debug, Deserialize)]
struct WireMessage {
  #[serde(rename = "type")]
  kind: Option<String>,
  #[serde(alias = "affectedKeys", alias = "affected_keys")]
  endpoints: Option<Vec<String>>,
  #[serde(default, deserialize_with = "deserialize_timestamp")]
  timestamp: Option<i64>,
}

/// Timestamps arrive as integers, floats, or numeric strings depending on the emitter.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let value = Option::<Value>::deserialize(deserializer)?;
  Ok(match value {
    Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Some(Value::String(s)) => s.trim().parse().ok(),
    _ => None,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_flat_payload() {
    let raw = json!({"type": "bid_placed", "endpoints": ["/live/event/E1-1-2/bids"], "timestamp": 1000});
    let msg = InvalidationMessage::from_raw("E1", &raw).unwrap();

    assert_eq!(msg.scope, "E1");
    assert_eq!(msg.change_kind, ChangeKind::BidPlaced);
    assert_eq!(msg.affected_keys, vec!["/live/event/E1-1-2/bids"]);
    assert_eq!(msg.timestamp, 1000);
    assert_eq!(msg.dedup_key(), "E1-1000");
  }

  #[test]
  fn test_parse_nested_payload() {
    let raw = json!({
      "event": "cache_invalidation",
      "payload": {"type": "media_updated", "endpoints": [], "timestamp": "2500"}
    });
    let msg = InvalidationMessage::from_raw("E1", &raw).unwrap();

    assert_eq!(msg.change_kind, ChangeKind::MediaUpdated);
    assert!(msg.affected_keys.is_empty());
    assert_eq!(msg.timestamp, 2500);
  }

  #[test]
  fn test_missing_endpoints_derived_from_kind() {
    let raw = json!({"type": "art_updated", "timestamp": 7});
    let msg = InvalidationMessage::from_raw("E9", &raw).unwrap();
    assert_eq!(
      msg.affected_keys,
      vec!["/live/event/E9", "/live/event/E9/media"]
    );
  }

  #[test]
  fn test_missing_timestamp_uses_receipt_time() {
    let before = Utc::now().timestamp_millis();
    let msg = InvalidationMessage::from_raw("E1", &json!({"type": "vote_cast"})).unwrap();
    assert!(msg.timestamp >= before);
  }

  #[test]
  fn test_unknown_kind_is_kept() {
    let msg = InvalidationMessage::from_raw("E1", &json!({"type": "confetti"})).unwrap();
    assert_eq!(msg.change_kind, ChangeKind::Other("confetti".to_string()));
    assert_eq!(msg.change_kind.to_string(), "confetti");
  }

  #[test]
  fn test_typeless_payload_with_affected_keys() {
    let raw = json!({"scope": "evt-42", "affectedKeys": ["E1"], "timestamp": 1000});
    let msg = InvalidationMessage::from_raw("evt-42", &raw).unwrap();

    assert_eq!(msg.change_kind, ChangeKind::Other(String::new()));
    assert_eq!(msg.affected_keys, vec!["E1"]);
    assert_eq!(msg.dedup_key(), "evt-42-1000");

    let snake = json!({"affected_keys": ["E2"], "timestamp": 5});
    let msg = InvalidationMessage::from_raw("evt-42", &snake).unwrap();
    assert_eq!(msg.affected_keys, vec!["E2"]);
  }

  #[test]
  fn test_malformed_payloads_rejected() {
    assert!(InvalidationMessage::from_raw("E1", &json!("nope")).is_err());
    assert!(InvalidationMessage::from_raw("E1", &json!({"affectedKeys": "E1"})).is_err());
    assert!(InvalidationMessage::from_raw("E1", &json!({"type": "vote_cast", "endpoints": 4})).is_err());
  }
}
