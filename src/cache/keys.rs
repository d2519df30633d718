//! Endpoint identifiers for live snapshot data.
//!
//! Cache keys are endpoint paths (`/live/event/AB3028/media`) or the same
//! path behind an origin (`https://host/live/event/AB3028/media`).

use url::Url;

use crate::message::ChangeKind;

/// Live snapshot endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointKey {
  /// Main event snapshot
  Event { eid: String },
  /// Event media
  Media { eid: String },
  /// Artists assigned to the event
  Artists { eid: String },
  /// Bids on one artwork (event, round, easel)
  Bids { eid: String, round: u32, easel: u32 },
  /// All bid endpoints of an event
  EventBids { eid: String },
}

impl EndpointKey {
  /// The endpoint path used as cache key.
  pub fn path(&self) -> String {
    match self {
      Self::Event { eid } => format!("/live/event/{}", eid),
      Self::Media { eid } => format!("/live/event/{}/media", eid),
      Self::Artists { eid } => format!("/live/event/{}/artists", eid),
      Self::Bids { eid, round, easel } => format!("/live/event/{}-{}-{}/bids", eid, round, easel),
      Self::EventBids { eid } => format!("/live/event/{}/bids", eid),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Event { eid } => format!("event {}", eid),
      Self::Media { eid } => format!("media for {}", eid),
      Self::Artists { eid } => format!("artists for {}", eid),
      Self::Bids { eid, round, easel } => {
        format!("bids for {} round {} easel {}", eid, round, easel)
      }
      Self::EventBids { eid } => format!("all bids for {}", eid),
    }
  }

  /// Path prefix shared by every endpoint of one event.
  pub fn scope_prefix(eid: &str) -> String {
    format!("/live/event/{}", eid)
  }

  /// Endpoints a change of the given kind makes stale.
  ///
  /// Used when a broadcast does not list its endpoints.
  pub fn for_change(kind: &ChangeKind, eid: &str) -> Vec<EndpointKey> {
    let eid = eid.to_string();
    match kind {
      ChangeKind::BidPlaced => vec![
        Self::Event { eid: eid.clone() },
        Self::EventBids { eid },
      ],
      ChangeKind::ArtUpdated => vec![Self::Event { eid: eid.clone() }, Self::Media { eid }],
      ChangeKind::MediaUpdated => vec![Self::Media { eid }],
      ChangeKind::ArtistsUpdated | ChangeKind::RoundContestantsUpdated => vec![
        Self::Event { eid: eid.clone() },
        Self::Artists { eid },
      ],
      // Everything else only touches the main event snapshot
      _ => vec![Self::Event { eid }],
    }
  }
}

/// Key variants under which an endpoint may be cached.
///
/// The relative path always comes first; the origin-prefixed form follows
/// when an origin is configured.
pub fn key_variants(endpoint: &str, origin: Option<&str>) -> Vec<String> {
  let mut variants = vec![endpoint.to_string()];
  if let Some(origin) = origin {
    if endpoint.starts_with('/') {
      variants.push(format!("{}{}", origin.trim_end_matches('/'), endpoint));
    }
  }
  variants
}

/// Path component of a cache key. Absolute URLs are reduced to their path.
pub fn key_path(key: &str) -> String {
  match Url::parse(key) {
    Ok(url) if url.has_host() => url.path().to_string(),
    _ => key.to_string(),
  }
}

/// Whether a cache key belongs to the scope with the given path prefix.
///
/// The prefix must end on a boundary so `/live/event/E1` does not claim
/// `/live/event/E10`.
pub fn matches_scope(key: &str, prefix: &str) -> bool {
  let path = key_path(key);
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with(['/', '-', '?']),
    None => false,
  }
}
