use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::{CacheResult, EndpointKey};
use crate::config::Config;
use crate::consumer::ConsumerAdapter;
use crate::event::{Event, EventHandler, FeedEvent};
use crate::fetch::CachedFetch;
use crate::message::InvalidationMessage;
use crate::poller::{FallbackPoller, PollFn};
use crate::snapshot::SnapshotClient;
use crate::subscription::SubscriptionManager;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::LocalTransport;
use crate::visibility::{self, Visibility, VisibilitySender};

const TICK_RATE: Duration = Duration::from_millis(250);

/// Keeps a set of endpoints of one scope fresh while replaying a host feed.
pub struct App {
  scope: String,

  /// In-process transport fed from stdin
  transport: LocalTransport,

  manager: SubscriptionManager,

  /// One fetch helper per watched endpoint
  fetches: Vec<CachedFetch>,

  consumer: ConsumerAdapter,

  supervisor: ConnectionSupervisor,

  visibility: VisibilitySender,

  events: EventHandler,

  /// Time to keep running after the feed closes, for pending refreshes
  linger: Duration,

  /// Last health printed
  reported_healthy: bool,
}

impl App {
  pub fn new(config: Config, scope: &str, endpoints: Vec<String>) -> Result<Self> {
    let origin = config
      .origin()
      .ok_or_else(|| eyre!("No origin configured. Pass --origin or set it in livecache.yaml"))?;
    let client = SnapshotClient::new(&origin, config.cache.request_timeout())?;

    let transport = LocalTransport::new();
    let manager =
      SubscriptionManager::install_global(Arc::new(transport.clone()), config.subscription_config())
        .clone();

    let endpoints = if endpoints.is_empty() {
      vec![EndpointKey::Event {
        eid: scope.to_string(),
      }
      .path()]
    } else {
      endpoints
    };
    let fetches: Vec<CachedFetch> = endpoints
      .iter()
      .map(|endpoint| {
        CachedFetch::from_fn(endpoint, Arc::clone(manager.cache()), client.fetcher())
          .with_ttl(config.cache.ttl())
      })
      .collect();

    let events = EventHandler::new(TICK_RATE);
    let tx = events.sender();
    let consumer = ConsumerAdapter::new(
      manager.clone(),
      config.consumer_config(),
      Arc::new(move |message: InvalidationMessage| {
        let _ = tx.send(Event::Invalidated(message));
      }),
    );

    let poller = FallbackPoller::new(config.poller_config(), poll_fn(fetches.clone()));
    let (visibility, signal) = visibility::channel(Visibility::Foreground);
    let supervisor = ConnectionSupervisor::start(
      &manager,
      config.health_config(),
      poller,
      Some((signal, config.visibility_config())),
    );

    consumer.set_scope(Some(scope));
    info!(scope, origin = %origin, endpoints = fetches.len(), "Watching scope");

    Ok(Self {
      scope: scope.to_string(),
      transport,
      manager,
      fetches,
      consumer,
      supervisor,
      visibility,
      events,
      linger: config.consumer_config().coalesce_delay * 2,
      reported_healthy: true,
    })
  }

  pub async fn run(&mut self) -> Result<()> {
    for fetch in &self.fetches {
      match fetch.get_cached_or_fetch().await {
        Ok(result) => print_result(fetch.endpoint(), &result, None)?,
        Err(e) => warn!(endpoint = fetch.endpoint(), error = %e, "Initial fetch failed"),
      }
    }

    let mut closing_at: Option<Instant> = None;
    while let Some(event) = self.events.next().await {
      match event {
        Event::Feed(feed) => self.handle_feed(feed),
        Event::Invalidated(message) => self.refresh(&message).await?,
        Event::Tick => {
          self.report_health()?;
          if closing_at.is_some_and(|at| Instant::now() >= at) {
            break;
          }
        }
        Event::InputClosed => {
          info!("Feed closed, finishing pending refreshes");
          closing_at = Some(Instant::now() + self.linger);
        }
      }
    }

    self.shutdown();
    Ok(())
  }

  fn handle_feed(&self, feed: FeedEvent) {
    match feed {
      FeedEvent::Broadcast { scope, payload } => {
        let delivered = self.transport.broadcast(
          &self.manager.channel_name(&scope),
          &self.manager.config().event_name,
          payload,
        );
        if delivered == 0 {
          warn!(scope = %scope, "Broadcast for a scope nobody watches");
        }
      }
      FeedEvent::Status { scope, status } => {
        self
          .transport
          .send_status(&self.manager.channel_name(&scope), status);
      }
      FeedEvent::Visibility(state) => {
        self.visibility.set(state);
      }
    }
  }

  async fn refresh(&self, message: &InvalidationMessage) -> Result<()> {
    for fetch in &self.fetches {
      match fetch.fetch_data().await {
        Ok(result) => {
          if !result.is_stale() {
            self.supervisor.poller().record_activity();
          }
          print_result(fetch.endpoint(), &result, Some(message))?;
        }
        Err(e) => warn!(endpoint = fetch.endpoint(), error = %e, "Refresh failed"),
      }
    }
    Ok(())
  }

  fn report_health(&mut self) -> Result<()> {
    let healthy = self.supervisor.health().healthy;
    if healthy == self.reported_healthy {
      return Ok(());
    }
    self.reported_healthy = healthy;

    let line = json!({
      "scope": self.scope,
      "healthy": healthy,
      "polling": self.supervisor.is_polling(),
    });
    writeln!(std::io::stdout(), "{}", line)?;
    Ok(())
  }

  fn shutdown(&self) {
    self.consumer.teardown();
    self.supervisor.shutdown();
    let stats = self.consumer.stats();
    info!(
      entries = stats.total_entries,
      hits = stats.hits,
      misses = stats.misses,
      "Stopped watching"
    );
  }
}

/// Poll every watched endpoint; a stale fallback counts as a failed poll.
fn poll_fn(fetches: Vec<CachedFetch>) -> PollFn {
  Arc::new(move || {
    let fetches = fetches.clone();
    async move {
      for fetch in &fetches {
        let result = fetch.fetch_data().await?;
        if result.is_stale() {
          return Err(eyre!("Refresh of {} failed", fetch.endpoint()));
        }
      }
      Ok(())
    }
    .boxed()
  })
}

fn print_result(
  endpoint: &str,
  result: &CacheResult<serde_json::Value>,
  cause: Option<&InvalidationMessage>,
) -> Result<()> {
  let line = json!({
    "endpoint": endpoint,
    "source": result.source,
    "cached_at": result.cached_at,
    "change": cause.map(|m| m.change_kind.as_str()),
    "data": result.data,
  });
  writeln!(std::io::stdout(), "{}", line)?;
  Ok(())
}
