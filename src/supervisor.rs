//! Wires channel health, fallback polling and foreground reconnects for
//! one transport connection.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupRegistry;
use crate::health::{HealthConfig, HealthMonitor, HealthState, HealthTransition};
use crate::poller::FallbackPoller;
use crate::subscription::{StatusEvent, SubscriptionManager};
use crate::transport::ChannelStatus;
use crate::visibility::{VisibilityConfig, VisibilityState, VisibilityTrigger};

pub struct ConnectionSupervisor {
  health: Arc<HealthMonitor>,
  poller: FallbackPoller,
  resources: CleanupRegistry,
}

impl ConnectionSupervisor {
  /// Start supervising `manager`'s channels. Must be called from within a tokio runtime.
  ///
  /// Degradation starts `poller`, recovery stops it. When a visibility
  /// signal is given, regaining the foreground reconnects every channel.
  pub fn start(
    manager: &SubscriptionManager,
    health: HealthConfig,
    poller: FallbackPoller,
    visibility: Option<(watch::Receiver<VisibilityState>, VisibilityConfig)>,
  ) -> Self {
    let resources = CleanupRegistry::new();

    let on_transition = {
      let poller = poller.clone();
      Arc::new(move |transition: HealthTransition| match transition {
        HealthTransition::Degraded(reason) => {
          poller.start(reason.as_str());
        }
        HealthTransition::Recovered => {
          poller.stop();
        }
      })
    };
    let health = Arc::new(HealthMonitor::new(health).with_callback(on_transition));

    let events = manager.status_events();
    let monitor = Arc::clone(&health);
    let task = tokio::spawn(route_status(events, monitor));
    let _ = resources.track_subscription("status-events", move || {
      task.abort();
      Ok(())
    });

    if let Some((signal, config)) = visibility {
      let manager = manager.clone();
      let trigger = VisibilityTrigger::spawn(
        signal,
        config,
        Arc::new(move || {
          manager.reconnect_all();
        }),
      );
      let _ = resources.track_closeable("visibility", trigger);
    }
    let _ = resources.track_closeable("fallback-poller", poller.clone());

    info!("Connection supervisor started");
    Self {
      health,
      poller,
      resources,
    }
  }

  pub fn health(&self) -> HealthState {
    self.health.health()
  }

  pub fn monitor(&self) -> &HealthMonitor {
    &self.health
  }

  pub fn poller(&self) -> &FallbackPoller {
    &self.poller
  }

  pub fn is_polling(&self) -> bool {
    self.poller.is_polling()
  }

  /// Stop routing status events, the visibility trigger and the poller.
  pub fn shutdown(&self) {
    if self.resources.total_active() == 0 {
      return;
    }
    self.resources.cleanup();
    info!("Connection supervisor stopped");
  }
}

impl Drop for ConnectionSupervisor {
  fn drop(&mut self) {
    self.shutdown();
  }
}

async fn route_status(mut events: broadcast::Receiver<StatusEvent>, health: Arc<HealthMonitor>) {
  // Re-checks recovery once a rapid-reconnect hold expires
  let recheck = tokio::time::sleep(Duration::ZERO);
  tokio::pin!(recheck);
  let mut recheck_armed = false;

  loop {
    tokio::select! {
      event = events.recv() => match event {
        Ok(StatusEvent { scope, status }) => {
          debug!(scope = %scope, %status, "Routing channel status");
          match status {
            ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
              health.track_error(status.as_str())
            }
            ChannelStatus::Closed => health.track_closure(&scope),
            ChannelStatus::Subscribed => {
              health.track_recovery();
              if let Some(left) = health.recovery_hold_at(Instant::now()) {
                recheck.as_mut().reset(Instant::now() + left);
                recheck_armed = true;
              }
            }
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Status events lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return,
      },
      _ = &mut recheck, if recheck_armed => {
        recheck_armed = false;
        health.recheck_at(Instant::now());
      }
    }
  }
}
