//! Tracks per-view resources so they can be released in one call.

use color_eyre::Result;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
  Subscription,
  Timer,
  Listener,
}

impl ResourceKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Subscription => "subscription",
      Self::Timer => "timer",
      Self::Listener => "listener",
    }
  }
}

/// Caller-supplied release function.
pub type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// Resources released through a `close` method.
pub trait Closeable: Send {
  fn close(&mut self) -> Result<()>;
}

enum Release {
  Teardown(Teardown),
  Timer(JoinHandle<()>),
}

struct Tracked {
  kind: ResourceKind,
  name: String,
  release: Release,
}

#[derive(Default)]
struct Resources {
  next_id: u64,
  entries: BTreeMap<u64, Tracked>,
}

/// Registry of releasable resources. Cheap to clone.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
  inner: Arc<Mutex<Resources>>,
}

/// Stops tracking a resource without releasing it.
#[must_use = "dropping an Untrack keeps the resource tracked"]
pub struct Untrack {
  registry: Weak<Mutex<Resources>>,
  id: u64,
}

impl Untrack {
  /// Returns whether the resource was still tracked.
  pub fn untrack(self) -> bool {
    let Some(registry) = self.registry.upgrade() else {
      return false;
    };
    let removed = lock(&registry).entries.remove(&self.id);
    removed.is_some()
  }
}

fn lock(resources: &Mutex<Resources>) -> MutexGuard<'_, Resources> {
  resources.lock().unwrap_or_else(|e| e.into_inner())
}

impl CleanupRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn track(&self, kind: ResourceKind, name: String, release: Release) -> Untrack {
    let mut resources = lock(&self.inner);
    resources.next_id += 1;
    let id = resources.next_id;
    debug!(kind = kind.as_str(), name = %name, "Tracking resource");
    resources.entries.insert(id, Tracked { kind, name, release });
    Untrack {
      registry: Arc::downgrade(&self.inner),
      id,
    }
  }

  pub fn track_subscription<F>(&self, name: &str, teardown: F) -> Untrack
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    self.track(
      ResourceKind::Subscription,
      name.to_string(),
      Release::Teardown(Box::new(teardown)),
    )
  }

  /// Track a subscription-like resource released by [`Closeable::close`].
  pub fn track_closeable<C>(&self, name: &str, mut resource: C) -> Untrack
  where
    C: Closeable + 'static,
  {
    self.track(
      ResourceKind::Subscription,
      name.to_string(),
      Release::Teardown(Box::new(move || resource.close())),
    )
  }

  /// Track a spawned timer task; release aborts it.
  pub fn track_timer(&self, name: &str, handle: JoinHandle<()>) -> Untrack {
    self.track(ResourceKind::Timer, name.to_string(), Release::Timer(handle))
  }

  /// Track an event-listener registration on `target` for `event`.
  pub fn track_listener<F>(&self, target: &str, event: &str, remove: F) -> Untrack
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    self.track(
      ResourceKind::Listener,
      format!("{}:{}", target, event),
      Release::Teardown(Box::new(remove)),
    )
  }

  pub fn active_count(&self, kind: ResourceKind) -> usize {
    lock(&self.inner)
      .entries
      .values()
      .filter(|tracked| tracked.kind == kind)
      .count()
  }

  pub fn total_active(&self) -> usize {
    lock(&self.inner).entries.len()
  }

  /// Release every tracked resource in registration order.
  ///
  /// Failures are logged and do not stop the remaining releases. Returns
  /// the number of resources that failed to release.
  pub fn cleanup(&self) -> usize {
    let entries = std::mem::take(&mut lock(&self.inner).entries);
    if entries.is_empty() {
      return 0;
    }

    let total = entries.len();
    let mut failed = 0;
    for tracked in entries.into_values() {
      let kind = tracked.kind.as_str();
      match tracked.release {
        Release::Timer(handle) => handle.abort(),
        Release::Teardown(teardown) => match catch_unwind(AssertUnwindSafe(teardown)) {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            failed += 1;
            warn!(kind, name = %tracked.name, error = %e, "Resource teardown failed");
          }
          Err(panic) => {
            failed += 1;
            error!(
              kind,
              name = %tracked.name,
              panic = %panic_message(panic.as_ref()),
              "Resource teardown panicked"
            );
          }
        },
      }
    }
    debug!(total, failed, "Released tracked resources");
    failed
  }
}

impl std::fmt::Debug for CleanupRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CleanupRegistry")
      .field("active", &self.total_active())
      .finish()
  }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "Unknown panic".to_string()
  }
}
