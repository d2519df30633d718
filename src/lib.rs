//! Push-invalidated snapshot cache.
//!
//! A process-wide [`cache::CacheStore`] holds endpoint snapshots. The
//! [`subscription::SubscriptionManager`] listens for invalidation broadcasts
//! on one channel per scope and marks the affected entries stale. Consumers
//! refetch after a short coalescing delay. When the push transport degrades,
//! the [`supervisor::ConnectionSupervisor`] switches a fallback poller on
//! until it recovers.

pub mod app;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod consumer;
pub mod event;
pub mod fetch;
pub mod health;
pub mod logging;
pub mod message;
pub mod poller;
pub mod snapshot;
pub mod subscription;
pub mod supervisor;
pub mod transport;
pub mod visibility;
