//! Receive → filter → dispatch loop bound to one subscription.
//!
//! Lifecycle: `Listener::new` (opens the subscription) → `listen` (message
//! loop) → `shutdown` (closes the subscription).
//!
//! Each message is acknowledged as soon as it is received; redelivery on
//! handler failure is therefore not provided here. A handler error ends the
//! loop: restarting a fresh listener is the caller's job.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{BusError, Subscriber, Subscription};

/// Receives filtered messages from a [`Listener`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, tenant: &str, name: &str, body: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, tenant: &str, name: &str, body: &[u8]) -> anyhow::Result<()> {
        (**self).handle(tenant, name, body).await
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener requires at least one event name")]
    NoEvents,

    #[error("opening subscription: {0}")]
    Subscribe(#[source] BusError),

    #[error("receiving message: {0}")]
    Receive(#[source] BusError),

    #[error("closing subscription: {0}")]
    Shutdown(#[source] BusError),

    #[error("handling {event} event for tenant {tenant}: {source}")]
    Handler {
        tenant: String,
        event: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("listener cancelled")]
    Cancelled,
}

/// Listener construction parameters.
pub struct ListenerConfig {
    pub subscriber: Arc<dyn Subscriber>,
    pub handler: Arc<dyn EventHandler>,
    /// Allow-list of event names; must not be empty.
    pub events: Vec<String>,
    /// When set, messages for other tenants are dropped.
    pub tenant: Option<String>,
}

/// Runtime counters of a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    running: AtomicBool,
    received: AtomicU64,
    acked: AtomicU64,
    dropped: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub running: bool,
    pub received: u64,
    pub acked: u64,
    pub dropped: u64,
    pub handled: u64,
    pub failed: u64,
}

impl ListenerStats {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.is_running(),
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Clears the running flag when `listen` ends, also on unwind or when the
/// future is dropped.
struct RunningGuard<'a>(&'a ListenerStats);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

pub struct Listener {
    subscription: Box<dyn Subscription>,
    handler: Arc<dyn EventHandler>,
    events: HashSet<String>,
    tenant: Option<String>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Validate the config and eagerly open the subscription.
    pub async fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
        if config.events.is_empty() {
            return Err(ListenerError::NoEvents);
        }

        let subscription = config
            .subscriber
            .subscribe()
            .await
            .map_err(ListenerError::Subscribe)?;

        Ok(Self {
            subscription,
            handler: config.handler,
            events: config.events.into_iter().collect(),
            tenant: config.tenant,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Shared handle to this listener's counters.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Process messages until the handler fails, the subscription errors or
    /// `token` is cancelled. Always returns an error describing why it stopped.
    pub async fn listen(&mut self, token: &CancellationToken) -> Result<(), ListenerError> {
        self.stats.running.store(true, Ordering::Release);
        let stats = Arc::clone(&self.stats);
        let _running = RunningGuard(&stats);
        self.run(token).await
    }

    async fn run(&mut self, token: &CancellationToken) -> Result<(), ListenerError> {
        loop {
            let mut msg = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ListenerError::Cancelled),
                received = self.subscription.receive() => received.map_err(ListenerError::Receive)?,
            };
            ListenerStats::incr(&self.stats.received);
            msg.ack();
            ListenerStats::incr(&self.stats.acked);

            let Some(tenant) = msg.tenant() else {
                warn!(message_id = ?msg.id(), "dropping message without tenant metadata");
                ListenerStats::incr(&self.stats.dropped);
                continue;
            };
            let Some(name) = msg.name() else {
                warn!(tenant, message_id = ?msg.id(), "dropping message without event name metadata");
                ListenerStats::incr(&self.stats.dropped);
                continue;
            };
            if !self.events.contains(name) {
                debug!(tenant, event = name, "dropping message for unregistered event");
                ListenerStats::incr(&self.stats.dropped);
                continue;
            }
            if self.tenant.as_deref().is_some_and(|t| t != tenant) {
                debug!(tenant, event = name, "dropping message for other tenant");
                ListenerStats::incr(&self.stats.dropped);
                continue;
            }

            if let Err(err) = self.handler.handle(tenant, name, &msg.body).await {
                error!(tenant, event = name, error = %format!("{err:#}"), "event handler failed");
                ListenerStats::incr(&self.stats.failed);
                return Err(ListenerError::Handler {
                    tenant: tenant.to_string(),
                    event: name.to_string(),
                    source: err.into(),
                });
            }
            ListenerStats::incr(&self.stats.handled);
        }
    }

    /// Close the underlying subscription.
    pub async fn shutdown(mut self) -> Result<(), ListenerError> {
        self.subscription
            .shutdown()
            .await
            .map_err(ListenerError::Shutdown)
    }
}
