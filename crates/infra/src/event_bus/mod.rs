//! Infrastructure event bus backends, selected by topic URL.
//!
//! The transport traits live in `fieldops-events` as pure mechanics. This
//! module maps a URL onto a backend:
//!
//! - `mem://<name>`: named in-process [`Pipe`]s shared through a [`Topics`]
//!   registry (tests/dev, single process)
//! - `redis://host[:port][/db]?topic=<channel>`: Redis pub/sub (feature
//!   `redis`)

#[cfg(feature = "redis")]
pub mod redis_pubsub;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fieldops_events::{BusError, Emitter, Pipe, Subscriber, Topic, TopicEmitter};

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisSubscriber, RedisTopic};

/// A parsed topic URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicUrl {
    Memory { name: String },
    Redis { url: String, channel: String },
}

impl TopicUrl {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| BusError::InvalidUrl(format!("missing scheme in '{raw}'")))?;

        match scheme {
            "mem" => {
                let name = rest.trim_end_matches('/');
                if name.is_empty() || name.contains(['/', '?']) {
                    return Err(BusError::InvalidUrl(format!("invalid in-memory topic '{raw}'")));
                }
                Ok(TopicUrl::Memory {
                    name: name.to_string(),
                })
            }
            "redis" | "rediss" => {
                let (base, query) = rest.split_once('?').unwrap_or((rest, ""));
                let mut channel = None;
                let mut kept = Vec::new();
                for pair in query.split('&').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some(("topic", value)) if !value.is_empty() => channel = Some(value.to_string()),
                        _ => kept.push(pair),
                    }
                }
                let channel = channel
                    .ok_or_else(|| BusError::InvalidUrl(format!("missing ?topic= in '{raw}'")))?;
                let mut url = format!("{scheme}://{base}");
                if !kept.is_empty() {
                    url.push('?');
                    url.push_str(&kept.join("&"));
                }
                Ok(TopicUrl::Redis { url, channel })
            }
            other => Err(BusError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Opens topics and subscribers by URL.
///
/// In-memory topics with the same name opened through the same registry
/// share one [`Pipe`]. Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct Topics {
    pipes: Arc<Mutex<HashMap<String, Pipe>>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The named in-process pipe, created on first use.
    pub fn pipe(&self, name: &str) -> Result<Pipe, BusError> {
        let mut pipes = self
            .pipes
            .lock()
            .map_err(|_| BusError::Transport("topic registry lock poisoned".to_string()))?;
        Ok(pipes.entry(name.to_string()).or_default().clone())
    }

    pub fn open_topic(&self, url: &str) -> Result<Arc<dyn Topic>, BusError> {
        match TopicUrl::parse(url)? {
            TopicUrl::Memory { name } => Ok(Arc::new(self.pipe(&name)?)),
            TopicUrl::Redis { url, channel } => open_redis_topic(&url, &channel),
        }
    }

    pub fn open_subscriber(&self, url: &str) -> Result<Arc<dyn Subscriber>, BusError> {
        match TopicUrl::parse(url)? {
            TopicUrl::Memory { name } => Ok(Arc::new(self.pipe(&name)?)),
            TopicUrl::Redis { url, channel } => open_redis_subscriber(&url, &channel),
        }
    }

    /// Emitter stamping tenant and event name onto messages sent to `url`.
    pub fn open_emitter(&self, url: &str) -> Result<Arc<dyn Emitter>, BusError> {
        Ok(Arc::new(TopicEmitter::new(self.open_topic(url)?)))
    }
}

#[cfg(feature = "redis")]
fn open_redis_topic(url: &str, channel: &str) -> Result<Arc<dyn Topic>, BusError> {
    Ok(Arc::new(RedisTopic::new(url, channel)?))
}

#[cfg(feature = "redis")]
fn open_redis_subscriber(url: &str, channel: &str) -> Result<Arc<dyn Subscriber>, BusError> {
    Ok(Arc::new(RedisSubscriber::new(url, channel)?))
}

#[cfg(not(feature = "redis"))]
fn open_redis_topic(_url: &str, _channel: &str) -> Result<Arc<dyn Topic>, BusError> {
    Err(BusError::UnsupportedScheme(
        "redis (built without the `redis` feature)".to_string(),
    ))
}

#[cfg(not(feature = "redis"))]
fn open_redis_subscriber(_url: &str, _channel: &str) -> Result<Arc<dyn Subscriber>, BusError> {
    Err(BusError::UnsupportedScheme(
        "redis (built without the `redis` feature)".to_string(),
    ))
}
