//! Redis pub/sub backend (optional).
//!
//! Note: Redis pub/sub is not durable; messages published while no
//! subscriber is connected are dropped, and there is no redelivery, so
//! acknowledgement is a no-op.
//!
//! Wire frame: JSON `{"id", "metadata", "body"}` with a base64 body.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use redis::Commands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use fieldops_events::{BusError, MESSAGE_ID_KEY, Message, Subscriber, Subscription, Topic};

/// How often the reader thread checks for shutdown while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    body: String,
}

pub(crate) fn encode_frame(message: &Message) -> Result<String, BusError> {
    let frame = Frame {
        id: message.id().map(str::to_string),
        metadata: message.metadata.clone(),
        body: STANDARD.encode(&message.body),
    };
    serde_json::to_string(&frame).map_err(|e| BusError::Codec(e.to_string()))
}

pub(crate) fn decode_frame(payload: &str) -> Result<Message, BusError> {
    let frame: Frame = serde_json::from_str(payload).map_err(|e| BusError::Codec(e.to_string()))?;
    let body = STANDARD
        .decode(frame.body)
        .map_err(|e| BusError::Codec(e.to_string()))?;

    let mut message = Message::new(body);
    message.metadata = frame.metadata;
    if let Some(id) = frame.id {
        message.metadata.entry(MESSAGE_ID_KEY.to_string()).or_insert(id);
    }
    Ok(message)
}

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

/// Publishing side of a Redis channel.
#[derive(Debug)]
pub struct RedisTopic {
    client: redis::Client,
    channel: String,
    closed: AtomicBool,
}

impl RedisTopic {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url).map_err(transport)?,
            channel: channel.into(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Topic for RedisTopic {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let payload = encode_frame(&message)?;
        let client = self.client.clone();
        let channel = self.channel.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection().map_err(transport)?;
            let _receivers: i64 = conn.publish(&channel, payload).map_err(transport)?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Transport(format!("publish task failed: {e}")))?
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Opens subscriptions on a Redis channel.
#[derive(Debug, Clone)]
pub struct RedisSubscriber {
    client: redis::Client,
    channel: String,
}

impl RedisSubscriber {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        Ok(Self {
            client: redis::Client::open(redis_url).map_err(transport)?,
            channel: channel.into(),
        })
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let channel = self.channel.clone();
        let stop = Arc::clone(&closed);

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || read_loop(client, channel, stop, tx, ready_tx));

        ready_rx
            .await
            .map_err(|_| BusError::Transport("subscriber thread exited".to_string()))??;

        Ok(Box::new(RedisSubscription {
            receiver: rx,
            closed,
            done: false,
        }))
    }
}

fn read_loop(
    client: redis::Client,
    channel: String,
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Message>,
    ready: oneshot::Sender<Result<(), BusError>>,
) {
    let mut conn = match client.get_connection() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready.send(Err(transport(e)));
            return;
        }
    };

    let mut pubsub = conn.as_pubsub();
    let subscribed = pubsub
        .subscribe(&channel)
        .and_then(|_| pubsub.set_read_timeout(Some(POLL_INTERVAL)));
    if let Err(e) = subscribed {
        let _ = ready.send(Err(transport(e)));
        return;
    }
    if ready.send(Ok(())).is_err() {
        return;
    }
    debug!(channel = %channel, "redis subscription open");

    while !stop.load(Ordering::Acquire) {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(channel = %channel, error = %e, "redis subscription lost");
                return;
            }
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(channel = %channel, error = %e, "skipping non-text redis payload");
                continue;
            }
        };

        let message = match decode_frame(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(channel = %channel, error = %e, "skipping undecodable redis frame");
                continue;
            }
        };

        if tx.send(message).is_err() {
            return;
        }
    }
}

pub struct RedisSubscription {
    receiver: mpsc::UnboundedReceiver<Message>,
    closed: Arc<AtomicBool>,
    done: bool,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn receive(&mut self) -> Result<Message, BusError> {
        if self.done {
            return Err(BusError::Closed);
        }
        self.receiver.recv().await.ok_or(BusError::Closed)
    }

    async fn shutdown(&mut self) -> Result<(), BusError> {
        if self.done {
            return Err(BusError::Closed);
        }
        self.done = true;
        self.closed.store(true, Ordering::Release);
        self.receiver.close();
        Ok(())
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
