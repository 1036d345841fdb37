//! In-process pipe transport for tests/dev.
//!
//! - No IO
//! - Fan-out to every subscription open at send time
//! - No buffering for subscriptions opened later
//! - Shutdown closes the pipe for every emitter and subscriber attached to it

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusError, Subscriber, Subscription, Topic};
use crate::{Message, TopicEmitter};

#[derive(Debug, Default)]
struct PipeState {
    closed: bool,
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Message>)>,
}

/// Connects emitters directly to subscribers without a network hop.
///
/// Cloning yields another handle to the same pipe.
#[derive(Debug, Clone, Default)]
pub struct Pipe {
    state: Arc<Mutex<PipeState>>,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// An emitter publishing into this pipe.
    pub fn emitter(&self) -> TopicEmitter<Pipe> {
        TopicEmitter::new(self.clone())
    }

    /// Number of subscriptions currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    fn detach(&self, id: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

fn poisoned() -> BusError {
    BusError::Transport("pipe lock poisoned".to_string())
}

#[async_trait]
impl Topic for Pipe {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(BusError::Closed);
        }

        // Drop any dead subscriptions while sending.
        state
            .subscribers
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.closed = true;
        // Dropping the senders wakes every pending receive with `Closed`.
        state.subscribers.clear();
        Ok(())
    }
}

#[async_trait]
impl Subscriber for Pipe {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, tx));

        Ok(Box::new(PipeSubscription {
            id,
            pipe: self.clone(),
            receiver: rx,
            closed: false,
        }))
    }
}

/// A subscription attached to a [`Pipe`].
#[derive(Debug)]
pub struct PipeSubscription {
    id: u64,
    pipe: Pipe,
    receiver: mpsc::UnboundedReceiver<Message>,
    closed: bool,
}

#[async_trait]
impl Subscription for PipeSubscription {
    async fn receive(&mut self) -> Result<Message, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.receiver.recv().await.ok_or(BusError::Closed)
    }

    async fn shutdown(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.closed = true;
        self.receiver.close();
        self.pipe.detach(self.id);
        Ok(())
    }
}

impl Drop for PipeSubscription {
    fn drop(&mut self) {
        self.pipe.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Emitter, NAME_KEY, TENANT_KEY};

    #[tokio::test]
    async fn fans_out_to_every_open_subscription() {
        let pipe = Pipe::new();
        let mut a = pipe.subscribe().await.unwrap();
        let mut b = pipe.subscribe().await.unwrap();

        pipe.emitter().emit("acme", "entity.mutation", b"x".to_vec()).await.unwrap();

        for sub in [&mut a, &mut b] {
            let msg = sub.receive().await.unwrap();
            assert_eq!(msg.body, b"x");
            assert_eq!(msg.metadata.get(TENANT_KEY).map(String::as_str), Some("acme"));
            assert_eq!(msg.metadata.get(NAME_KEY).map(String::as_str), Some("entity.mutation"));
        }
    }

    #[tokio::test]
    async fn messages_sent_before_subscribing_are_lost() {
        let pipe = Pipe::new();
        pipe.send(Message::new(b"early".to_vec())).await.unwrap();

        let mut sub = pipe.subscribe().await.unwrap();
        pipe.send(Message::new(b"late".to_vec())).await.unwrap();

        assert_eq!(sub.receive().await.unwrap().body, b"late");
        let pending = tokio::time::timeout(Duration::from_millis(20), sub.receive()).await;
        assert!(pending.is_err(), "no further messages expected");
    }

    #[tokio::test]
    async fn shutdown_fails_later_operations_with_closed() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();

        pipe.shutdown().await.unwrap();

        assert_eq!(sub.receive().await.unwrap_err(), BusError::Closed);
        assert_eq!(
            pipe.send(Message::new(vec![])).await.unwrap_err(),
            BusError::Closed
        );
        assert!(matches!(pipe.subscribe().await, Err(BusError::Closed)));
        assert_eq!(
            pipe.emitter().emit("acme", "n", vec![]).await.unwrap_err(),
            BusError::Closed
        );
    }

    #[tokio::test]
    async fn shutdown_wakes_a_pending_receive() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();

        let waiter = tokio::spawn(async move { sub.receive().await });
        tokio::task::yield_now().await;
        pipe.shutdown().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap_err(), BusError::Closed);
    }

    #[tokio::test]
    async fn subscription_shutdown_detaches_it() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();
        assert_eq!(pipe.subscriber_count(), 1);

        sub.shutdown().await.unwrap();

        assert_eq!(pipe.subscriber_count(), 0);
        assert_eq!(sub.receive().await.unwrap_err(), BusError::Closed);
        assert_eq!(sub.shutdown().await.unwrap_err(), BusError::Closed);
    }
}
