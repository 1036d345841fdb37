//! Emitter stamping tenant, event name and message id onto outgoing
//! messages.

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::{BusError, Emitter, Topic};
use crate::{Message, MESSAGE_ID_KEY, NAME_KEY, TENANT_KEY};

/// [`Emitter`] over any [`Topic`].
///
/// Attaches the tenant, the event name and a fresh UUIDv7 message id as
/// message metadata; the body is passed through untouched.
#[derive(Debug, Clone)]
pub struct TopicEmitter<T> {
    topic: T,
}

impl<T> TopicEmitter<T> {
    pub fn new(topic: T) -> Self {
        Self { topic }
    }

    pub fn topic(&self) -> &T {
        &self.topic
    }
}

impl<T: Topic> TopicEmitter<T> {
    /// Close the underlying topic.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.topic.shutdown().await
    }
}

#[async_trait]
impl<T: Topic> Emitter for TopicEmitter<T> {
    async fn emit(&self, tenant: &str, name: &str, body: Vec<u8>) -> Result<(), BusError> {
        let message = Message::new(body)
            .with_metadata(TENANT_KEY, tenant)
            .with_metadata(NAME_KEY, name)
            .with_metadata(MESSAGE_ID_KEY, Uuid::now_v7().to_string());

        tracing::trace!(tenant, event = name, "emitting message");
        self.topic.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Pipe, Subscriber};

    #[tokio::test]
    async fn stamps_message_id() {
        let pipe = Pipe::new();
        let mut sub = pipe.subscribe().await.unwrap();

        pipe.emitter().emit("acme", "entity.mutation", vec![1]).await.unwrap();
        pipe.emitter().emit("acme", "entity.mutation", vec![2]).await.unwrap();

        let first = sub.receive().await.unwrap();
        let second = sub.receive().await.unwrap();
        assert!(first.id().is_some());
        assert_ne!(first.id(), second.id());
    }
}
