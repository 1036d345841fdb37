//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes captured mutations from the process that performed
//! them to the processes that react to them (audit, change history, rule
//! triggers).
//!
//! ## Roles
//!
//! - [`Topic`]: raw producer side of a named topic (send a [`Message`])
//! - [`Subscriber`]: opens [`Subscription`]s on that topic
//! - [`Emitter`]: tenant/event-name aware producer built on a topic
//!
//! ## Delivery
//!
//! - **At-least-once** from the broker's point of view: consumers must
//!   tolerate duplicates.
//! - **No buffering before subscription**: a message published while no
//!   subscription is open may be lost (the in-process pipe never buffers).
//! - **Explicit closure**: once a topic or subscription is shut down, every
//!   further operation fails with [`BusError::Closed`] instead of blocking.
//!
//! The concrete backend (in-process pipe, Redis, ...) is chosen from a topic
//! URL at startup; see `fieldops_infra::event_bus`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::Message;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The topic or subscription was shut down.
    #[error("pubsub: closed")]
    Closed,

    /// The backend failed (network, broker, lock poisoning).
    #[error("pubsub transport error: {0}")]
    Transport(String),

    /// A message could not be encoded/decoded for the wire.
    #[error("pubsub codec error: {0}")]
    Codec(String),

    /// The topic URL names a backend this build does not provide.
    #[error("unsupported topic url scheme: {0}")]
    UnsupportedScheme(String),

    /// The topic URL could not be parsed.
    #[error("invalid topic url: {0}")]
    InvalidUrl(String),
}

/// Producer side of a topic.
#[async_trait]
pub trait Topic: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), BusError>;

    /// Close the topic. Later sends fail with [`BusError::Closed`].
    async fn shutdown(&self) -> Result<(), BusError>;
}

/// A single consumer's stream of messages.
///
/// Consumed by one task at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message.
    async fn receive(&mut self) -> Result<Message, BusError>;

    /// Close the subscription. Later receives fail with [`BusError::Closed`].
    async fn shutdown(&mut self) -> Result<(), BusError>;
}

/// Opens subscriptions on a topic.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BusError>;
}

/// Producer that stamps tenant and event name onto each message.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, tenant: &str, name: &str, body: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
impl<T> Topic for Arc<T>
where
    T: Topic + ?Sized,
{
    async fn send(&self, message: Message) -> Result<(), BusError> {
        (**self).send(message).await
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        (**self).shutdown().await
    }
}

#[async_trait]
impl<S> Subscriber for Arc<S>
where
    S: Subscriber + ?Sized,
{
    async fn subscribe(&self) -> Result<Box<dyn Subscription>, BusError> {
        (**self).subscribe().await
    }
}

#[async_trait]
impl<E> Emitter for Arc<E>
where
    E: Emitter + ?Sized,
{
    async fn emit(&self, tenant: &str, name: &str, body: Vec<u8>) -> Result<(), BusError> {
        (**self).emit(tenant, name, body).await
    }
}
