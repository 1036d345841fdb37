//! Mutation events and the transport they travel on.
//!
//! - [`entry`]: the captured change (`LogEntry`) and entity snapshots (`Node`)
//! - [`message`]: the bus wire unit (opaque body + metadata)
//! - [`bus`]: transport roles (topic, subscription, subscriber, emitter)
//! - [`pipe`]: same-process transport for tests/dev
//! - [`emitter`]: tenant/event-name aware producer over any topic
//! - [`listener`]: receive → filter → dispatch loop

pub mod bus;
pub mod emitter;
pub mod entry;
pub mod listener;
pub mod message;
pub mod pipe;

pub use bus::{BusError, Emitter, Subscriber, Subscription, Topic};
pub use emitter::TopicEmitter;
pub use entry::{Edge, EntryError, Field, LogEntry, Node, Op, MUTATION_EVENT};
pub use listener::{EventHandler, Listener, ListenerConfig, ListenerError, ListenerStats, StatsSnapshot};
pub use message::{Acker, Message, MESSAGE_ID_KEY, NAME_KEY, TENANT_KEY};
pub use pipe::{Pipe, PipeSubscription};
