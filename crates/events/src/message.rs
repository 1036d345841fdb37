//! Bus wire unit.

use std::collections::HashMap;
use std::sync::Arc;

/// Metadata key carrying the tenant name.
pub const TENANT_KEY: &str = "tenant";

/// Metadata key carrying the event name.
pub const NAME_KEY: &str = "name";

/// Metadata key carrying the producer-assigned message id (UUIDv7).
pub const MESSAGE_ID_KEY: &str = "message_id";

/// Transport-specific acknowledgement.
pub trait Acker: Send + Sync {
    fn ack(&self);
}

/// Opaque payload plus string metadata.
#[derive(Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
    acker: Option<Arc<dyn Acker>>,
}

impl Message {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            metadata: HashMap::new(),
            acker: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the transport's acknowledgement for this delivery.
    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn tenant(&self) -> Option<&str> {
        self.metadata.get(TENANT_KEY).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.get(NAME_KEY).map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.metadata.get(MESSAGE_ID_KEY).map(String::as_str)
    }

    /// Acknowledge the delivery. Subsequent calls are no-ops.
    pub fn ack(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .field("acked", &self.acker.is_none())
            .finish()
    }
}
