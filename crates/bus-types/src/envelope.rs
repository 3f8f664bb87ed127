//! # Message Envelope
//!
//! The unit a broker-backed transport hands to the broker channel.
//!
//! ## Properties
//!
//! - **Identity**: Every send carries a fresh `message_id`, independent of the
//!   event id, so broker-level deduplication works across republishes.
//! - **Routing**: `routing_key` is the normalized event key.
//! - **Opaque body**: The body is the serializer's output; the envelope never
//!   interprets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A serialized event ready to be sent to a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique id of this send.
    pub message_id: Uuid,
    /// Time the envelope was created (UTC).
    pub timestamp: DateTime<Utc>,
    /// Normalized event key used as the routing key.
    pub routing_key: String,
    /// Serialized event payload.
    pub body: Vec<u8>,
}

impl MessageEnvelope {
    /// Wrap a serialized payload for the given routing key.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            routing_key: routing_key.into(),
            body,
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
