//! Outbound (Driven) ports of the event bus.
//!
//! These traits define the collaborators the core calls through: the payload
//! serializer and the broker client library.

use crate::config::ConnectionDescriptor;
use async_trait::async_trait;
use bus_types::{IntegrationEvent, MessageEnvelope, SerializationError};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::Stream;

// =============================================================================
// SERIALIZER
// =============================================================================

/// Encodes events to bytes and back.
///
/// Implementations must round-trip every [`bus_types::EventHeader`] field,
/// metadata included.
pub trait EventSerializer: Send + Sync + 'static {
    /// Short name used in logs (`json`, `bincode`).
    fn name(&self) -> &'static str;

    fn serialize<E: IntegrationEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError>;

    fn deserialize<E: IntegrationEvent>(&self, bytes: &[u8]) -> Result<E, SerializationError>;
}

// =============================================================================
// BROKER CLIENT
// =============================================================================

/// Whether a broker failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Connection refused, host unreachable, broker temporarily unavailable.
    Transient,
    /// Anything retrying cannot fix (bad credentials, malformed descriptor).
    Fatal,
}

/// Error raised by the broker client library.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} broker error: {message}")]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BrokerErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BrokerErrorKind::Transient
    }
}

/// Asynchronous connection-level notifications raised by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    /// The connection was shut down (by the broker or the network).
    Shutdown { reason: String },
    /// The broker blocked the connection (resource alarm).
    Blocked { reason: String },
    /// A callback on the connection raised an error.
    CallbackException { detail: String },
}

impl fmt::Display for ConnectionNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown { reason } => write!(f, "shutdown ({reason})"),
            Self::Blocked { reason } => write!(f, "blocked ({reason})"),
            Self::CallbackException { detail } => write!(f, "callback exception ({detail})"),
        }
    }
}

/// A notification tagged with the connection generation that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedNotification {
    pub generation: u64,
    pub notification: ConnectionNotification,
}

/// Control channel the broker client pushes connection notifications onto.
///
/// Each connection gets its own sink; the connection manager ignores
/// notifications from generations it has already replaced.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedNotification>,
}

impl NotificationSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedNotification>) -> Self {
        Self { generation, tx }
    }

    /// Push a notification. Returns `false` once the manager stopped listening.
    pub fn notify(&self, notification: ConnectionNotification) -> bool {
        self.tx
            .send(TaggedNotification {
                generation: self.generation,
                notification,
            })
            .is_ok()
    }
}

/// Broker-assigned handle used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// One inbound message from a consumed queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub envelope: MessageEnvelope,
    /// Set when the broker delivers the message again after a requeue.
    pub redelivered: bool,
}

/// Stream of deliveries from a consumed queue. Ends when the channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Entry point of the broker client library.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open a connection. Connection notifications must be pushed onto `notifications`.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        notifications: NotificationSink,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self);
}

/// A channel on a broker connection.
///
/// Declarations are idempotent.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, topic: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, envelope: MessageEnvelope) -> Result<(), BrokerError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self);
}
