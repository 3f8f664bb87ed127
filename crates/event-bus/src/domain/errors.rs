//! Event bus error types.
//!
//! Every error carries structured context (event key, handler, attempt count)
//! so callers can branch on [`EventBusErrorKind`] without string matching.

use super::naming::EventKey;
use crate::config::ConfigError;
use crate::ports::outbound::BrokerError;
use bus_types::SerializationError;
use std::fmt;
use thiserror::Error;

/// Registry misuse. Surfaced immediately, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The (event key, handler) pair is already bound.
    #[error("Handler {handler} is already subscribed to '{event_key}'")]
    DuplicateSubscription {
        event_key: EventKey,
        handler: &'static str,
    },

    /// The (event key, handler) pair is not bound.
    #[error("Handler {handler} is not subscribed to '{event_key}'")]
    SubscriptionNotFound {
        event_key: EventKey,
        handler: &'static str,
    },

    /// No event type is registered under this key.
    #[error("No subscriptions registered for '{event_key}'")]
    UnknownEventKey { event_key: EventKey },

    /// Another event type already owns this key.
    #[error("Event key '{event_key}' is owned by {registered}, cannot bind {requested}")]
    KeyConflict {
        event_key: EventKey,
        registered: &'static str,
        requested: &'static str,
    },
}

/// Broker connectivity failures.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The configuration carries no connection descriptor.
    #[error("No broker connection descriptor configured")]
    MissingDescriptor,

    /// Every attempt failed with a transient error.
    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: BrokerError,
    },

    /// The broker rejected the connection with a non-transient error.
    #[error("Broker connection failed: {0}")]
    Fatal(BrokerError),

    /// An operation needed a live connection and there is none.
    #[error("Broker connection is not open")]
    NotConnected,

    /// The connection manager was disposed.
    #[error("Connection manager has been disposed")]
    Disposed,
}

/// Failures that prevent a delivery from reaching any handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The payload does not decode into the registered event type.
    #[error("Cannot decode payload for '{event_key}': {source}")]
    Deserialization {
        event_key: EventKey,
        #[source]
        source: SerializationError,
    },

    /// An in-process event does not have the type registered for its key.
    #[error("Event for '{event_key}' is not a {expected}")]
    TypeMismatch {
        event_key: EventKey,
        expected: &'static str,
    },
}

/// One handler failed while processing an event. Sibling handlers still ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInvocationError {
    pub event_key: EventKey,
    pub handler: &'static str,
    pub reason: String,
}

impl fmt::Display for HandlerInvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handler {} failed for '{}': {}",
            self.handler, self.event_key, self.reason
        )
    }
}

impl std::error::Error for HandlerInvocationError {}

/// Top-level error returned by bus operations.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Broker operation '{operation}' failed: {source}")]
    Broker {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus was disposed.
    #[error("Event bus has been disposed")]
    Disposed,
}

/// Categories of event bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventBusErrorKind {
    DuplicateSubscription,
    SubscriptionNotFound,
    UnknownEventKey,
    KeyConflict,
    Connection,
    Deserialization,
    Serialization,
    Broker,
    Configuration,
    Disposed,
}

impl EventBusError {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> EventBusErrorKind {
        match self {
            Self::Registry(RegistryError::DuplicateSubscription { .. }) => {
                EventBusErrorKind::DuplicateSubscription
            }
            Self::Registry(RegistryError::SubscriptionNotFound { .. }) => {
                EventBusErrorKind::SubscriptionNotFound
            }
            Self::Registry(RegistryError::UnknownEventKey { .. }) => {
                EventBusErrorKind::UnknownEventKey
            }
            Self::Registry(RegistryError::KeyConflict { .. }) => EventBusErrorKind::KeyConflict,
            Self::Connection(ConnectionError::Disposed) | Self::Disposed => {
                EventBusErrorKind::Disposed
            }
            Self::Connection(ConnectionError::MissingDescriptor) | Self::Config(_) => {
                EventBusErrorKind::Configuration
            }
            Self::Connection(_) => EventBusErrorKind::Connection,
            Self::Dispatch(_) => EventBusErrorKind::Deserialization,
            Self::Serialization(_) => EventBusErrorKind::Serialization,
            Self::Broker { .. } => EventBusErrorKind::Broker,
        }
    }

    /// The event key involved, when the error is tied to one.
    pub fn event_key(&self) -> Option<&EventKey> {
        match self {
            Self::Registry(
                RegistryError::DuplicateSubscription { event_key, .. }
                | RegistryError::SubscriptionNotFound { event_key, .. }
                | RegistryError::UnknownEventKey { event_key }
                | RegistryError::KeyConflict { event_key, .. },
            ) => Some(event_key),
            Self::Dispatch(
                DispatchError::Deserialization { event_key, .. }
                | DispatchError::TypeMismatch { event_key, .. },
            ) => Some(event_key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err: EventBusError = RegistryError::DuplicateSubscription {
            event_key: EventKey::new("OrderPlaced"),
            handler: "AuditHandler",
        }
        .into();
        assert_eq!(err.kind(), EventBusErrorKind::DuplicateSubscription);
        assert_eq!(err.event_key().map(EventKey::as_str), Some("OrderPlaced"));

        let err: EventBusError = ConnectionError::NotConnected.into();
        assert_eq!(err.kind(), EventBusErrorKind::Connection);
        assert!(err.event_key().is_none());

        let err: EventBusError = ConnectionError::MissingDescriptor.into();
        assert_eq!(err.kind(), EventBusErrorKind::Configuration);

        let err: EventBusError = ConnectionError::Disposed.into();
        assert_eq!(err.kind(), EventBusErrorKind::Disposed);
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::SubscriptionNotFound {
            event_key: EventKey::new("OrderPlaced"),
            handler: "AuditHandler",
        };
        assert_eq!(
            err.to_string(),
            "Handler AuditHandler is not subscribed to 'OrderPlaced'"
        );
    }

    #[test]
    fn test_handler_invocation_error_display() {
        let err = HandlerInvocationError {
            event_key: EventKey::new("OrderPlaced"),
            handler: "MailHandler",
            reason: "smtp down".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Handler MailHandler failed for 'OrderPlaced': smtp down"
        );
    }
}
