//! # Error Types
//!
//! Errors raised by the collaborators the bus calls through: serializers and
//! event handlers.

use thiserror::Error;

/// A payload could not be encoded or decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    /// Encoding the event failed.
    #[error("Failed to serialize {event_type}: {reason}")]
    Encode {
        event_type: &'static str,
        reason: String,
    },

    /// The payload does not match the expected event shape.
    #[error("Failed to deserialize {event_type}: {reason}")]
    Decode {
        event_type: &'static str,
        reason: String,
    },
}

/// Error returned by an event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler rejected the event.
    #[error("Handler rejected event: {0}")]
    Rejected(String),

    /// The handler could not be resolved from the handler container.
    #[error("Handler {0} is not registered")]
    Unresolved(&'static str),

    /// The handler panicked while processing the event.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Any other failure raised by handler code.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Shortcut for [`HandlerError::Rejected`].
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::rejected("out of stock");
        assert_eq!(err.to_string(), "Handler rejected event: out of stock");

        let err = HandlerError::Unresolved("AuditHandler");
        assert_eq!(err.to_string(), "Handler AuditHandler is not registered");
    }

    #[test]
    fn test_boxed_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(io);
        let err: HandlerError = boxed.into();
        assert_eq!(err.to_string(), "disk gone");
    }
}
