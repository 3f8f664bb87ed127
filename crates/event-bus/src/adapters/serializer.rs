//! Payload serializers.
//!
//! - `JsonSerializer`: human-readable, the default for both transports
//! - `BincodeSerializer`: compact binary encoding

use crate::ports::outbound::EventSerializer;
use bus_types::{IntegrationEvent, SerializationError};

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl EventSerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize<E: IntegrationEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(event).map_err(|e| SerializationError::Encode {
            event_type: E::event_name(),
            reason: e.to_string(),
        })
    }

    fn deserialize<E: IntegrationEvent>(&self, bytes: &[u8]) -> Result<E, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
            event_type: E::event_name(),
            reason: e.to_string(),
        })
    }
}

/// Binary encoding via `bincode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl EventSerializer for BincodeSerializer {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn serialize<E: IntegrationEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError> {
        bincode::serialize(event).map_err(|e| SerializationError::Encode {
            event_type: E::event_name(),
            reason: e.to_string(),
        })
    }

    fn deserialize<E: IntegrationEvent>(&self, bytes: &[u8]) -> Result<E, SerializationError> {
        bincode::deserialize(bytes).map_err(|e| SerializationError::Decode {
            event_type: E::event_name(),
            reason: e.to_string(),
        })
    }
}
