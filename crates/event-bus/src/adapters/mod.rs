//! Adapters layer for the event bus.
//!
//! Transports implementing the inbound `EventBus` port, plus reference
//! implementations of the outbound collaborators.

pub mod broker;
pub mod connection;
pub mod in_memory;
pub mod memory_broker;
pub mod serializer;

pub use broker::BrokerEventBus;
pub use connection::{ConnectionManager, ConnectionState};
pub use in_memory::InMemoryEventBus;
pub use memory_broker::{InMemoryBroker, MEMORY_SCHEME};
pub use serializer::{BincodeSerializer, JsonSerializer};
