//! Ports layer for the event bus.
//!
//! Defines the hexagonal architecture port traits:
//! - Inbound (Driving) ports: the publish/subscribe API used by applications
//! - Outbound (Driven) ports: serializer and broker client collaborators

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
