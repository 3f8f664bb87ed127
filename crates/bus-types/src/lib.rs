//! # Bus Types Crate
//!
//! Event vocabulary shared by the event bus core and its transports.
//!
//! ## Design Principles
//!
//! - **Typed events**: Application events are plain structs implementing
//!   [`IntegrationEvent`]; the bus never inspects them beyond their header.
//! - **Explicit metadata**: Application, host and environment names are passed
//!   in through a [`MetadataSeed`] instead of being read from process globals.
//! - **Envelope on the wire**: Broker transports wrap serialized events in a
//!   [`MessageEnvelope`] carrying the message id and timestamp.

pub mod envelope;
pub mod errors;
pub mod event;

pub use envelope::MessageEnvelope;
pub use errors::*;
pub use event::*;
