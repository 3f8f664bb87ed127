//! # Event Bus - Typed Integration Events
//!
//! Publish typed integration events and bind handlers per event type. A
//! pluggable transport delivers them in-process or through a message broker.
//!
//! ## Architecture
//!
//! ```text
//!  publish(event)                                subscribe::<E, H>()
//!       │                                                │
//!       ▼                                                ▼
//! ┌─────────────┐   normalize   ┌──────────────────────────────┐
//! │  Transport  │ ────────────→ │     SubscriptionRegistry     │
//! │ (in-memory  │               │  key → [bindings], key → E   │
//! │  or broker) │               └──────────────────────────────┘
//! └─────────────┘                               ↑
//!       │ payload / decoded event               │ handlers_for(key)
//!       ▼                                       │
//! ┌─────────────┐  resolve H   ┌────────────────┴─┐
//! │ Consumer    │ ───────────→ │  DispatchEngine  │ ──→ H::handle(event)
//! │ loop        │              └──────────────────┘
//! └─────────────┘
//! ```
//!
//! ## Guarantees
//!
//! | Property | Where |
//! |----------|-------|
//! | One binding per (key, handler type) | `domain/registry.rs` - `add_subscription()` |
//! | Key present iff it has bindings | `domain/registry.rs` - `remove_subscription()` |
//! | Failing handlers do not stop siblings | `domain/dispatch.rs` - `invoke_all()` |
//! | One consumer task per key (in-process) | `adapters/in_memory.rs` - `consumers` map |
//! | One in-flight connect at a time | `adapters/connection.rs` - `connect_lock` |
//! | Stale reconnect notifications ignored | `adapters/connection.rs` - generation check |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use event_bus::{EventBus, EventBusConfig, HandlerContainer, InMemoryEventBus};
//!
//! let config = EventBusConfig::builder().event_name_suffix("Event").build()?.shared();
//! let handlers = Arc::new(HandlerContainer::new());
//! handlers.register(AuditHandler::default());
//!
//! let bus = InMemoryEventBus::new(config, handlers);
//! bus.subscribe::<OrderPlacedEvent, AuditHandler>().await?;
//! bus.publish(OrderPlacedEvent::new(&seed, 42)).await?;
//! ```

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;

// Re-export main types
pub use adapters::{
    BincodeSerializer, BrokerEventBus, ConnectionManager, ConnectionState, InMemoryBroker,
    InMemoryEventBus, JsonSerializer,
};
pub use config::{
    AckPolicy, BackoffPolicy, ConfigError, ConnectionDescriptor, EventBusConfig,
    EventBusConfigBuilder, TrimMode,
};
pub use domain::{
    ConnectionError, DispatchEngine, DispatchError, DispatchReport, EventBusError,
    EventBusErrorKind, EventKey, EventNameProcessor, HandlerContainer, HandlerId,
    HandlerInvocationError, IntegrationEventHandler, RegistryError, Removal,
    SubscriptionRegistry,
};
pub use ports::{
    BrokerChannel, BrokerClient, BrokerConnection, BrokerError, BrokerErrorKind,
    ConnectionNotification, EventBus, EventSerializer, PublishOutcome,
};

pub use bus_types::{EventHeader, HandlerError, IntegrationEvent, MetadataSeed};
