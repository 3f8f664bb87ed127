//! # Inbound Port - EventBus
//!
//! The API applications publish and subscribe through. Implemented by the
//! in-process transport and the broker-backed transport.

use crate::domain::{EventBusError, IntegrationEventHandler};
use async_trait::async_trait;
use bus_types::IntegrationEvent;

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued for an in-process consumer.
    Enqueued,
    /// Accepted by the broker.
    Sent,
    /// No consumer exists for the event key; nothing was delivered.
    Dropped,
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Publish/subscribe API of a bus.
///
/// # Example
///
/// ```rust,ignore
/// use event_bus::ports::EventBus;
///
/// async fn example(bus: &impl EventBus) -> Result<(), EventBusError> {
///     bus.subscribe::<OrderPlacedEvent, AuditHandler>().await?;
///     bus.publish(OrderPlacedEvent::new(&seed, 42)).await?;
///     bus.unsubscribe::<OrderPlacedEvent, AuditHandler>().await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    ///
    /// # Errors
    /// - `Serialization`: the event could not be encoded
    /// - `Connection` / `Broker`: broker unreachable after retries
    /// - `Disposed`: the bus was disposed
    async fn publish<E: IntegrationEvent>(&self, event: E) -> Result<PublishOutcome, EventBusError>;

    /// Bind handler type `H` to event type `E`.
    ///
    /// # Errors
    /// - `DuplicateSubscription`: `H` is already bound to `E`
    /// - `KeyConflict`: another event type normalizes to the same key
    /// - `Connection` / `Broker`: queue declaration failed
    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// Unbind handler type `H` from event type `E`.
    ///
    /// # Errors
    /// - `SubscriptionNotFound`: `H` is not bound to `E`
    async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// Release every consumer and clear all subscriptions. Idempotent.
    async fn dispose(&self);
}
