//! Demonstration events and handlers wired by the runtime.
//!
//! `OrderPlacedIntegrationEvent` is handled by both the audit log and the
//! inventory reservation; `OrderShippedIntegrationEvent` only by the audit log.

use async_trait::async_trait;
use bus_types::{EventHeader, HandlerError, IntegrationEvent, MetadataSeed};
use event_bus::{HandlerContainer, IntegrationEventHandler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedIntegrationEvent {
    pub header: EventHeader,
    pub order_id: u64,
    pub quantity: u32,
}

impl OrderPlacedIntegrationEvent {
    pub fn new(seed: &MetadataSeed, order_id: u64, quantity: u32) -> Self {
        Self {
            header: EventHeader::new(seed),
            order_id,
            quantity,
        }
    }
}

impl IntegrationEvent for OrderPlacedIntegrationEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShippedIntegrationEvent {
    pub header: EventHeader,
    pub order_id: u64,
    pub carrier: String,
}

impl OrderShippedIntegrationEvent {
    pub fn new(seed: &MetadataSeed, order_id: u64, carrier: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(seed),
            order_id,
            carrier: carrier.into(),
        }
    }
}

impl IntegrationEvent for OrderShippedIntegrationEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }
}

/// Counters shared by the demo handlers and the runtime.
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub orders_audited: AtomicU64,
    pub shipments_audited: AtomicU64,
    pub reservations: AtomicU64,
    pub rejections: AtomicU64,
    audited_ids: Mutex<Vec<Uuid>>,
}

impl HandlerStats {
    /// Ids of every event the audit log has seen, in arrival order.
    pub fn audited_ids(&self) -> Vec<Uuid> {
        self.audited_ids.lock().clone()
    }

    pub fn total_audited(&self) -> u64 {
        self.orders_audited.load(Ordering::SeqCst) + self.shipments_audited.load(Ordering::SeqCst)
    }
}

/// Records every order event it sees.
pub struct OrderAuditHandler {
    stats: Arc<HandlerStats>,
}

impl OrderAuditHandler {
    pub fn new(stats: Arc<HandlerStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderPlacedIntegrationEvent> for OrderAuditHandler {
    async fn handle(&self, event: OrderPlacedIntegrationEvent) -> Result<(), HandlerError> {
        self.stats.orders_audited.fetch_add(1, Ordering::SeqCst);
        self.stats.audited_ids.lock().push(event.id());
        info!(order_id = event.order_id, event_id = %event.id(), "Audited order placement");
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderShippedIntegrationEvent> for OrderAuditHandler {
    async fn handle(&self, event: OrderShippedIntegrationEvent) -> Result<(), HandlerError> {
        self.stats.shipments_audited.fetch_add(1, Ordering::SeqCst);
        self.stats.audited_ids.lock().push(event.id());
        info!(order_id = event.order_id, carrier = %event.carrier, "Audited shipment");
        Ok(())
    }
}

/// Reserves stock for placed orders. Rejects empty orders.
pub struct InventoryReservationHandler {
    stats: Arc<HandlerStats>,
}

impl InventoryReservationHandler {
    pub fn new(stats: Arc<HandlerStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderPlacedIntegrationEvent> for InventoryReservationHandler {
    async fn handle(&self, event: OrderPlacedIntegrationEvent) -> Result<(), HandlerError> {
        if event.quantity == 0 {
            self.stats.rejections.fetch_add(1, Ordering::SeqCst);
            warn!(order_id = event.order_id, "Refusing to reserve zero items");
            return Err(HandlerError::rejected(format!(
                "order {} has no items",
                event.order_id
            )));
        }
        self.stats.reservations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register the demo handlers as singletons sharing `stats`.
pub fn register_handlers(container: &HandlerContainer, stats: &Arc<HandlerStats>) {
    container.register(OrderAuditHandler::new(stats.clone()));
    container.register(InventoryReservationHandler::new(stats.clone()));
}
