//! Shared fixtures: two event types, recording handlers and bus builders.
//!
//! Every bus is configured with the suffix `Event`, so `OrderPlacedEvent`
//! binds under the key `OrderPlaced`.

use async_trait::async_trait;
use bus_types::{EventHeader, HandlerError, IntegrationEvent, MetadataSeed};
use event_bus::{
    BackoffPolicy, BrokerEventBus, ConnectionDescriptor, EventBus, EventBusConfig,
    HandlerContainer, InMemoryBroker, InMemoryEventBus, IntegrationEventHandler,
    SubscriptionRegistry,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Descriptor every broker fixture connects with.
pub const BROKER_URI: &str = "memory://integration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedEvent {
    pub header: EventHeader,
    pub order_id: u64,
}

impl OrderPlacedEvent {
    pub fn new(order_id: u64) -> Self {
        Self {
            header: EventHeader::new(&seed()),
            order_id,
        }
    }
}

impl IntegrationEvent for OrderPlacedEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockDepletedEvent {
    pub header: EventHeader,
    pub sku: String,
}

impl StockDepletedEvent {
    pub fn new(sku: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(&seed()),
            sku: sku.into(),
        }
    }
}

impl IntegrationEvent for StockDepletedEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }
}

pub fn seed() -> MetadataSeed {
    MetadataSeed::new("bus-tests", "test-host", "test")
}

/// One handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub handler: &'static str,
    pub event_id: Uuid,
    pub order_id: Option<u64>,
}

/// Append-only log shared by every fixture handler.
#[derive(Debug, Default)]
pub struct InvocationLog {
    entries: Mutex<Vec<Invocation>>,
}

impl InvocationLog {
    fn record(&self, handler: &'static str, event_id: Uuid, order_id: Option<u64>) {
        self.entries.lock().push(Invocation {
            handler,
            event_id,
            order_id,
        });
    }

    pub fn snapshot(&self) -> Vec<Invocation> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_for(&self, handler: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.handler == handler)
            .count()
    }

    /// Order ids seen by `handler`, in invocation order.
    pub fn orders_for(&self, handler: &str) -> Vec<u64> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.handler == handler)
            .filter_map(|entry| entry.order_id)
            .collect()
    }

    /// Wait until at least `count` invocations are logged.
    pub async fn wait_for(&self, count: usize) {
        timeout(Duration::from_secs(5), async {
            while self.len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} invocations, saw {}", self.len()));
    }
}

pub struct AuditHandler(pub Arc<InvocationLog>);
pub struct BillingHandler(pub Arc<InvocationLog>);
/// Logs the invocation, then fails.
pub struct AlwaysFailingHandler(pub Arc<InvocationLog>);

#[async_trait]
impl IntegrationEventHandler<OrderPlacedEvent> for AuditHandler {
    async fn handle(&self, event: OrderPlacedEvent) -> Result<(), HandlerError> {
        self.0.record("audit", event.id(), Some(event.order_id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<StockDepletedEvent> for AuditHandler {
    async fn handle(&self, event: StockDepletedEvent) -> Result<(), HandlerError> {
        self.0.record("audit", event.id(), None);
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderPlacedEvent> for BillingHandler {
    async fn handle(&self, event: OrderPlacedEvent) -> Result<(), HandlerError> {
        self.0.record("billing", event.id(), Some(event.order_id));
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderPlacedEvent> for AlwaysFailingHandler {
    async fn handle(&self, event: OrderPlacedEvent) -> Result<(), HandlerError> {
        self.0.record("failing", event.id(), Some(event.order_id));
        Err(HandlerError::rejected("payment provider unavailable"))
    }
}

/// Gives scenarios access to a transport's registry.
pub trait RegistryAccess: EventBus + 'static {
    fn subscriptions(&self) -> &Arc<SubscriptionRegistry>;
}

impl RegistryAccess for InMemoryEventBus {
    fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        self.registry()
    }
}

impl RegistryAccess for BrokerEventBus {
    fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        self.registry()
    }
}

/// Bus configuration with fast retries. `connection` is set for broker fixtures.
pub fn bus_config(connection: Option<&str>) -> Arc<EventBusConfig> {
    let mut builder = EventBusConfig::builder()
        .subscriber_app_name("bus-tests")
        .event_name_suffix("Event")
        .retry_count(4)
        .backoff(BackoffPolicy {
            base: 2,
            unit: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
        })
        .consumer_stop_timeout(Duration::from_millis(200));
    if let Some(connection) = connection {
        builder = builder.connection(ConnectionDescriptor::new(connection));
    }
    builder.build().expect("fixture config is valid").shared()
}

pub fn handler_container(log: &Arc<InvocationLog>) -> Arc<HandlerContainer> {
    let container = Arc::new(HandlerContainer::new());
    container.register(AuditHandler(log.clone()));
    container.register(BillingHandler(log.clone()));
    container.register(AlwaysFailingHandler(log.clone()));
    container
}

pub fn in_memory_bus() -> (InMemoryEventBus, Arc<InvocationLog>) {
    let log = Arc::new(InvocationLog::default());
    let bus = InMemoryEventBus::new(bus_config(None), handler_container(&log));
    (bus, log)
}

/// Must be called from within a Tokio runtime.
pub fn broker_bus(broker: &InMemoryBroker) -> (BrokerEventBus, Arc<InvocationLog>) {
    let log = Arc::new(InvocationLog::default());
    let bus = BrokerEventBus::new(
        bus_config(Some(BROKER_URI)),
        Arc::new(broker.clone()),
        handler_container(&log),
    );
    (bus, log)
}
