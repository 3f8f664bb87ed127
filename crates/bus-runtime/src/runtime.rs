//! # Bus Runtime
//!
//! Owns a bus, binds the demo handlers, publishes a batch of orders and tears
//! everything down on shutdown.
//!
//! ## Startup Sequence
//!
//! 1. Subscribe handlers (audit and inventory to placed orders, audit to shipments)
//! 2. Spawn the removal watcher that logs keys losing their last binding
//!
//! ## Shutdown Sequence
//!
//! 1. Unsubscribe every handler (fires key-removed notifications)
//! 2. Dispose the bus (stops consumers, closes the broker connection)
//! 3. Signal the removal watcher and wait for it to drain

use crate::handlers::{
    HandlerStats, InventoryReservationHandler, OrderAuditHandler, OrderPlacedIntegrationEvent,
    OrderShippedIntegrationEvent,
};
use bus_types::MetadataSeed;
use event_bus::{EventBus, EventBusError, EventKey, PublishOutcome, SubscriptionRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

const CARRIERS: [&str; 3] = ["dhl", "ups", "postnl"];

/// Counts from one demo batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemoSummary {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

impl DemoSummary {
    fn record(&mut self, outcome: PublishOutcome) {
        self.published += 1;
        if outcome.is_delivered() {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

/// Runs the demo flow against any bus transport.
pub struct BusRuntime<B: EventBus> {
    bus: Arc<B>,
    registry: Arc<SubscriptionRegistry>,
    seed: MetadataSeed,
    stats: Arc<HandlerStats>,
    removed_keys: Arc<Mutex<Vec<EventKey>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<B: EventBus + 'static> BusRuntime<B> {
    /// `registry` must be the registry `bus` dispatches from.
    pub fn new(
        bus: Arc<B>,
        registry: Arc<SubscriptionRegistry>,
        seed: MetadataSeed,
        stats: Arc<HandlerStats>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            registry,
            seed,
            stats,
            removed_keys: Arc::new(Mutex::new(Vec::new())),
            watcher: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub async fn start(&self) -> Result<(), EventBusError> {
        info!(app_name = %self.seed.app_name, environment = %self.seed.environment, "Starting bus runtime");

        // Subscribe before the handlers bind so no removal is missed.
        let removals = self.registry.subscribe_removals();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(watch_removals(
            removals,
            shutdown_rx,
            self.removed_keys.clone(),
        ));
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }

        self.bus
            .subscribe::<OrderPlacedIntegrationEvent, OrderAuditHandler>()
            .await?;
        self.bus
            .subscribe::<OrderPlacedIntegrationEvent, InventoryReservationHandler>()
            .await?;
        self.bus
            .subscribe::<OrderShippedIntegrationEvent, OrderAuditHandler>()
            .await?;

        info!(keys = ?self.registry.event_keys(), "Handlers subscribed");
        Ok(())
    }

    /// Publish `orders` placed orders, each followed by its shipment.
    ///
    /// Every fourth order is empty and is rejected by the inventory handler.
    pub async fn run_demo(&self, orders: u64) -> Result<DemoSummary, EventBusError> {
        let mut summary = DemoSummary::default();

        for order_id in 1..=orders {
            let quantity = (order_id % 4) as u32;
            let placed = OrderPlacedIntegrationEvent::new(&self.seed, order_id, quantity);
            summary.record(self.bus.publish(placed).await?);

            let carrier = CARRIERS[(order_id as usize) % CARRIERS.len()];
            let shipped = OrderShippedIntegrationEvent::new(&self.seed, order_id, carrier);
            summary.record(self.bus.publish(shipped).await?);
        }

        info!(
            published = summary.published,
            delivered = summary.delivered,
            dropped = summary.dropped,
            "Demo batch published"
        );
        Ok(summary)
    }

    /// Unbind the handlers, dispose the bus and stop the watcher.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self
            .bus
            .unsubscribe::<OrderPlacedIntegrationEvent, InventoryReservationHandler>()
            .await
        {
            warn!(error = %e, "Unsubscribe failed");
        }
        if let Err(e) = self
            .bus
            .unsubscribe::<OrderPlacedIntegrationEvent, OrderAuditHandler>()
            .await
        {
            warn!(error = %e, "Unsubscribe failed");
        }
        if let Err(e) = self
            .bus
            .unsubscribe::<OrderShippedIntegrationEvent, OrderAuditHandler>()
            .await
        {
            warn!(error = %e, "Unsubscribe failed");
        }

        self.bus.dispose().await;

        if let Err(e) = self.shutdown_tx.send(true) {
            debug!("Removal watcher already gone: {}", e);
        }
        let watcher = self.watcher.lock().take();
        if let Some(mut handle) = watcher {
            if tokio::time::timeout(WATCHER_STOP_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                error!("Removal watcher did not stop in time");
                handle.abort();
            }
        }

        info!("Shutdown complete");
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    /// Keys that lost their last binding, in notification order.
    pub fn removed_keys(&self) -> Vec<EventKey> {
        self.removed_keys.lock().clone()
    }
}

async fn watch_removals(
    mut removals: broadcast::Receiver<EventKey>,
    mut shutdown_rx: watch::Receiver<bool>,
    removed_keys: Arc<Mutex<Vec<EventKey>>>,
) {
    loop {
        tokio::select! {
            // Drain pending notifications before honoring shutdown.
            biased;
            received = removals.recv() => match received {
                Ok(event_key) => {
                    info!(event_key = %event_key, "Event key has no subscribers left");
                    removed_keys.lock().push(event_key);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Removal watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Removal watcher stopped");
}
