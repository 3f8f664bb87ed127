//! # Transport Contract
//!
//! Behavior every transport must share. Each scenario is written once against
//! [`RegistryAccess`] and run on the in-process bus and on the broker bus.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use event_bus::{EventBus, EventBusErrorKind, InMemoryBroker, IntegrationEvent};
    use std::time::Duration;
    use tokio::time::sleep;

    /// Settling time before asserting that nothing else arrived.
    const QUIET_PERIOD: Duration = Duration::from_millis(100);

    // =========================================================================
    // SCENARIOS
    // =========================================================================

    async fn order_placed_reaches_handler_once<B: RegistryAccess>(bus: &B, log: &InvocationLog) {
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        assert!(bus.subscriptions().has_subscription("OrderPlaced"));

        let event = OrderPlacedEvent::new(42);
        let published_id = event.id();
        bus.publish(event).await.unwrap();

        log.wait_for(1).await;
        sleep(QUIET_PERIOD).await;

        let invocations = log.snapshot();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].handler, "audit");
        assert_eq!(invocations[0].event_id, published_id);
        assert_eq!(invocations[0].order_id, Some(42));
    }

    async fn duplicate_subscription_rejected<B: RegistryAccess>(bus: &B) {
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();

        let err = bus
            .subscribe::<OrderPlacedEvent, AuditHandler>()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), EventBusErrorKind::DuplicateSubscription);
        assert_eq!(bus.subscriptions().binding_count("OrderPlaced"), 1);
    }

    async fn repeated_unsubscribe_leaves_other_keys<B: RegistryAccess>(bus: &B) {
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        bus.subscribe::<StockDepletedEvent, AuditHandler>().await.unwrap();

        bus.unsubscribe::<OrderPlacedEvent, AuditHandler>()
            .await
            .unwrap();
        let err = bus
            .unsubscribe::<OrderPlacedEvent, AuditHandler>()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), EventBusErrorKind::SubscriptionNotFound);
        assert!(!bus.subscriptions().has_subscription("OrderPlaced"));
        assert_eq!(bus.subscriptions().binding_count("StockDepleted"), 1);
    }

    async fn delivery_preserves_publish_order<B: RegistryAccess>(bus: &B, log: &InvocationLog) {
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();

        for order_id in 1..=25 {
            bus.publish(OrderPlacedEvent::new(order_id)).await.unwrap();
        }

        log.wait_for(25).await;
        assert_eq!(log.orders_for("audit"), (1..=25).collect::<Vec<_>>());
    }

    async fn failing_handler_does_not_block_sibling<B: RegistryAccess>(
        bus: &B,
        log: &InvocationLog,
    ) {
        bus.subscribe::<OrderPlacedEvent, AlwaysFailingHandler>()
            .await
            .unwrap();
        bus.subscribe::<OrderPlacedEvent, BillingHandler>()
            .await
            .unwrap();

        bus.publish(OrderPlacedEvent::new(7)).await.unwrap();

        log.wait_for(2).await;
        sleep(QUIET_PERIOD).await;

        assert_eq!(log.count_for("billing"), 1);
        assert_eq!(log.orders_for("billing"), vec![7]);
        // First registered runs first.
        assert_eq!(log.snapshot()[0].handler, "failing");
    }

    async fn publish_without_subscribers_is_accepted<B: RegistryAccess>(
        bus: &B,
        log: &InvocationLog,
    ) {
        assert!(!bus.subscriptions().has_subscription("OrderPlaced"));

        bus.publish(OrderPlacedEvent::new(1)).await.unwrap();
        sleep(QUIET_PERIOD).await;

        assert!(log.is_empty());
    }

    async fn dispose_clears_registry<B: RegistryAccess>(bus: &B) {
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        bus.subscribe::<StockDepletedEvent, AuditHandler>().await.unwrap();

        bus.dispose().await;
        bus.dispose().await;

        assert!(bus.subscriptions().is_empty());
        let err = bus.publish(OrderPlacedEvent::new(1)).await.unwrap_err();
        assert_eq!(err.kind(), EventBusErrorKind::Disposed);
    }

    // =========================================================================
    // IN-PROCESS TRANSPORT
    // =========================================================================

    #[tokio::test]
    async fn test_in_memory_order_placed_reaches_handler_once() {
        let (bus, log) = in_memory_bus();
        order_placed_reaches_handler_once(&bus, &log).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_duplicate_subscription_rejected() {
        let (bus, _log) = in_memory_bus();
        duplicate_subscription_rejected(&bus).await;
        // Still exactly one consumer for the key.
        assert_eq!(bus.active_consumers(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_repeated_unsubscribe_leaves_other_keys() {
        let (bus, _log) = in_memory_bus();
        repeated_unsubscribe_leaves_other_keys(&bus).await;
        assert_eq!(bus.active_consumers(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_delivery_preserves_publish_order() {
        let (bus, log) = in_memory_bus();
        delivery_preserves_publish_order(&bus, &log).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_failing_handler_does_not_block_sibling() {
        let (bus, log) = in_memory_bus();
        failing_handler_does_not_block_sibling(&bus, &log).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_publish_without_subscribers_is_dropped() {
        let (bus, log) = in_memory_bus();
        publish_without_subscribers_is_accepted(&bus, &log).await;
        assert_eq!(bus.events_dropped(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_in_memory_dispose_clears_registry() {
        let (bus, _log) = in_memory_bus();
        dispose_clears_registry(&bus).await;
        assert_eq!(bus.active_consumers(), 0);
    }

    // =========================================================================
    // BROKER TRANSPORT
    // =========================================================================

    #[tokio::test]
    async fn test_broker_order_placed_reaches_handler_once() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        order_placed_reaches_handler_once(&bus, &log).await;
        assert_eq!(broker.unacked_count("bus-tests.event_bus"), 0);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_duplicate_subscription_rejected() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);
        duplicate_subscription_rejected(&bus).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_repeated_unsubscribe_leaves_other_keys() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);
        repeated_unsubscribe_leaves_other_keys(&bus).await;
        assert!(!broker.has_binding("event_bus", "OrderPlaced", "bus-tests.event_bus"));
        assert!(broker.has_binding("event_bus", "StockDepleted", "bus-tests.event_bus"));
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_delivery_preserves_publish_order() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        delivery_preserves_publish_order(&bus, &log).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_failing_handler_does_not_block_sibling() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        failing_handler_does_not_block_sibling(&bus, &log).await;
        // Handler failures are acked, not redelivered.
        assert_eq!(log.count_for("failing"), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_publish_without_subscribers_is_accepted() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        publish_without_subscribers_is_accepted(&bus, &log).await;
        assert_eq!(broker.published_count(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_broker_dispose_clears_registry() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);
        dispose_clears_registry(&bus).await;
        assert!(!bus.is_consuming());
        assert_eq!(broker.open_connections(), 0);
    }
}
