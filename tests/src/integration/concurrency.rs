//! # Concurrency
//!
//! Subscribe, unsubscribe and publish racing each other from many tasks.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use event_bus::{EventBus, EventBusErrorKind, InMemoryBroker};
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_subscribes_bind_once() {
        let (bus, _log) = in_memory_bus();
        let bus = Arc::new(bus);

        let attempts = (0..16).map(|_| {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe::<OrderPlacedEvent, AuditHandler>().await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.expect("subscribe task panicked"))
            .collect();

        let succeeded = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(succeeded, 1);
        assert!(results
            .iter()
            .filter_map(|result| result.as_ref().err())
            .all(|err| err.kind() == EventBusErrorKind::DuplicateSubscription));
        assert_eq!(bus.registry().binding_count("OrderPlaced"), 1);
        assert_eq!(bus.active_consumers(), 1);

        bus.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscription_churn_during_publish_keeps_invariants() {
        let (bus, log) = in_memory_bus();
        let bus = Arc::new(bus);
        // Billing stays bound throughout and must see every event.
        bus.subscribe::<OrderPlacedEvent, BillingHandler>()
            .await
            .unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for order_id in 1..=200 {
                    bus.publish(OrderPlacedEvent::new(order_id)).await.unwrap();
                }
            })
        };
        let churn = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
                    bus.subscribe::<StockDepletedEvent, AuditHandler>().await.unwrap();
                    tokio::task::yield_now().await;
                    bus.unsubscribe::<StockDepletedEvent, AuditHandler>()
                        .await
                        .unwrap();
                    bus.unsubscribe::<OrderPlacedEvent, AuditHandler>()
                        .await
                        .unwrap();
                }
            })
        };
        publisher.await.unwrap();
        churn.await.unwrap();

        timeout_until(|| log.count_for("billing") == 200).await;
        assert_eq!(log.orders_for("billing"), (1..=200).collect::<Vec<_>>());

        let registry = bus.registry();
        assert_eq!(registry.event_keys().len(), 1);
        assert_eq!(registry.binding_count("OrderPlaced"), 1);
        assert!(!registry.has_subscription("StockDepleted"));
        assert_eq!(bus.active_consumers(), 1);

        bus.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broker_parallel_subscribes_share_one_consumer() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        let bus = Arc::new(bus);

        let audit = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe::<OrderPlacedEvent, AuditHandler>().await })
        };
        let billing = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe::<OrderPlacedEvent, BillingHandler>().await })
        };
        let stock = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe::<StockDepletedEvent, AuditHandler>().await })
        };
        audit.await.unwrap().unwrap();
        billing.await.unwrap().unwrap();
        stock.await.unwrap().unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert!(bus.is_consuming());
        assert!(broker.has_binding("event_bus", "OrderPlaced", "bus-tests.event_bus"));
        assert!(broker.has_binding("event_bus", "StockDepleted", "bus-tests.event_bus"));

        bus.publish(OrderPlacedEvent::new(3)).await.unwrap();
        bus.publish(StockDepletedEvent::new("sku-17")).await.unwrap();
        log.wait_for(3).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(log.count_for("billing"), 1);
        assert_eq!(log.count_for("audit"), 2);
        bus.dispose().await;
    }

    async fn timeout_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }
}
