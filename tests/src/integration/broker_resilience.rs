//! # Broker Resilience
//!
//! Broker transport under connection loss, notification bursts and transient
//! publish failures. The connect counter of [`InMemoryBroker`] stands in for
//! the broker's connect function.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use event_bus::{
        BrokerError, ConnectionNotification, ConnectionState, EventBus, EventBusErrorKind,
        InMemoryBroker,
    };
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_connected(bus: &event_bus::BrokerEventBus) {
        timeout(Duration::from_secs(5), async {
            while !bus.connection().is_connected() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection was not restored");
    }

    #[tokio::test]
    async fn test_shutdown_notification_reconnects_without_caller() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        assert_eq!(broker.connect_count(), 1);

        broker.kill_connections("node restart");
        wait_connected(&bus).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(bus.connection().state(), ConnectionState::Connected);
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.open_connections(), 1);

        // The consumer follows the new connection.
        bus.publish(OrderPlacedEvent::new(5)).await.unwrap();
        log.wait_for(1).await;
        assert_eq!(log.orders_for("audit"), vec![5]);

        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_concurrent_notifications_trigger_one_connect() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        assert_eq!(broker.connect_count(), 1);

        let shutdown = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.notify_all(ConnectionNotification::Shutdown {
                    reason: "peer reset".to_string(),
                });
            })
        };
        let blocked = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.notify_all(ConnectionNotification::Blocked {
                    reason: "memory alarm".to_string(),
                });
            })
        };
        shutdown.await.unwrap();
        blocked.await.unwrap();

        sleep(Duration::from_millis(100)).await;
        wait_connected(&bus).await;

        assert_eq!(broker.connect_count(), 2);
        assert_eq!(broker.open_connections(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2, BrokerError::transient("connection refused"));
        let (bus, log) = broker_bus(&broker);

        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();
        assert_eq!(broker.connect_count(), 3);
        assert_eq!(bus.connection().connect_attempts(), 3);

        bus.publish(OrderPlacedEvent::new(1)).await.unwrap();
        log.wait_for(1).await;
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_and_leave_registry_empty() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(50, BrokerError::transient("connection refused"));
        let (bus, _log) = broker_bus(&broker);

        let err = bus
            .subscribe::<OrderPlacedEvent, AuditHandler>()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), EventBusErrorKind::Connection);
        // retry_count(4) allows 5 attempts.
        assert_eq!(broker.connect_count(), 5);
        assert!(bus.registry().is_empty());
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_publish_survives_transient_broker_errors() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        bus.subscribe::<OrderPlacedEvent, BillingHandler>()
            .await
            .unwrap();

        broker.fail_next_publishes(2, BrokerError::transient("channel flow control"));
        bus.publish(OrderPlacedEvent::new(11)).await.unwrap();

        log.wait_for(1).await;
        assert_eq!(broker.published_count(), 1);
        assert_eq!(log.orders_for("billing"), vec![11]);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_fatal_publish_error_is_not_retried() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);

        broker.fail_next_publishes(1, BrokerError::fatal("access refused"));
        let err = bus.publish(OrderPlacedEvent::new(1)).await.unwrap_err();

        assert_eq!(err.kind(), EventBusErrorKind::Broker);
        assert_eq!(broker.published_count(), 0);

        // The next publish goes through.
        bus.publish(OrderPlacedEvent::new(2)).await.unwrap();
        assert_eq!(broker.published_count(), 1);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_messages_published_during_outage_are_delivered() {
        let broker = InMemoryBroker::new();
        let (bus, log) = broker_bus(&broker);
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();

        bus.publish(OrderPlacedEvent::new(1)).await.unwrap();
        log.wait_for(1).await;
        // Let the ack land so the first message is not redelivered.
        sleep(Duration::from_millis(50)).await;

        broker.kill_connections("failover");
        // Publish reconnects on its own if the manager has not yet.
        bus.publish(OrderPlacedEvent::new(2)).await.unwrap();
        bus.publish(OrderPlacedEvent::new(3)).await.unwrap();

        log.wait_for(3).await;
        assert_eq!(log.orders_for("audit"), vec![1, 2, 3]);
        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_stops_reconnects() {
        let broker = InMemoryBroker::new();
        let (bus, _log) = broker_bus(&broker);
        bus.subscribe::<OrderPlacedEvent, AuditHandler>().await.unwrap();

        bus.dispose().await;
        let connects = broker.connect_count();
        broker.kill_connections("after dispose");
        sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.connect_count(), connects);
        assert_eq!(bus.connection().state(), ConnectionState::Disposed);
        assert!(bus.connection().is_disposed());
    }
}
