//! # Broker-Backed Transport
//!
//! Maps publish/subscribe onto broker primitives: one topic (exchange), one
//! durable queue per subscriber application, one binding per event key.
//!
//! ## Flow
//!
//! - **Publish**: connect if needed, declare the topic, serialize, wrap in a
//!   [`MessageEnvelope`] and send, retrying transient failures with backoff.
//! - **Subscribe**: on the first binding of a key, bind the queue to the
//!   topic with the key as routing key, then make sure the consumer runs.
//! - **Consume**: one task drains the queue through the dispatch engine and
//!   acks or nacks per [`AckPolicy`]. If the delivery stream ends while
//!   subscriptions remain, it reconnects and resumes.
//! - **Unsubscribe**: when a key loses its last binding, unbind it; when the
//!   registry is empty, stop the consumer.

use crate::adapters::connection::ConnectionManager;
use crate::adapters::serializer::JsonSerializer;
use crate::config::{AckPolicy, BackoffPolicy, EventBusConfig};
use crate::domain::{
    ConnectionError, DispatchEngine, EventBusError, EventKey, EventNameProcessor, EventTypeEntry,
    HandlerContainer, HandlerId, IntegrationEventHandler, SubscriptionRegistry,
};
use crate::ports::inbound::{EventBus, PublishOutcome};
use crate::ports::outbound::{
    BrokerChannel, BrokerClient, BrokerError, Delivery, DeliveryStream, EventSerializer,
};
use async_trait::async_trait;
use bus_telemetry::metric_inc;
use bus_telemetry::metrics::EVENTS_PUBLISHED;
use bus_types::{IntegrationEvent, MessageEnvelope};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Transport label used in metrics.
const TRANSPORT: &str = "broker";

fn broker_error(operation: &'static str) -> impl FnOnce(BrokerError) -> EventBusError {
    move |source| EventBusError::Broker { operation, source }
}

/// Whether another send attempt may succeed.
fn is_retryable(error: &EventBusError) -> bool {
    match error {
        EventBusError::Broker { source, .. } => source.is_transient(),
        EventBusError::Connection(ConnectionError::NotConnected) => true,
        _ => false,
    }
}

struct ConsumerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything the consumer task needs.
#[derive(Clone)]
struct ConsumerContext {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: DispatchEngine,
    connection: Arc<ConnectionManager>,
    queue: String,
    ack_policy: AckPolicy,
    backoff: BackoffPolicy,
}

impl ConsumerContext {
    async fn attach(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), EventBusError> {
        self.connection.try_connect().await?;
        let channel = self.connection.create_channel().await?;
        let attached = async {
            channel
                .declare_queue(&self.queue)
                .await
                .map_err(broker_error("declare_queue"))?;
            channel
                .consume(&self.queue)
                .await
                .map_err(broker_error("consume"))
        }
        .await;
        match attached {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn handle(&self, channel: &dyn BrokerChannel, delivery: Delivery) {
        let event_key = EventKey::new(delivery.envelope.routing_key.as_str());
        let retry_once = !delivery.redelivered;

        let settled = match self
            .dispatcher
            .process_key(event_key.clone(), &delivery.envelope.body)
            .await
        {
            Ok(report) if report.is_success() || self.ack_policy.ack_on_handler_failure => {
                if !report.is_success() {
                    warn!(
                        event_key = %event_key,
                        message_id = %delivery.envelope.message_id,
                        failed = report.failed_count(),
                        "Acknowledging delivery despite handler failures"
                    );
                }
                channel.ack(delivery.tag).await
            }
            Ok(report) => {
                warn!(
                    event_key = %event_key,
                    message_id = %delivery.envelope.message_id,
                    failed = report.failed_count(),
                    requeue = retry_once,
                    "Rejecting delivery after handler failures"
                );
                channel.nack(delivery.tag, retry_once).await
            }
            Err(e) => {
                let requeue = self.ack_policy.requeue_on_dispatch_failure && retry_once;
                error!(
                    event_key = %event_key,
                    message_id = %delivery.envelope.message_id,
                    error = %e,
                    requeue,
                    "Undeliverable message"
                );
                channel.nack(delivery.tag, requeue).await
            }
        };

        if let Err(e) = settled {
            warn!(event_key = %event_key, error = %e, "Failed to settle delivery");
        }
    }
}

async fn run_consumer(context: ConsumerContext, mut stop: watch::Receiver<bool>) {
    let mut failures = 0u32;

    loop {
        if *stop.borrow() {
            break;
        }

        let (channel, mut deliveries) = match context.attach().await {
            Ok(attached) => attached,
            Err(e) => {
                failures += 1;
                let delay = context.backoff.delay(failures);
                error!(
                    queue = %context.queue,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Consumer could not attach to queue"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = stop.changed() => break,
                }
            }
        };
        failures = 0;
        info!(queue = %context.queue, "Consumer attached");

        let stopped = loop {
            tokio::select! {
                _ = stop.changed() => break true,
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => context.handle(channel.as_ref(), delivery).await,
                    None => break false,
                },
            }
        };
        channel.close().await;

        if stopped || context.registry.is_empty() {
            break;
        }
        warn!(queue = %context.queue, "Delivery stream ended, reattaching consumer");
    }
    debug!(queue = %context.queue, "Consumer stopped");
}

/// Event bus backed by a message broker.
pub struct BrokerEventBus<S: EventSerializer = JsonSerializer> {
    config: Arc<EventBusConfig>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: DispatchEngine,
    serializer: Arc<S>,
    connection: Arc<ConnectionManager>,

    /// Serializes subscribe/unsubscribe with their broker declarations.
    topology_lock: tokio::sync::Mutex<()>,
    consumer: Mutex<Option<ConsumerHandle>>,
    disposed: AtomicBool,
}

impl BrokerEventBus<JsonSerializer> {
    /// Create a bus with the JSON serializer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: Arc<EventBusConfig>,
        client: Arc<dyn BrokerClient>,
        handlers: Arc<HandlerContainer>,
    ) -> Self {
        Self::with_serializer(config, client, handlers, JsonSerializer)
    }
}

impl<S: EventSerializer> BrokerEventBus<S> {
    /// Create a bus with a custom serializer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_serializer(
        config: Arc<EventBusConfig>,
        client: Arc<dyn BrokerClient>,
        handlers: Arc<HandlerContainer>,
        serializer: S,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(EventNameProcessor::from_config(
            &config,
        )));
        let connection = Arc::new(ConnectionManager::new(client, &config));
        Self {
            dispatcher: DispatchEngine::new(registry.clone(), handlers),
            registry,
            serializer: Arc::new(serializer),
            connection,
            config,
            topology_lock: tokio::sync::Mutex::new(()),
            consumer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the consumer task is running.
    pub fn is_consuming(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(|consumer| !consumer.task.is_finished())
    }

    fn ensure_active(&self) -> Result<(), EventBusError> {
        if self.is_disposed() {
            return Err(EventBusError::Disposed);
        }
        Ok(())
    }

    /// One send attempt on a fresh channel.
    async fn send_once(&self, envelope: MessageEnvelope) -> Result<(), EventBusError> {
        self.connection.try_connect().await?;
        let channel = self.connection.create_channel().await?;
        let topic = self.config.default_topic.as_str();
        let sent = async {
            channel
                .declare_topic(topic)
                .await
                .map_err(broker_error("declare_topic"))?;
            channel
                .publish(topic, envelope)
                .await
                .map_err(broker_error("publish"))
        }
        .await;
        channel.close().await;
        sent
    }

    async fn bind_key(&self, event_key: &EventKey) -> Result<(), EventBusError> {
        self.connection.try_connect().await?;
        let channel = self.connection.create_channel().await?;
        let topic = self.config.default_topic.as_str();
        let queue = self.config.queue_name();
        let bound = async {
            channel
                .declare_topic(topic)
                .await
                .map_err(broker_error("declare_topic"))?;
            channel
                .declare_queue(&queue)
                .await
                .map_err(broker_error("declare_queue"))?;
            channel
                .bind_queue(&queue, topic, event_key.as_str())
                .await
                .map_err(broker_error("bind_queue"))
        }
        .await;
        channel.close().await;
        if bound.is_ok() {
            debug!(event_key = %event_key, queue = %queue, "Queue bound");
        }
        bound
    }

    async fn unbind_key(&self, event_key: &EventKey) -> Result<(), EventBusError> {
        self.connection.try_connect().await?;
        let channel = self.connection.create_channel().await?;
        let unbound = channel
            .unbind_queue(
                &self.config.queue_name(),
                &self.config.default_topic,
                event_key.as_str(),
            )
            .await
            .map_err(broker_error("unbind_queue"));
        channel.close().await;
        unbound
    }

    fn ensure_consumer(&self) {
        let mut consumer = self.consumer.lock();
        if consumer
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let context = ConsumerContext {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            connection: self.connection.clone(),
            queue: self.config.queue_name(),
            ack_policy: self.config.ack_policy,
            backoff: self.config.backoff,
        };
        let task = tokio::spawn(run_consumer(context, stop_rx));
        *consumer = Some(ConsumerHandle { stop, task });
        debug!(queue = %self.config.queue_name(), "Consumer started");
    }

    async fn stop_consumer(&self) {
        let handle = self.consumer.lock().take();
        let Some(ConsumerHandle { stop, task }) = handle else {
            return;
        };
        stop.send_replace(true);

        let grace = self.config.consumer_stop_timeout;
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => debug!("Consumer exited"),
            Ok(Err(e)) => warn!(error = %e, "Consumer task failed"),
            Err(_) => warn!(
                grace_ms = grace.as_millis() as u64,
                "Consumer did not stop within grace period, detaching"
            ),
        }
    }
}

#[async_trait]
impl<S: EventSerializer> EventBus for BrokerEventBus<S> {
    async fn publish<E: IntegrationEvent>(&self, event: E) -> Result<PublishOutcome, EventBusError> {
        self.ensure_active()?;
        let event_key = self.registry.key_for::<E>();
        let body = self.serializer.serialize(&event)?;
        let envelope = MessageEnvelope::new(event_key.as_str(), body);
        let max_attempts = self.config.retry_count.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send_once(envelope.clone()).await {
                Ok(()) => {
                    metric_inc!(EVENTS_PUBLISHED, &[TRANSPORT, event_key.as_str()]);
                    debug!(
                        event_key = %event_key,
                        event_id = %event.id(),
                        message_id = %envelope.message_id,
                        attempt,
                        "Event published"
                    );
                    return Ok(PublishOutcome::Sent);
                }
                Err(e) if is_retryable(&e) && attempt < max_attempts => {
                    let delay = self.config.backoff.delay(attempt);
                    warn!(
                        event_key = %event_key,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(event_key = %event_key, attempts = attempt, error = %e, "Publish failed");
                    return Err(e);
                }
            }
        }
    }

    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_active()?;
        let _topology = self.topology_lock.lock().await;

        let event_key = self.registry.key_for::<E>();
        if !self.registry.has_subscription(event_key.as_str()) {
            self.bind_key(&event_key).await?;
        }
        let entry = EventTypeEntry::new::<E, _>(self.serializer.clone());
        self.registry.add_subscription::<E, H>(entry)?;
        self.ensure_consumer();

        info!(
            event_key = %event_key,
            handler = HandlerId::of::<H>().name(),
            queue = %self.config.queue_name(),
            "Subscribed"
        );
        Ok(())
    }

    async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let _topology = self.topology_lock.lock().await;
        let removal = self.registry.remove_subscription::<E, H>()?;
        info!(
            event_key = %removal.event_key(),
            handler = HandlerId::of::<H>().name(),
            "Unsubscribed"
        );

        if removal.key_removed() && !self.is_disposed() {
            if let Err(e) = self.unbind_key(removal.event_key()).await {
                warn!(
                    event_key = %removal.event_key(),
                    error = %e,
                    "Failed to remove queue binding"
                );
            }
            if self.registry.is_empty() {
                self.stop_consumer().await;
            }
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _topology = self.topology_lock.lock().await;
        self.stop_consumer().await;
        self.registry.clear();
        self.connection.dispose().await;
        info!(transport = TRANSPORT, "Event bus disposed");
    }
}

impl<S: EventSerializer> Drop for BrokerEventBus<S> {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.stop.send_replace(true);
            consumer.task.abort();
        }
    }
}
