//! # In-Process Transport
//!
//! Delivers events within one process.
//!
//! ## Delivery model
//!
//! - One unbounded queue and one consumer task per subscribed event key.
//! - FIFO within a key; keys are consumed concurrently.
//! - Publishing never blocks. An event whose key has no consumer is dropped
//!   and reported as [`PublishOutcome::Dropped`].
//! - Handlers of one key share the same decoded instance.

use crate::adapters::serializer::JsonSerializer;
use crate::config::EventBusConfig;
use crate::domain::{
    DispatchEngine, EventBusError, EventKey, EventNameProcessor, EventTypeEntry, HandlerContainer,
    HandlerId, IntegrationEventHandler, SharedEvent, SubscriptionRegistry,
};
use crate::ports::inbound::{EventBus, PublishOutcome};
use async_trait::async_trait;
use bus_telemetry::metric_inc;
use bus_telemetry::metrics::{EVENTS_DROPPED, EVENTS_PUBLISHED};
use bus_types::IntegrationEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport label used in metrics.
const TRANSPORT: &str = "in_memory";

/// The queue and consumer task of one event key.
struct KeyConsumer {
    sender: mpsc::UnboundedSender<SharedEvent>,
    stopped: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// In-process event bus.
pub struct InMemoryEventBus {
    config: Arc<EventBusConfig>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: DispatchEngine,
    serializer: Arc<JsonSerializer>,

    /// Guards registry mutations together with consumer start/stop.
    consumers: Mutex<HashMap<EventKey, KeyConsumer>>,

    disposed: AtomicBool,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

impl InMemoryEventBus {
    /// Create a bus resolving handlers from `handlers`.
    #[must_use]
    pub fn new(config: Arc<EventBusConfig>, handlers: Arc<HandlerContainer>) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(EventNameProcessor::from_config(
            &config,
        )));
        Self {
            dispatcher: DispatchEngine::new(registry.clone(), handlers),
            registry,
            config,
            serializer: Arc::new(JsonSerializer),
            consumers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Events handed to a consumer queue.
    #[must_use]
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Events dropped because their key had no consumer.
    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Number of running consumer tasks.
    #[must_use]
    pub fn active_consumers(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<(), EventBusError> {
        if self.is_disposed() {
            return Err(EventBusError::Disposed);
        }
        Ok(())
    }

    fn spawn_consumer(&self, event_key: EventKey) -> KeyConsumer {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(consume(
            event_key.clone(),
            receiver,
            stopped.clone(),
            self.dispatcher.clone(),
        ));
        debug!(event_key = %event_key, "Consumer started");
        KeyConsumer {
            sender,
            stopped,
            task,
        }
    }
}

/// Drain one key's queue until stopped or closed.
async fn consume(
    event_key: EventKey,
    mut receiver: mpsc::UnboundedReceiver<SharedEvent>,
    stopped: Arc<AtomicBool>,
    dispatcher: DispatchEngine,
) {
    while let Some(event) = receiver.recv().await {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        match dispatcher.process_event(&event_key, &event).await {
            Ok(report) if !report.is_success() => {
                warn!(
                    event_key = %event_key,
                    failed = report.failed_count(),
                    handlers = report.handlers_invoked,
                    "Event processed with handler failures"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(event_key = %event_key, error = %e, "Dropping undeliverable event");
            }
        }
    }
    debug!(event_key = %event_key, "Consumer stopped");
}

/// Flag the consumer, close its queue and wait up to `grace` for it to exit.
async fn stop_consumer(event_key: EventKey, consumer: KeyConsumer, grace: Duration) {
    let KeyConsumer {
        sender,
        stopped,
        task,
    } = consumer;
    stopped.store(true, Ordering::Release);
    drop(sender);

    match tokio::time::timeout(grace, task).await {
        Ok(Ok(())) => debug!(event_key = %event_key, "Consumer exited"),
        Ok(Err(e)) => warn!(event_key = %event_key, error = %e, "Consumer task failed"),
        Err(_) => warn!(
            event_key = %event_key,
            grace_ms = grace.as_millis() as u64,
            "Consumer did not stop within grace period, detaching"
        ),
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish<E: IntegrationEvent>(&self, event: E) -> Result<PublishOutcome, EventBusError> {
        self.ensure_active()?;
        let event_key = self.registry.key_for::<E>();
        let event_id = event.id();

        let enqueued = {
            let consumers = self.consumers.lock();
            consumers
                .get(&event_key)
                .is_some_and(|consumer| consumer.sender.send(Arc::new(event)).is_ok())
        };

        if enqueued {
            self.events_published.fetch_add(1, Ordering::Relaxed);
            metric_inc!(EVENTS_PUBLISHED, &[TRANSPORT, event_key.as_str()]);
            debug!(event_key = %event_key, event_id = %event_id, "Event enqueued");
            Ok(PublishOutcome::Enqueued)
        } else {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            metric_inc!(EVENTS_DROPPED, &[event_key.as_str()]);
            debug!(event_key = %event_key, event_id = %event_id, "Event dropped (no consumer)");
            Ok(PublishOutcome::Dropped)
        }
    }

    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_active()?;
        let entry = EventTypeEntry::new::<E, _>(self.serializer.clone());

        let registration = {
            let mut consumers = self.consumers.lock();
            // Dispose flips the flag before draining under this lock.
            self.ensure_active()?;
            let registration = self.registry.add_subscription::<E, H>(entry)?;
            if !consumers.contains_key(&registration.event_key) {
                let consumer = self.spawn_consumer(registration.event_key.clone());
                consumers.insert(registration.event_key.clone(), consumer);
            }
            registration
        };

        info!(
            event_key = %registration.event_key,
            handler = HandlerId::of::<H>().name(),
            "Subscribed"
        );
        Ok(())
    }

    async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let (removal, stopping) = {
            let mut consumers = self.consumers.lock();
            let removal = self.registry.remove_subscription::<E, H>()?;
            let stopping = if removal.key_removed() {
                consumers.remove(removal.event_key())
            } else {
                None
            };
            (removal, stopping)
        };

        info!(
            event_key = %removal.event_key(),
            handler = HandlerId::of::<H>().name(),
            "Unsubscribed"
        );

        if let Some(consumer) = stopping {
            stop_consumer(
                removal.event_key().clone(),
                consumer,
                self.config.consumer_stop_timeout,
            )
            .await;
        }
        Ok(())
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<(EventKey, KeyConsumer)> = {
            let mut consumers = self.consumers.lock();
            self.registry.clear();
            consumers.drain().collect()
        };

        let grace = self.config.consumer_stop_timeout;
        futures::future::join_all(
            drained
                .into_iter()
                .map(|(event_key, consumer)| stop_consumer(event_key, consumer, grace)),
        )
        .await;

        info!(transport = TRANSPORT, "Event bus disposed");
    }
}

impl Drop for InMemoryEventBus {
    fn drop(&mut self) {
        for (_, consumer) in self.consumers.get_mut().drain() {
            consumer.stopped.store(true, Ordering::Release);
            consumer.task.abort();
        }
    }
}
