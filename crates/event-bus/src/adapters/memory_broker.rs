//! # In-Memory Broker
//!
//! A broker client that keeps topics, queues and bindings in process memory.
//! Used for local runs and for exercising the broker-backed transport without
//! a network.
//!
//! ## Semantics
//!
//! - Topics route by exact routing key to every bound queue.
//! - Queues are FIFO with at most one consumer. Deliveries stay unacked until
//!   `ack`/`nack`; closing a channel requeues its unacked deliveries.
//! - Requeued deliveries go to the front of the queue with `redelivered` set.
//!
//! ## Fault injection
//!
//! [`InMemoryBroker::fail_next_connects`], [`InMemoryBroker::fail_next_publishes`],
//! [`InMemoryBroker::set_connect_delay`], [`InMemoryBroker::notify_all`] and
//! [`InMemoryBroker::kill_connections`].

use crate::config::ConnectionDescriptor;
use crate::ports::outbound::{
    BrokerChannel, BrokerClient, BrokerConnection, BrokerError, ConnectionNotification, Delivery,
    DeliveryStream, DeliveryTag, NotificationSink,
};
use async_trait::async_trait;
use bus_types::MessageEnvelope;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Descriptor scheme accepted by [`InMemoryBroker`].
pub const MEMORY_SCHEME: &str = "memory://";

type ChannelId = u64;

struct Unacked {
    envelope: MessageEnvelope,
    channel: ChannelId,
}

struct ActiveConsumer {
    channel: ChannelId,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(MessageEnvelope, bool)>,
    unacked: HashMap<DeliveryTag, Unacked>,
    consumer: Option<ActiveConsumer>,
}

#[derive(Default)]
struct Topology {
    topics: HashSet<String>,
    queues: HashMap<String, QueueState>,
    /// (topic, routing key, queue)
    bindings: HashSet<(String, String, String)>,
}

#[derive(Default)]
struct Faults {
    connect_failures: VecDeque<BrokerError>,
    publish_failures: VecDeque<BrokerError>,
    connect_delay: Duration,
}

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    sink: NotificationSink,
    channels: Vec<ChannelId>,
}

#[derive(Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    faults: Mutex<Faults>,
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    connect_count: AtomicU32,
    published: AtomicU64,
    next_id: AtomicU64,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hand ready messages to the queue's consumer.
    fn pump(&self, queue: &mut QueueState) {
        while let Some(consumer) = queue.consumer.as_ref() {
            let Some((envelope, redelivered)) = queue.ready.pop_front() else {
                return;
            };
            let tag = DeliveryTag(self.next_id());
            let delivery = Delivery {
                tag,
                envelope: envelope.clone(),
                redelivered,
            };
            if consumer.sender.send(delivery).is_ok() {
                queue.unacked.insert(
                    tag,
                    Unacked {
                        envelope,
                        channel: consumer.channel,
                    },
                );
            } else {
                queue.ready.push_front((envelope, redelivered));
                queue.consumer = None;
            }
        }
    }

    /// Drop a channel's consumers and requeue its unacked deliveries.
    fn release_channel(&self, channel: ChannelId) {
        let mut topology = self.topology.lock();
        for queue in topology.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|consumer| consumer.channel == channel)
            {
                queue.consumer = None;
            }
            let mut returned: Vec<(DeliveryTag, MessageEnvelope)> = Vec::new();
            queue.unacked.retain(|tag, unacked| {
                if unacked.channel == channel {
                    returned.push((*tag, unacked.envelope.clone()));
                    false
                } else {
                    true
                }
            });
            // Oldest delivery ends up first.
            returned.sort_by_key(|(tag, _)| std::cmp::Reverse(tag.0));
            for (_, envelope) in returned {
                queue.ready.push_front((envelope, true));
            }
        }
    }

    fn close_connection(&self, id: u64) -> Option<ConnectionEntry> {
        let entry = self.connections.lock().remove(&id)?;
        entry.open.store(false, Ordering::Release);
        for channel in &entry.channels {
            self.release_channel(*channel);
        }
        Some(entry)
    }
}

/// In-process broker implementing the broker client ports.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connects fail with `error`.
    pub fn fail_next_connects(&self, count: usize, error: BrokerError) {
        let mut faults = self.state.faults.lock();
        faults
            .connect_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Make the next `count` publishes fail with `error`.
    pub fn fail_next_publishes(&self, count: usize, error: BrokerError) {
        let mut faults = self.state.faults.lock();
        faults
            .publish_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Delay every connect handshake.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.faults.lock().connect_delay = delay;
    }

    /// Connect calls received, failed ones included.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::Relaxed)
    }

    /// Messages accepted on any topic.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    /// Open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Push `notification` to every open connection without closing it.
    pub fn notify_all(&self, notification: ConnectionNotification) {
        let sinks: Vec<NotificationSink> = self
            .state
            .connections
            .lock()
            .values()
            .map(|entry| entry.sink.clone())
            .collect();
        for sink in sinks {
            sink.notify(notification.clone());
        }
    }

    /// Close every open connection and report a shutdown on each.
    pub fn kill_connections(&self, reason: &str) {
        let ids: Vec<u64> = self.state.connections.lock().keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.state.close_connection(id) {
                entry.sink.notify(ConnectionNotification::Shutdown {
                    reason: reason.to_string(),
                });
            }
        }
        debug!(reason, "Broker connections killed");
    }

    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.topology.lock().topics.contains(topic)
    }

    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.topology.lock().queues.contains_key(queue)
    }

    #[must_use]
    pub fn has_binding(&self, topic: &str, routing_key: &str, queue: &str) -> bool {
        self.state.topology.lock().bindings.contains(&(
            topic.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ))
    }

    /// Messages waiting in `queue` (not yet delivered).
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        notifications: NotificationSink,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.state.connect_count.fetch_add(1, Ordering::Relaxed);

        let (failure, delay) = {
            let mut faults = self.state.faults.lock();
            (faults.connect_failures.pop_front(), faults.connect_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        if !descriptor.as_str().starts_with(MEMORY_SCHEME) {
            return Err(BrokerError::fatal(format!(
                "unsupported descriptor, expected {MEMORY_SCHEME}"
            )));
        }

        let id = self.state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.state.connections.lock().insert(
            id,
            ConnectionEntry {
                open: open.clone(),
                sink: notifications,
                channels: Vec::new(),
            },
        );
        debug!(connection = id, "Broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let id = self.state.next_id();
        let mut connections = self.state.connections.lock();
        let entry = connections
            .get_mut(&self.id)
            .ok_or_else(|| BrokerError::transient("connection closed"))?;
        entry.channels.push(id);
        Ok(Arc::new(MemoryChannel {
            id,
            open: AtomicBool::new(true),
            connection_open: self.open.clone(),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) {
        self.state.close_connection(self.id);
    }
}

struct MemoryChannel {
    id: ChannelId,
    open: AtomicBool,
    connection_open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::Acquire) && self.connection_open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::transient("channel closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.topology.lock().topics.insert(topic.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .topology
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.state.topology.lock();
        if !topology.topics.contains(topic) {
            return Err(BrokerError::fatal(format!("topic '{topic}' not declared")));
        }
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::fatal(format!("queue '{queue}' not declared")));
        }
        topology.bindings.insert((
            topic.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        topic: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.topology.lock().bindings.remove(&(
            topic.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: MessageEnvelope) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(error) = self.state.faults.lock().publish_failures.pop_front() {
            return Err(error);
        }

        let mut topology = self.state.topology.lock();
        if !topology.topics.contains(topic) {
            return Err(BrokerError::fatal(format!("topic '{topic}' not declared")));
        }
        let targets: Vec<String> = topology
            .bindings
            .iter()
            .filter(|(t, key, _)| t == topic && *key == envelope.routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in targets {
            if let Some(state) = topology.queues.get_mut(&queue) {
                state.ready.push_back((envelope.clone(), false));
                self.state.pump(state);
            }
        }
        self.state.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut topology = self.state.topology.lock();
        let state = topology
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::fatal(format!("queue '{queue}' not declared")))?;
        state.consumer = Some(ActiveConsumer {
            channel: self.id,
            sender,
        });
        self.state.pump(state);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.state.topology.lock();
        for queue in topology.queues.values_mut() {
            if queue.unacked.remove(&tag).is_some() {
                return Ok(());
            }
        }
        Err(BrokerError::fatal(format!("unknown delivery tag {}", tag.0)))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.state.topology.lock();
        for queue in topology.queues.values_mut() {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                if requeue {
                    queue.ready.push_front((unacked.envelope, true));
                    self.state.pump(queue);
                }
                return Ok(());
            }
        }
        Err(BrokerError::fatal(format!("unknown delivery tag {}", tag.0)))
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.state.release_channel(self.id);
            let mut connections = self.state.connections.lock();
            for entry in connections.values_mut() {
                entry.channels.retain(|channel| *channel != self.id);
            }
        }
    }
}
