//! # Connection Manager
//!
//! Owns the broker connection for a broker-backed transport.
//!
//! ## State machine
//!
//! ```text
//! Disconnected --try_connect--> Connecting --ok--> Connected
//!      ^                            |                  |
//!      +------ retries exhausted ---+                  |
//!      +------------- shutdown / blocked / error ------+
//! any --dispose--> Disposed
//! ```
//!
//! ## Reconnect
//!
//! Every connection gets a [`NotificationSink`] tagged with a generation
//! number. The broker client pushes shutdown, blocked and callback-exception
//! notifications onto it; a single control task drains them and reconnects.
//! Notifications from a generation that was already replaced are ignored, so
//! a burst of notifications about one dead connection costs one reconnect.
//!
//! `try_connect` is serialized by an async mutex: concurrent callers wait for
//! the in-flight attempt and then observe the connected state.

use crate::config::{BackoffPolicy, ConnectionDescriptor, EventBusConfig};
use crate::domain::{ConnectionError, EventBusError};
use crate::ports::outbound::{
    BrokerChannel, BrokerClient, BrokerConnection, NotificationSink, TaggedNotification,
};
use bus_telemetry::metric_inc;
use bus_telemetry::metrics::{CONNECT_ATTEMPTS, RECONNECTS};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

struct Shared {
    client: Arc<dyn BrokerClient>,
    descriptor: Option<ConnectionDescriptor>,
    retry_count: u32,
    backoff: BackoffPolicy,

    state: RwLock<ConnectionState>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connect_lock: tokio::sync::Mutex<()>,

    /// Generation of the most recent connect attempt.
    generation: AtomicU64,
    connect_attempts: AtomicU64,
    disposed: AtomicBool,

    control_tx: mpsc::UnboundedSender<TaggedNotification>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionState::Connected
            && self
                .connection
                .read()
                .as_ref()
                .is_some_and(|connection| connection.is_open())
    }

    /// Move to `next` unless the manager is already disposed.
    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != ConnectionState::Disposed {
            *state = next;
        }
    }

    async fn try_connect(&self) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        let descriptor = self
            .descriptor
            .as_ref()
            .ok_or(ConnectionError::MissingDescriptor)?;

        let _guard = self.connect_lock.lock().await;
        if self.is_disposed() {
            return Err(ConnectionError::Disposed);
        }
        if self.is_connected() {
            return Ok(());
        }

        self.transition(ConnectionState::Connecting);
        let max_attempts = self.retry_count.saturating_add(1);
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0u32;

        loop {
            if self.is_disposed() {
                return Err(ConnectionError::Disposed);
            }
            attempt += 1;
            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            metric_inc!(CONNECT_ATTEMPTS);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let sink = NotificationSink::new(generation, self.control_tx.clone());

            match self.client.connect(descriptor, sink).await {
                Ok(connection) => {
                    if self.is_disposed() {
                        connection.close().await;
                        return Err(ConnectionError::Disposed);
                    }
                    let replaced = self.connection.write().replace(connection);
                    self.transition(ConnectionState::Connected);
                    if let Some(replaced) = replaced {
                        replaced.close().await;
                    }
                    info!(attempt, generation, "Broker connection established");
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    self.transition(ConnectionState::Disconnected);
                    error!(attempt, error = %e, "Broker rejected connection");
                    return Err(ConnectionError::Fatal(e));
                }
                Err(e) if attempt >= max_attempts => {
                    self.transition(ConnectionState::Disconnected);
                    error!(attempts = attempt, error = %e, "Broker unreachable, giving up");
                    return Err(ConnectionError::RetriesExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connect failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            return Err(ConnectionError::Disposed);
                        }
                    }
                }
            }
        }
    }

    /// Drop the current connection if `generation` still owns it.
    async fn on_notification(&self, tagged: TaggedNotification) {
        if self.is_disposed() {
            return;
        }
        let current = self.generation.load(Ordering::Acquire);
        if tagged.generation != current {
            debug!(
                generation = tagged.generation,
                current,
                notification = %tagged.notification,
                "Ignoring notification from replaced connection"
            );
            return;
        }

        warn!(
            generation = tagged.generation,
            notification = %tagged.notification,
            "Broker connection lost, reconnecting"
        );

        let stale = {
            let _guard = self.connect_lock.lock().await;
            // A caller may have reconnected while we waited.
            if self.generation.load(Ordering::Acquire) != tagged.generation {
                return;
            }
            self.transition(ConnectionState::Disconnected);
            self.connection.write().take()
        };
        if let Some(connection) = stale {
            connection.close().await;
        }

        metric_inc!(RECONNECTS);
        match self.try_connect().await {
            Ok(()) => info!("Broker connection restored"),
            Err(ConnectionError::Disposed) => {}
            Err(e) => error!(error = %e, "Reconnect failed, connection stays down"),
        }
    }
}

async fn control_loop(
    shared: Arc<Shared>,
    mut notifications: mpsc::UnboundedReceiver<TaggedNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            tagged = notifications.recv() => match tagged {
                Some(tagged) => shared.on_notification(tagged).await,
                None => break,
            },
        }
    }
    debug!("Connection control loop stopped");
}

/// Resilient owner of one broker connection.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager and start its control loop.
    ///
    /// Must be called from within a Tokio runtime. Does not connect.
    pub fn new(client: Arc<dyn BrokerClient>, config: &EventBusConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client,
            descriptor: config.connection.clone(),
            retry_count: config.retry_count,
            backoff: config.backoff,
            state: RwLock::new(ConnectionState::Disconnected),
            connection: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            control_tx,
            shutdown,
        });
        let control_task = tokio::spawn(control_loop(shared.clone(), control_rx, shutdown_rx));
        Self {
            shared,
            control_task: Mutex::new(Some(control_task)),
        }
    }

    /// Connect unless already connected, retrying transient failures.
    ///
    /// # Errors
    /// - `MissingDescriptor`: no connection descriptor configured
    /// - `Fatal`: the broker rejected the connection
    /// - `RetriesExhausted`: every attempt failed transiently
    /// - `Disposed`: the manager was disposed
    pub async fn try_connect(&self) -> Result<(), ConnectionError> {
        self.shared.try_connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Connect attempts made so far, retries included.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Open a channel on the live connection. Never reconnects.
    ///
    /// # Errors
    /// - `Connection(NotConnected)`: there is no open connection
    /// - `Broker`: the broker refused the channel
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, EventBusError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed.into());
        }
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        let connection = self
            .shared
            .connection
            .read()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        connection
            .create_channel()
            .await
            .map_err(|source| EventBusError::Broker {
                operation: "create_channel",
                source,
            })
    }

    /// Stop reconnecting and close the connection. Idempotent.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.send_replace(true);

        // Wait out any in-flight connect so it cannot install a connection afterwards.
        let connection = {
            let _guard = self.shared.connect_lock.lock().await;
            *self.shared.state.write() = ConnectionState::Disposed;
            self.shared.connection.write().take()
        };
        if let Some(connection) = connection {
            connection.close().await;
        }

        let task = self.control_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        info!("Connection manager disposed");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("descriptor", &self.shared.descriptor)
            .field("state", &self.state())
            .field("connect_attempts", &self.connect_attempts())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(task) = self.control_task.get_mut().take() {
            task.abort();
        }
    }
}
