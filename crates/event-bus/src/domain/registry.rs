//! # Subscription Registry
//!
//! In-memory mapping of event key to the ordered handler bindings for it, plus
//! the event type each key decodes into.
//!
//! ## Invariants
//!
//! - A key is present iff it has at least one binding.
//! - At most one binding per (key, handler type); duplicates are an error.
//! - Removing the last binding of a key raises exactly one "key removed"
//!   notification. [`SubscriptionRegistry::clear`] raises none.
//!
//! All state sits behind a single lock, so subscribe/unsubscribe racing with
//! dispatch lookups always observe a consistent map.

use super::errors::RegistryError;
use super::handlers::{HandlerId, HandlerInvoker, IntegrationEventHandler, SharedEvent, TypedInvoker};
use super::naming::{EventKey, EventNameProcessor};
use crate::ports::outbound::EventSerializer;
use bus_types::{IntegrationEvent, SerializationError};
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the key-removal notification channel.
const REMOVAL_CHANNEL_CAPACITY: usize = 64;

type Decoder = Arc<dyn Fn(&[u8]) -> Result<SharedEvent, SerializationError> + Send + Sync>;

/// The concrete event type registered under a key, with its payload decoder.
#[derive(Clone)]
pub struct EventTypeEntry {
    type_id: TypeId,
    type_name: &'static str,
    decoder: Decoder,
}

impl EventTypeEntry {
    /// Describe `E`, decoding payloads with `serializer`.
    pub fn new<E, S>(serializer: Arc<S>) -> Self
    where
        E: IntegrationEvent,
        S: EventSerializer,
    {
        let decoder: Decoder = Arc::new(move |bytes: &[u8]| {
            let event: E = serializer.deserialize(bytes)?;
            Ok(Arc::new(event) as SharedEvent)
        });
        Self {
            type_id: TypeId::of::<E>(),
            type_name: E::event_name(),
            decoder,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn decode(&self, payload: &[u8]) -> Result<SharedEvent, SerializationError> {
        (self.decoder)(payload)
    }
}

impl fmt::Debug for EventTypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeEntry")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Pairs an event key with a handler type.
#[derive(Clone)]
pub struct SubscriptionBinding {
    event_key: EventKey,
    handler: HandlerId,
    invoker: Arc<dyn HandlerInvoker>,
}

impl SubscriptionBinding {
    pub fn event_key(&self) -> &EventKey {
        &self.event_key
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub(crate) fn invoker(&self) -> &Arc<dyn HandlerInvoker> {
        &self.invoker
    }
}

impl PartialEq for SubscriptionBinding {
    fn eq(&self, other: &Self) -> bool {
        self.event_key == other.event_key && self.handler == other.handler
    }
}

impl Eq for SubscriptionBinding {}

impl fmt::Debug for SubscriptionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBinding")
            .field("event_key", &self.event_key)
            .field("handler", &self.handler)
            .finish()
    }
}

/// Result of a successful [`SubscriptionRegistry::add_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub event_key: EventKey,
    /// Whether this binding created the key.
    pub first_for_key: bool,
}

/// Result of a successful [`SubscriptionRegistry::remove_subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Other bindings remain for the key.
    BindingRemoved { event_key: EventKey, remaining: usize },
    /// The last binding was removed and the key is gone.
    KeyRemoved(EventKey),
}

impl Removal {
    pub fn event_key(&self) -> &EventKey {
        match self {
            Self::BindingRemoved { event_key, .. } | Self::KeyRemoved(event_key) => event_key,
        }
    }

    pub fn key_removed(&self) -> bool {
        matches!(self, Self::KeyRemoved(_))
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<EventKey, Vec<SubscriptionBinding>>,
    event_types: HashMap<EventKey, EventTypeEntry>,
}

/// Thread-safe subscription registry.
pub struct SubscriptionRegistry {
    names: EventNameProcessor,
    state: RwLock<RegistryState>,
    removals: broadcast::Sender<EventKey>,
}

impl SubscriptionRegistry {
    pub fn new(names: EventNameProcessor) -> Self {
        let (removals, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            names,
            state: RwLock::new(RegistryState::default()),
            removals,
        }
    }

    pub fn names(&self) -> &EventNameProcessor {
        &self.names
    }

    /// Event key the registry uses for `E`.
    pub fn key_for<E: IntegrationEvent>(&self) -> EventKey {
        self.names.normalize(E::event_name())
    }

    /// Bind handler `H` to event type `E`.
    ///
    /// # Errors
    ///
    /// - `DuplicateSubscription` if `H` is already bound to the key
    /// - `KeyConflict` if another event type already owns the normalized key
    pub fn add_subscription<E, H>(
        &self,
        event_type: EventTypeEntry,
    ) -> Result<Registration, RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_key = self.key_for::<E>();
        let handler = HandlerId::of::<H>();
        let mut state = self.state.write();

        if let Some(existing) = state.event_types.get(&event_key) {
            if existing.type_id != TypeId::of::<E>() {
                return Err(RegistryError::KeyConflict {
                    event_key,
                    registered: existing.type_name,
                    requested: E::event_name(),
                });
            }
        }

        let bindings = state.handlers.entry(event_key.clone()).or_default();
        if bindings.iter().any(|b| b.handler == handler) {
            return Err(RegistryError::DuplicateSubscription {
                event_key,
                handler: handler.name(),
            });
        }

        let first_for_key = bindings.is_empty();
        bindings.push(SubscriptionBinding {
            event_key: event_key.clone(),
            handler,
            invoker: Arc::new(TypedInvoker::<E, H>::new()),
        });
        state
            .event_types
            .entry(event_key.clone())
            .or_insert(event_type);

        debug!(
            event_key = %event_key,
            handler = handler.name(),
            first_for_key,
            "Subscription added"
        );

        Ok(Registration {
            event_key,
            first_for_key,
        })
    }

    /// Unbind handler `H` from event type `E`.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` if the key has no bindings or `H` is not bound
    pub fn remove_subscription<E, H>(&self) -> Result<Removal, RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_key = self.key_for::<E>();
        let handler = HandlerId::of::<H>();

        let removal = {
            let mut state = self.state.write();
            let not_found = || RegistryError::SubscriptionNotFound {
                event_key: event_key.clone(),
                handler: handler.name(),
            };

            let bindings = state.handlers.get_mut(&event_key).ok_or_else(not_found)?;
            let position = bindings
                .iter()
                .position(|b| b.handler == handler)
                .ok_or_else(not_found)?;
            bindings.remove(position);

            if bindings.is_empty() {
                state.handlers.remove(&event_key);
                state.event_types.remove(&event_key);
                Removal::KeyRemoved(event_key.clone())
            } else {
                Removal::BindingRemoved {
                    event_key: event_key.clone(),
                    remaining: bindings.len(),
                }
            }
        };

        debug!(event_key = %event_key, handler = handler.name(), "Subscription removed");

        if removal.key_removed() {
            // Nobody listening is fine.
            let _ = self.removals.send(event_key);
        }

        Ok(removal)
    }

    pub fn has_subscription(&self, event_key: &str) -> bool {
        self.state.read().handlers.contains_key(event_key)
    }

    /// Bindings for a key, in subscription order.
    pub fn handlers_for(&self, event_key: &str) -> Result<Vec<SubscriptionBinding>, RegistryError> {
        self.state
            .read()
            .handlers
            .get(event_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownEventKey {
                event_key: EventKey::new(event_key),
            })
    }

    pub fn event_type_for(&self, event_key: &str) -> Result<EventTypeEntry, RegistryError> {
        self.state
            .read()
            .event_types
            .get(event_key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownEventKey {
                event_key: EventKey::new(event_key),
            })
    }

    pub fn binding_count(&self, event_key: &str) -> usize {
        self.state
            .read()
            .handlers
            .get(event_key)
            .map_or(0, Vec::len)
    }

    pub fn event_keys(&self) -> Vec<EventKey> {
        let mut keys: Vec<EventKey> = self.state.read().handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop every binding. No removal notifications are raised.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.handlers.clear();
        state.event_types.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().handlers.is_empty()
    }

    /// Watch "key removed" notifications.
    pub fn subscribe_removals(&self) -> broadcast::Receiver<EventKey> {
        self.removals.subscribe()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("names", &self.names)
            .field("event_keys", &self.event_keys())
            .finish()
    }
}
