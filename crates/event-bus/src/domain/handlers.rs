//! Event handlers and the container that resolves them.
//!
//! A subscription is identified by the handler's *type*; the live instance is
//! resolved from a [`HandlerContainer`] each time an event is dispatched.

use async_trait::async_trait;
use bus_types::{HandlerError, IntegrationEvent};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// A decoded event shared between the handlers of one delivery.
pub type SharedEvent = Arc<dyn Any + Send + Sync>;

/// Handles one integration event type.
///
/// Handlers receive their own clone of the event and must not rely on
/// observing mutations made by sibling handlers.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

/// Identity of a handler type.
#[derive(Clone, Copy)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    pub fn of<H: 'static>() -> Self {
        let full = std::any::type_name::<H>();
        let base = full.split('<').next().unwrap_or(full);
        Self {
            type_id: TypeId::of::<H>(),
            name: base.rsplit("::").next().unwrap_or(base),
        }
    }

    /// Unqualified type name, for logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for HandlerId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerId {}

impl Hash for HandlerId {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

type ErasedInstance = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Provider {
    Singleton(ErasedInstance),
    Factory(Arc<dyn Fn() -> ErasedInstance + Send + Sync>),
}

/// Resolves handler types to live instances.
///
/// Handlers are registered either as a shared singleton or as a factory that
/// builds a fresh instance for every invocation.
#[derive(Default)]
pub struct HandlerContainer {
    providers: RwLock<HashMap<TypeId, Provider>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a singleton instance, replacing any previous registration.
    pub fn register<H: Send + Sync + 'static>(&self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    /// Register an already shared singleton instance.
    pub fn register_arc<H: Send + Sync + 'static>(&self, handler: Arc<H>) {
        self.providers
            .write()
            .insert(TypeId::of::<H>(), Provider::Singleton(handler));
    }

    /// Register a factory invoked on every resolution.
    pub fn register_factory<H, F>(&self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let erased = move || -> ErasedInstance { Arc::new(factory()) };
        self.providers
            .write()
            .insert(TypeId::of::<H>(), Provider::Factory(Arc::new(erased)));
    }

    pub fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        // Cloned out so factories run without holding the lock.
        let provider = self.providers.read().get(&TypeId::of::<H>())?.clone();
        let instance = match provider {
            Provider::Singleton(instance) => instance,
            Provider::Factory(factory) => factory(),
        };
        instance.downcast::<H>().ok()
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.providers.read().contains_key(&TypeId::of::<H>())
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

impl fmt::Debug for HandlerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContainer")
            .field("registrations", &self.len())
            .finish()
    }
}

/// Type-erased call into one handler type, built once at subscribe time.
#[async_trait]
pub(crate) trait HandlerInvoker: Send + Sync {
    async fn invoke(
        &self,
        container: &HandlerContainer,
        event: &SharedEvent,
    ) -> Result<(), HandlerError>;
}

pub(crate) struct TypedInvoker<E, H> {
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H> TypedInvoker<E, H> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(
        &self,
        container: &HandlerContainer,
        event: &SharedEvent,
    ) -> Result<(), HandlerError> {
        let event = event
            .downcast_ref::<E>()
            .ok_or_else(|| HandlerError::rejected("event type does not match subscription"))?
            .clone();
        let handler = container
            .resolve::<H>()
            .ok_or(HandlerError::Unresolved(HandlerId::of::<H>().name()))?;
        handler.handle(event).await
    }
}
