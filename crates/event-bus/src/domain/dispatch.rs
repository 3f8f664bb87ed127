//! # Dispatch Engine
//!
//! Turns an inbound delivery (event key + payload, or an already decoded
//! event) into handler invocations.
//!
//! ## Failure isolation
//!
//! Handlers run one after another in subscription order. A handler that
//! returns an error, cannot be resolved, or panics is recorded in the
//! [`DispatchReport`] and the remaining handlers still run.

use super::errors::{DispatchError, HandlerInvocationError};
use super::handlers::{HandlerContainer, SharedEvent};
use super::naming::EventKey;
use super::registry::{SubscriptionBinding, SubscriptionRegistry};
use bus_types::HandlerError;
use bus_telemetry::metric_inc;
use bus_telemetry::metrics::{DISPATCH_DURATION, EVENTS_DISPATCHED, HANDLER_FAILURES};
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_key: EventKey,
    /// Handlers that were invoked (successfully or not).
    pub handlers_invoked: usize,
    /// One entry per failed handler.
    pub failures: Vec<HandlerInvocationError>,
}

impl DispatchReport {
    /// Report for an event no local handler is subscribed to.
    pub fn unmatched(event_key: EventKey) -> Self {
        Self {
            event_key,
            handlers_invoked: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_unmatched(&self) -> bool {
        self.handlers_invoked == 0
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

/// Resolves event types and invokes every bound handler.
#[derive(Debug, Clone)]
pub struct DispatchEngine {
    registry: Arc<SubscriptionRegistry>,
    handlers: Arc<HandlerContainer>,
}

impl DispatchEngine {
    pub fn new(registry: Arc<SubscriptionRegistry>, handlers: Arc<HandlerContainer>) -> Self {
        Self { registry, handlers }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Decode `payload` and invoke every handler bound to `event_name`.
    ///
    /// An unsubscribed key is a successful no-op.
    ///
    /// # Errors
    ///
    /// `DispatchError::Deserialization` if the payload does not decode into
    /// the registered event type. No handler runs in that case.
    pub async fn process(
        &self,
        event_name: &str,
        payload: &[u8],
    ) -> Result<DispatchReport, DispatchError> {
        let event_key = self.registry.names().normalize(event_name);
        self.process_key(event_key, payload).await
    }

    /// Like [`DispatchEngine::process`] for a key that is already normalized,
    /// such as a broker routing key.
    ///
    /// # Errors
    ///
    /// `DispatchError::Deserialization` if the payload does not decode.
    pub async fn process_key(
        &self,
        event_key: EventKey,
        payload: &[u8],
    ) -> Result<DispatchReport, DispatchError> {
        if !self.registry.has_subscription(event_key.as_str()) {
            debug!(event_key = %event_key, "No subscription, dropping event");
            return Ok(DispatchReport::unmatched(event_key));
        }

        // The last binding may be removed between the check and the lookup.
        let Ok(event_type) = self.registry.event_type_for(event_key.as_str()) else {
            return Ok(DispatchReport::unmatched(event_key));
        };

        let event = event_type
            .decode(payload)
            .map_err(|source| DispatchError::Deserialization {
                event_key: event_key.clone(),
                source,
            })?;

        Ok(self.invoke_all(event_key, &event).await)
    }

    /// Invoke every handler bound to `event_key` with an already decoded event.
    ///
    /// # Errors
    ///
    /// `DispatchError::TypeMismatch` if `event` is not the type registered
    /// under `event_key`.
    pub async fn process_event(
        &self,
        event_key: &EventKey,
        event: &SharedEvent,
    ) -> Result<DispatchReport, DispatchError> {
        let Ok(event_type) = self.registry.event_type_for(event_key.as_str()) else {
            debug!(event_key = %event_key, "No subscription, dropping event");
            return Ok(DispatchReport::unmatched(event_key.clone()));
        };

        let actual: TypeId = Any::type_id(&**event);
        if actual != event_type.type_id() {
            return Err(DispatchError::TypeMismatch {
                event_key: event_key.clone(),
                expected: event_type.type_name(),
            });
        }

        Ok(self.invoke_all(event_key.clone(), event).await)
    }

    async fn invoke_all(&self, event_key: EventKey, event: &SharedEvent) -> DispatchReport {
        let Ok(bindings) = self.registry.handlers_for(event_key.as_str()) else {
            return DispatchReport::unmatched(event_key);
        };

        let _timer = DISPATCH_DURATION
            .with_label_values(&[event_key.as_str()])
            .start_timer();

        let mut failures = Vec::new();
        for binding in &bindings {
            if let Err(reason) = self.invoke_one(binding, event).await {
                warn!(
                    event_key = %event_key,
                    handler = binding.handler().name(),
                    error = %reason,
                    "Handler failed"
                );
                metric_inc!(
                    HANDLER_FAILURES,
                    &[event_key.as_str(), binding.handler().name()]
                );
                failures.push(HandlerInvocationError {
                    event_key: event_key.clone(),
                    handler: binding.handler().name(),
                    reason,
                });
            }
        }

        metric_inc!(EVENTS_DISPATCHED, &[event_key.as_str()]);
        debug!(
            event_key = %event_key,
            handlers = bindings.len(),
            failed = failures.len(),
            "Event dispatched"
        );

        DispatchReport {
            event_key,
            handlers_invoked: bindings.len(),
            failures,
        }
    }

    async fn invoke_one(
        &self,
        binding: &SubscriptionBinding,
        event: &SharedEvent,
    ) -> Result<(), String> {
        let call = binding.invoker().invoke(&self.handlers, event);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                Err(HandlerError::Panicked(panic_message(panic.as_ref()).to_string()).to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
