//! # Event Bus Configuration
//!
//! Immutable configuration snapshot shared (read-only) by every component of a
//! bus for its whole lifetime. Built once through [`EventBusConfigBuilder`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default number of retries after the first connect/send attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Default topic (exchange) name.
pub const DEFAULT_TOPIC: &str = "event_bus";

/// Default grace period for a consumer loop to exit after being stopped.
pub const DEFAULT_CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How event-name prefixes and suffixes are trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimMode {
    /// Strip the configured prefix/suffix once, as an exact substring.
    #[default]
    ExactAffix,
    /// Strip any leading/trailing characters that occur in the prefix/suffix.
    ///
    /// Matches the legacy wire naming, and over-trims names whose body shares
    /// characters with the affix (`PaymentEvent` with suffix `Event` becomes `Paym`).
    CharacterSet,
}

/// Exponential backoff between retry attempts.
///
/// `delay(attempt) = unit * base^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Exponent base.
    pub base: u32,
    /// Unit multiplied by `base^attempt`.
    pub unit: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Delay to wait before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.base.checked_pow(attempt).unwrap_or(u32::MAX);
        self.unit
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 2,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Acknowledgement behavior of broker-backed consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Requeue deliveries whose payload could not be dispatched (decode failure).
    pub requeue_on_dispatch_failure: bool,
    /// Acknowledge deliveries even when some handlers failed.
    pub ack_on_handler_failure: bool,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            requeue_on_dispatch_failure: true,
            ack_on_handler_failure: true,
        }
    }
}

/// Opaque broker connection string, handed to the broker client untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    /// Wrap a connection string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw connection string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionDescriptor {
    // Connection strings routinely embed credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = self.0.split("://").next().unwrap_or("");
        write!(f, "ConnectionDescriptor({scheme}://***)")
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The default topic name is empty.
    #[error("Default topic name must not be empty")]
    EmptyTopic,

    /// The subscriber application name is empty.
    #[error("Subscriber application name must not be empty")]
    EmptySubscriberName,

    /// The backoff base is zero.
    #[error("Backoff base must be at least 1")]
    InvalidBackoff,
}

/// Immutable event bus configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Retries after the first connect or send attempt.
    pub retry_count: u32,
    /// Topic (exchange) events are published to.
    pub default_topic: String,
    /// Application name used to derive this subscriber's queue name.
    pub subscriber_app_name: String,
    /// Prefix trimmed from event type names.
    pub event_name_prefix: String,
    /// Suffix trimmed from event type names.
    pub event_name_suffix: String,
    /// How prefix/suffix are trimmed.
    pub trim_mode: TrimMode,
    /// Backoff between retries.
    pub backoff: BackoffPolicy,
    /// Grace period for a stopped consumer loop to exit.
    pub consumer_stop_timeout: Duration,
    /// Broker acknowledgement behavior.
    pub ack_policy: AckPolicy,
    /// Broker connection, absent for in-process buses.
    pub connection: Option<ConnectionDescriptor>,
}

impl EventBusConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> EventBusConfigBuilder {
        EventBusConfigBuilder::default()
    }

    /// Queue owned by this subscriber application on the default topic.
    #[must_use]
    pub fn queue_name(&self) -> String {
        format!("{}.{}", self.subscriber_app_name, self.default_topic)
    }

    /// Wrap in an `Arc` for sharing between components.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            default_topic: DEFAULT_TOPIC.to_string(),
            subscriber_app_name: "event-bus".to_string(),
            event_name_prefix: String::new(),
            event_name_suffix: String::new(),
            trim_mode: TrimMode::default(),
            backoff: BackoffPolicy::default(),
            consumer_stop_timeout: DEFAULT_CONSUMER_STOP_TIMEOUT,
            ack_policy: AckPolicy::default(),
            connection: None,
        }
    }
}

/// Builder for [`EventBusConfig`].
#[derive(Debug, Clone, Default)]
pub struct EventBusConfigBuilder {
    config: EventBusConfig,
}

impl EventBusConfigBuilder {
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    pub fn default_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.default_topic = topic.into();
        self
    }

    pub fn subscriber_app_name(mut self, name: impl Into<String>) -> Self {
        self.config.subscriber_app_name = name.into();
        self
    }

    pub fn event_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.event_name_prefix = prefix.into();
        self
    }

    pub fn event_name_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.event_name_suffix = suffix.into();
        self
    }

    pub fn trim_mode(mut self, mode: TrimMode) -> Self {
        self.config.trim_mode = mode;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn consumer_stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.consumer_stop_timeout = timeout;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.config.ack_policy = policy;
        self
    }

    pub fn connection(mut self, descriptor: ConnectionDescriptor) -> Self {
        self.config.connection = Some(descriptor);
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<EventBusConfig, ConfigError> {
        if self.config.default_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.config.subscriber_app_name.trim().is_empty() {
            return Err(ConfigError::EmptySubscriberName);
        }
        if self.config.backoff.base == 0 {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(self.config)
    }
}
