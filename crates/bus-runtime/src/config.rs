//! # Runtime Settings
//!
//! Environment-driven settings for the bus runtime, converted into an
//! [`EventBusConfig`] and a [`MetadataSeed`] at startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `EVENTBUS_TRANSPORT` | `in_memory` |
//! | `EVENTBUS_APP_NAME` | `bus-runtime` |
//! | `EVENTBUS_TOPIC` | `event_bus` |
//! | `EVENTBUS_RETRY_COUNT` | `5` |
//! | `EVENTBUS_EVENT_PREFIX` | empty |
//! | `EVENTBUS_EVENT_SUFFIX` | `IntegrationEvent` |
//! | `EVENTBUS_CONNECTION` | `memory://local` (broker transport only) |
//! | `EVENTBUS_ENVIRONMENT` | `development` |
//! | `HOSTNAME` | `localhost` |

use bus_types::MetadataSeed;
use event_bus::config::{DEFAULT_RETRY_COUNT, DEFAULT_TOPIC};
use event_bus::{ConfigError, ConnectionDescriptor, EventBusConfig};
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Descriptor used by the broker transport when none is configured.
pub const DEFAULT_BROKER_CONNECTION: &str = "memory://local";

/// Settings errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Unknown transport '{0}', expected 'in_memory' or 'broker'")]
    UnknownTransport(String),

    #[error("Invalid value '{value}' for {variable}")]
    InvalidValue {
        variable: &'static str,
        value: String,
    },
}

/// Which transport the runtime wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Per-key channels inside this process.
    #[default]
    InMemory,
    /// Broker-backed transport with a resilient connection.
    Broker,
}

impl FromStr for TransportKind {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "in_memory" | "memory" | "inprocess" | "in_process" => Ok(Self::InMemory),
            "broker" => Ok(Self::Broker),
            _ => Err(SettingsError::UnknownTransport(value.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => f.write_str("in_memory"),
            Self::Broker => f.write_str("broker"),
        }
    }
}

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub transport: TransportKind,
    /// Subscriber application name; also the `app_name` metadata value.
    pub app_name: String,
    pub topic: String,
    pub retry_count: u32,
    pub event_prefix: String,
    pub event_suffix: String,
    /// Broker connection descriptor. Ignored by the in-process transport.
    pub connection: Option<String>,
    pub environment: String,
    pub host_name: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::InMemory,
            app_name: "bus-runtime".to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            retry_count: DEFAULT_RETRY_COUNT,
            event_prefix: String::new(),
            event_suffix: "IntegrationEvent".to_string(),
            connection: None,
            environment: "development".to_string(),
            host_name: "localhost".to_string(),
        }
    }
}

impl BusSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(value) = lookup("EVENTBUS_TRANSPORT") {
            settings.transport = value.parse()?;
        }
        if let Some(value) = lookup("EVENTBUS_APP_NAME") {
            settings.app_name = value;
        }
        if let Some(value) = lookup("EVENTBUS_TOPIC") {
            settings.topic = value;
        }
        if let Some(value) = lookup("EVENTBUS_RETRY_COUNT") {
            settings.retry_count =
                value
                    .trim()
                    .parse()
                    .map_err(|_| SettingsError::InvalidValue {
                        variable: "EVENTBUS_RETRY_COUNT",
                        value,
                    })?;
        }
        if let Some(value) = lookup("EVENTBUS_EVENT_PREFIX") {
            settings.event_prefix = value;
        }
        if let Some(value) = lookup("EVENTBUS_EVENT_SUFFIX") {
            settings.event_suffix = value;
        }
        if let Some(value) = lookup("EVENTBUS_CONNECTION") {
            settings.connection = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup("EVENTBUS_ENVIRONMENT") {
            settings.environment = value;
        }
        if let Some(value) = lookup("HOSTNAME") {
            settings.host_name = value;
        }

        Ok(settings)
    }

    /// Build the bus configuration.
    ///
    /// The broker transport falls back to [`DEFAULT_BROKER_CONNECTION`].
    pub fn to_bus_config(&self) -> Result<EventBusConfig, ConfigError> {
        let mut builder = EventBusConfig::builder()
            .retry_count(self.retry_count)
            .default_topic(self.topic.clone())
            .subscriber_app_name(self.app_name.clone())
            .event_name_prefix(self.event_prefix.clone())
            .event_name_suffix(self.event_suffix.clone());

        let descriptor = match (self.transport, &self.connection) {
            (_, Some(connection)) => Some(connection.clone()),
            (TransportKind::Broker, None) => Some(DEFAULT_BROKER_CONNECTION.to_string()),
            (TransportKind::InMemory, None) => None,
        };
        if let Some(descriptor) = descriptor {
            builder = builder.connection(ConnectionDescriptor::new(descriptor));
        }

        builder.build()
    }

    /// Metadata stamped on every event this runtime publishes.
    pub fn metadata_seed(&self) -> MetadataSeed {
        MetadataSeed::new(
            self.app_name.clone(),
            self.host_name.clone(),
            self.environment.clone(),
        )
    }
}
