//! # Integration Events
//!
//! Defines the contract every event published through the bus implements.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key holding the producing application's name.
pub const META_APP_NAME: &str = "app_name";

/// Metadata key holding the producing host's name.
pub const META_HOST_NAME: &str = "host_name";

/// Metadata key holding the deployment environment.
pub const META_ENVIRONMENT: &str = "environment";

/// An event describing a fact that occurred, exchanged between components.
///
/// Implementors are plain data structs. The bus routes them by
/// [`IntegrationEvent::event_name`] after prefix/suffix trimming.
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderPlacedEvent {
///     header: EventHeader,
///     order_id: u64,
/// }
///
/// impl IntegrationEvent for OrderPlacedEvent {
///     fn header(&self) -> &EventHeader {
///         &self.header
///     }
/// }
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The identity and metadata block of this event.
    fn header(&self) -> &EventHeader;

    /// The raw type name used to derive the wire event key.
    ///
    /// Defaults to the unqualified Rust type name (`OrderPlacedEvent`).
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Shortcut for `header().id`.
    fn id(&self) -> Uuid {
        self.header().id
    }
}

/// Strips the module path (and any generic arguments) from a type name.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Identity, creation time and free-form metadata of an integration event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Globally unique event id, generated at construction.
    pub id: Uuid,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// String metadata, seeded from a [`MetadataSeed`] and extensible by producers.
    pub metadata: HashMap<String, String>,
}

impl EventHeader {
    /// Create a header seeded with application, host and environment names.
    #[must_use]
    pub fn new(seed: &MetadataSeed) -> Self {
        let mut header = Self::bare();
        header
            .metadata
            .insert(META_APP_NAME.to_string(), seed.app_name.clone());
        header
            .metadata
            .insert(META_HOST_NAME.to_string(), seed.host_name.clone());
        header
            .metadata
            .insert(META_ENVIRONMENT.to_string(), seed.environment.clone());
        header
    }

    /// Create a header with a fresh id and timestamp but no metadata.
    #[must_use]
    pub fn bare() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Add (or overwrite) a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::bare()
    }
}

/// Values used to pre-populate event metadata.
///
/// Supplied by the caller (usually from configuration) rather than read from
/// the process environment at event construction time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataSeed {
    /// Name of the producing application.
    pub app_name: String,
    /// Name of the producing host.
    pub host_name: String,
    /// Deployment environment (e.g. `development`, `production`).
    pub environment: String,
}

impl MetadataSeed {
    /// Create a seed from explicit values.
    pub fn new(
        app_name: impl Into<String>,
        host_name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            host_name: host_name.into(),
            environment: environment.into(),
        }
    }
}
