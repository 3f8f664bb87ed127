//! Event name normalization.
//!
//! Turns a Rust event type name into the wire event key by trimming the
//! configured prefix and suffix.

use crate::config::{EventBusConfig, TrimMode};
use std::fmt;

/// Normalized wire name of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey(String);

impl EventKey {
    /// Wrap an already-normalized key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for EventKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Pure, deterministic event-name normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventNameProcessor {
    prefix: String,
    suffix: String,
    mode: TrimMode,
}

impl EventNameProcessor {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>, mode: TrimMode) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            mode,
        }
    }

    pub fn from_config(config: &EventBusConfig) -> Self {
        Self::new(
            config.event_name_prefix.clone(),
            config.event_name_suffix.clone(),
            config.trim_mode,
        )
    }

    /// Normalize a raw type name into an event key. May return an empty key.
    pub fn normalize(&self, raw_name: &str) -> EventKey {
        let trimmed = match self.mode {
            TrimMode::ExactAffix => self.trim_exact(raw_name),
            TrimMode::CharacterSet => self.trim_char_set(raw_name),
        };
        EventKey(trimmed.to_string())
    }

    fn trim_exact<'a>(&self, name: &'a str) -> &'a str {
        let mut name = name;
        if !self.prefix.is_empty() {
            name = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);
        }
        if !self.suffix.is_empty() {
            name = name.strip_suffix(self.suffix.as_str()).unwrap_or(name);
        }
        name
    }

    fn trim_char_set<'a>(&self, name: &'a str) -> &'a str {
        let mut name = name;
        if !self.prefix.is_empty() {
            name = name.trim_start_matches(|c: char| self.prefix.contains(c));
        }
        if !self.suffix.is_empty() {
            name = name.trim_end_matches(|c: char| self.suffix.contains(c));
        }
        name
    }
}
