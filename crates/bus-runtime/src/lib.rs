//! # Bus Runtime
//!
//! Wiring for the integration event bus binary.
//!
//! ## Modules
//!
//! - `config` - `BusSettings` loaded from `EVENTBUS_*` environment variables
//! - `handlers` - Order events and the handlers bound to them
//! - `runtime` - `BusRuntime`: subscribe, publish a demo batch, shut down

pub mod config;
pub mod handlers;
pub mod runtime;

pub use config::{BusSettings, SettingsError, TransportKind};
pub use handlers::{register_handlers, HandlerStats};
pub use runtime::{BusRuntime, DemoSummary};
