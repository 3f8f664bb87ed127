//! # Domain Layer - Event Bus Core
//!
//! Transport-agnostic logic shared by every backend.
//!
//! ## Components
//!
//! - `naming`: EventNameProcessor and EventKey
//! - `registry`: SubscriptionRegistry with key-removal notifications
//! - `handlers`: IntegrationEventHandler trait and HandlerContainer
//! - `dispatch`: DispatchEngine with per-handler failure isolation
//! - `errors`: Registry, connection and dispatch error enumerations

pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod naming;
pub mod registry;

pub use dispatch::*;
pub use errors::*;
pub use handlers::{HandlerContainer, HandlerId, IntegrationEventHandler, SharedEvent};
pub use naming::*;
pub use registry::*;
