//! Integration scenarios.

pub mod broker_resilience;
pub mod concurrency;
pub mod transport_contract;
