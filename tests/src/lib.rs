//! # Event Bus Test Suite
//!
//! Cross-crate scenarios run against every transport.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs            # Events, recording handlers, bus builders
//! └── integration/
//!     ├── transport_contract.rs  # Same scenarios on both transports
//!     ├── broker_resilience.rs   # Reconnects, consumer recovery, redelivery
//!     └── concurrency.rs         # Subscribe/unsubscribe racing publish
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p bus-tests
//!
//! # By category
//! cargo test -p bus-tests integration::transport_contract::
//! cargo test -p bus-tests integration::broker_resilience::
//!
//! # Benchmarks
//! cargo bench -p bus-tests
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod fixtures;
pub mod integration;
