//! # Bus Runtime
//!
//! Entry point for the integration event bus.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry (logging and metrics)
//! 2. Load settings from the environment
//! 3. Register handlers in the container
//! 4. Build the selected transport (in-process or broker)
//! 5. Subscribe handlers and publish a demo batch
//! 6. Run until Ctrl+C, then shut down gracefully

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use bus_runtime::{register_handlers, BusRuntime, BusSettings, HandlerStats, TransportKind};
use bus_telemetry::{encode_metrics, init_telemetry, TelemetryConfig};
use event_bus::{BrokerEventBus, EventBus, HandlerContainer, InMemoryBroker, InMemoryEventBus};

/// Orders published by the demo batch.
const DEMO_ORDERS: u64 = 8;

async fn serve<B: EventBus + 'static>(runtime: BusRuntime<B>) -> Result<()> {
    runtime.start().await.context("Failed to subscribe handlers")?;
    runtime
        .run_demo(DEMO_ORDERS)
        .await
        .context("Demo batch failed")?;

    info!("Bus runtime is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await;

    match encode_metrics() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => warn!("Failed to encode metrics: {}", e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env().with_service_name("bus-runtime"))
        .context("Failed to initialize telemetry")?;

    let settings = BusSettings::from_env().context("Invalid runtime settings")?;
    let config = settings
        .to_bus_config()
        .context("Invalid event bus configuration")?
        .shared();
    info!(
        transport = %settings.transport,
        queue = %config.queue_name(),
        retry_count = config.retry_count,
        "Loaded configuration"
    );

    let stats = Arc::new(HandlerStats::default());
    let handlers = Arc::new(HandlerContainer::new());
    register_handlers(&handlers, &stats);
    let seed = settings.metadata_seed();

    match settings.transport {
        TransportKind::InMemory => {
            let bus = Arc::new(InMemoryEventBus::new(config, handlers));
            let registry = bus.registry().clone();
            serve(BusRuntime::new(bus, registry, seed, stats)).await
        }
        TransportKind::Broker => {
            // Only the in-process broker ships with this crate.
            let client = Arc::new(InMemoryBroker::new());
            let bus = Arc::new(BrokerEventBus::new(config, client, handlers));
            let registry = bus.registry().clone();
            serve(BusRuntime::new(bus, registry, seed, stats)).await
        }
    }
}
