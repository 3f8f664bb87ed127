//! # Event Bus Benchmarks
//!
//! | Path | Operation |
//! |------|-----------|
//! | Naming | `EventNameProcessor::normalize` in both trim modes |
//! | Registry | `has_subscription` + `handlers_for` lookup |
//! | Dispatch | Decode a JSON payload and invoke N handlers |
//! | In-process publish | `InMemoryEventBus::publish` until handled |

use bus_tests::fixtures::{
    bus_config, handler_container, AuditHandler, BillingHandler, InvocationLog, OrderPlacedEvent,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_bus::domain::EventTypeEntry;
use event_bus::{
    DispatchEngine, EventBus, EventNameProcessor, EventSerializer, InMemoryEventBus,
    JsonSerializer, SubscriptionRegistry, TrimMode,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_name_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("naming");

    for mode in [TrimMode::ExactAffix, TrimMode::CharacterSet] {
        let names = EventNameProcessor::new("Integration", "Event", mode);
        group.bench_with_input(
            BenchmarkId::new("normalize", format!("{mode:?}")),
            &names,
            |b, names| b.iter(|| black_box(names.normalize(black_box("IntegrationOrderPlacedEvent")))),
        );
    }

    group.finish();
}

fn registry_with_bindings() -> Arc<SubscriptionRegistry> {
    let config = bus_config(None);
    let registry = Arc::new(SubscriptionRegistry::new(EventNameProcessor::from_config(
        &config,
    )));
    let serializer = Arc::new(JsonSerializer);
    registry
        .add_subscription::<OrderPlacedEvent, AuditHandler>(EventTypeEntry::new::<
            OrderPlacedEvent,
            _,
        >(serializer.clone()))
        .expect("audit binding");
    registry
        .add_subscription::<OrderPlacedEvent, BillingHandler>(EventTypeEntry::new::<
            OrderPlacedEvent,
            _,
        >(serializer))
        .expect("billing binding");
    registry
}

fn bench_registry_lookup(c: &mut Criterion) {
    let registry = registry_with_bindings();

    c.bench_function("registry/lookup_hit", |b| {
        b.iter(|| {
            let key = black_box("OrderPlaced");
            black_box(registry.has_subscription(key) && registry.handlers_for(key).is_ok())
        })
    });
    c.bench_function("registry/lookup_miss", |b| {
        b.iter(|| black_box(registry.has_subscription(black_box("StockDepleted"))))
    });
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let log = Arc::new(InvocationLog::default());
    let engine = DispatchEngine::new(registry_with_bindings(), handler_container(&log));
    let payload = JsonSerializer
        .serialize(&OrderPlacedEvent::new(1))
        .expect("encode");

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));
    group.bench_function("json_two_handlers", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                engine
                    .process("OrderPlacedEvent", &payload)
                    .await
                    .expect("dispatch"),
            )
        })
    });
    group.finish();
}

fn bench_in_memory_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let log = Arc::new(InvocationLog::default());
    let bus = runtime.block_on(async {
        let bus = InMemoryEventBus::new(bus_config(None), handler_container(&log));
        bus.subscribe::<OrderPlacedEvent, AuditHandler>()
            .await
            .expect("subscribe");
        bus
    });

    let mut group = c.benchmark_group("in_memory");
    group.measurement_time(Duration::from_secs(5));
    for batch in [1u64, 100] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("publish", batch), &batch, |b, &batch| {
            b.to_async(&runtime).iter(|| async {
                let target = log.len() + batch as usize;
                for order_id in 0..batch {
                    bus.publish(OrderPlacedEvent::new(order_id))
                        .await
                        .expect("publish");
                }
                while log.len() < target {
                    tokio::task::yield_now().await;
                }
            })
        });
    }
    group.finish();

    runtime.block_on(bus.dispose());
}

criterion_group!(
    benches,
    bench_name_normalization,
    bench_registry_lookup,
    bench_dispatch,
    bench_in_memory_publish
);
criterion_main!(benches);
