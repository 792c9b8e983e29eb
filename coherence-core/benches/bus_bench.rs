//! Benchmarks for the event bus and engine tick path
//!
//! Compares exact-type listeners against namespace-wide listeners.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use coherence_core::{
    BusConfig, EngineConfig, EventBus, EventPayload, ManualTimerBackend, MovingAverage,
    PeriodicEngine, SmoothedInput, Smoother,
};

fn bus_with_listeners(exact: usize, wildcard: usize) -> EventBus {
    let bus = EventBus::default();
    for _ in 0..exact {
        bus.subscribe("consciousness:update", |event| {
            black_box(event.sequence);
            Ok(())
        })
        .unwrap();
    }
    for _ in 0..wildcard {
        bus.subscribe("consciousness:*", |event| {
            black_box(event.sequence);
            Ok(())
        })
        .unwrap();
    }
    bus
}

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");

    for listeners in [0usize, 1, 8, 32] {
        let bus = bus_with_listeners(listeners, 0);
        group.bench_function(BenchmarkId::new("exact", listeners), |b| {
            b.iter(|| {
                bus.emit("consciousness:update", EventPayload::values([("level", 0.5)]))
                    .unwrap()
            })
        });

        let bus = bus_with_listeners(0, listeners);
        group.bench_function(BenchmarkId::new("wildcard", listeners), |b| {
            b.iter(|| {
                bus.emit("consciousness:update", EventPayload::values([("level", 0.5)]))
                    .unwrap()
            })
        });
    }

    group.finish();
}

fn bench_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("history");

    for capacity in [100usize, 1000] {
        let bus = EventBus::new(BusConfig::new().history_capacity(capacity)).unwrap();
        for i in 0..capacity {
            let event_type = if i % 2 == 0 { "a:update" } else { "b:update" };
            bus.emit(event_type, EventPayload::values([("i", i as f64)]))
                .unwrap();
        }
        group.bench_function(BenchmarkId::new("filtered", capacity), |b| {
            b.iter(|| black_box(bus.history(Some("a:"))))
        });
    }

    group.finish();
}

fn bench_engine_tick(c: &mut Criterion) {
    let bus = Arc::new(bus_with_listeners(4, 4));
    let backend = Arc::new(ManualTimerBackend::new());
    let input = SmoothedInput::new(MovingAverage::new(10).unwrap(), 0.5);
    let handle = input.handle();
    let engine = PeriodicEngine::builder(EngineConfig::new("consciousness").interval_ms(10))
        .source(input)
        .backend(backend.clone())
        .bus(bus)
        .build()
        .unwrap();
    engine.start().unwrap();

    c.bench_function("engine_tick", |b| {
        let mut x = 0.0f64;
        b.iter(|| {
            x = (x + 0.01) % 1.0;
            handle.push(x).unwrap();
            black_box(backend.advance(Duration::from_millis(10)))
        })
    });

    engine.destroy().unwrap();
}

fn bench_smoothers(c: &mut Criterion) {
    c.bench_function("moving_average_push", |b| {
        let mut smoother = MovingAverage::new(64).unwrap();
        let mut x = 0.0f64;
        b.iter(|| {
            x += 0.001;
            black_box(smoother.push(x))
        })
    });
}

criterion_group!(
    benches,
    bench_emit,
    bench_history,
    bench_engine_tick,
    bench_smoothers,
);

criterion_main!(benches);
