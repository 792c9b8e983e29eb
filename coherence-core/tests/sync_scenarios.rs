//! Cross-module scenarios: bus, engines, aggregator and recorder driven
//! together on a fake clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;

use coherence_core::{
    AggregatorConfig, AggregatorInput, EngineConfig, EventBus, EventPayload, ExportFormat,
    ExportOutcome, FieldReading, HistoryRing, ManualTimerBackend, MemoryExportSink,
    MemoryReporter, MetricAggregator, MovingAverage, PeriodicEngine, RecorderConfig,
    SessionRecorder, Smoother, SyncConfig, SyncHub, TickContext,
};

/// Source that replays `levels` then repeats the last one
fn scripted(levels: &[f64]) -> impl FnMut(&TickContext) -> FieldReading + Send {
    let mut queue: VecDeque<f64> = levels.iter().copied().collect();
    let mut last = 0.0;
    move |_: &TickContext| {
        if let Some(next) = queue.pop_front() {
            last = next;
        }
        FieldReading::new(last)
    }
}

fn engine_on(
    backend: &Arc<ManualTimerBackend>,
    bus: &Arc<EventBus>,
    config: EngineConfig,
    levels: &[f64],
) -> PeriodicEngine {
    PeriodicEngine::builder(config)
        .source(scripted(levels))
        .backend(backend.clone())
        .bus(bus.clone())
        .build()
        .unwrap()
}

#[test]
fn test_bounded_history_keeps_most_recent() {
    for (pushes, capacity) in [(3usize, 5usize), (5, 5), (12, 5), (1, 1), (40, 7)] {
        let mut ring = HistoryRing::new(capacity).unwrap();
        for i in 0..pushes {
            ring.push(i);
        }
        let expected: Vec<usize> = (pushes.saturating_sub(capacity)..pushes).collect();
        assert_eq!(ring.len(), pushes.min(capacity));
        assert_eq!(ring.snapshot(), expected);
    }

    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let levels: Vec<f64> = (0..25).map(|i| i as f64 / 100.0).collect();
    let engine = engine_on(
        &backend,
        &bus,
        EngineConfig::new("field").interval_ms(50).history_capacity(10),
        &levels,
    );
    engine.start().unwrap();
    backend.advance(Duration::from_millis(50 * 25));

    let history = engine.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history.first().unwrap().level, 0.15);
    assert_eq!(history.last().unwrap().level, 0.24);
}

#[test]
fn test_smoother_settles_on_constant() {
    let mut smoother = MovingAverage::new(8).unwrap();
    for v in [0.9, 0.1, 0.4, 0.7] {
        smoother.push(v);
    }
    let mut last = 0.0;
    for _ in 0..8 {
        last = smoother.push(0.37);
    }
    assert_eq!(last, 0.37);
}

#[test]
fn test_reregistered_subscriber_fires_once() {
    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let engine = engine_on(&backend, &bus, EngineConfig::new("field").interval_ms(100), &[0.5]);

    let old_calls = Arc::new(AtomicUsize::new(0));
    let new_calls = Arc::new(AtomicUsize::new(0));
    let counter = old_calls.clone();
    engine
        .on_update("chart", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let counter = new_calls.clone();
    engine
        .on_update("chart", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    engine.start().unwrap();
    backend.advance(Duration::from_millis(100));

    assert_eq!(old_calls.load(Ordering::SeqCst), 0);
    assert_eq!(new_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.subscriber_count(), 1);
}

#[test]
fn test_removed_subscriber_never_fires_again() {
    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let engine = engine_on(&backend, &bus, EngineConfig::new("field").interval_ms(100), &[0.5]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine
        .on_update("meter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    engine.start().unwrap();
    backend.advance(Duration::from_millis(300));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert!(engine.remove_update("meter").unwrap());
    backend.advance(Duration::from_millis(500));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.history().len(), 8);
}

#[test]
fn test_high_event_fires_once_per_upward_crossing() {
    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let engine = engine_on(
        &backend,
        &bus,
        EngineConfig::new("coherence")
            .namespace("consciousness")
            .interval_ms(100)
            .high_threshold(0.95),
        &[0.5, 0.96, 0.97, 0.99, 0.4, 0.3, 0.98, 0.99, 0.99],
    );

    let highs = Arc::new(AtomicUsize::new(0));
    let counter = highs.clone();
    bus.subscribe("consciousness:high", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    engine.start().unwrap();
    backend.advance(Duration::from_millis(100 * 12));

    assert_eq!(highs.load(Ordering::SeqCst), 2);
    assert_eq!(bus.history(Some("consciousness:high")).len(), 2);
    assert_eq!(engine.stats().threshold_crossings, 2);
}

#[test]
fn test_failing_listener_does_not_block_others() {
    let reporter = Arc::new(MemoryReporter::new());
    let bus = EventBus::default().with_reporter(reporter.clone());

    let seen = Arc::new(AtomicUsize::new(0));
    bus.subscribe("x:update", |_| Err("renderer lost its context".to_string()))
        .unwrap();
    bus.subscribe("x:update", |_| panic!("listener bug")).unwrap();
    let counter = seen.clone();
    bus.subscribe("x:update", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    bus.emit("x:update", EventPayload::values([("v", 1.0)]))
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(reporter.count_code("LISTENER_FAILURE"), 2);
}

#[test]
fn test_subscriber_copies_are_isolated() {
    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let engine = engine_on(&backend, &bus, EngineConfig::new("field").interval_ms(100), &[0.42]);

    engine
        .on_update("vandal", |mut state| {
            state.level = 99.0;
            state.markers.insert("tampered".to_string());
            Ok(())
        })
        .unwrap();
    engine.start().unwrap();
    backend.advance(Duration::from_millis(100));

    let mut copy = engine.current().unwrap();
    copy.level = -1.0;
    copy.phase = Some("forged".to_string());

    let current = engine.current().unwrap();
    assert_eq!(current.level, 0.42);
    assert!(current.phase.is_none());
    assert!(current.markers.is_empty());
}

#[test]
fn test_wildcard_listener_sees_type_and_payload() {
    let bus = EventBus::default();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.subscribe("consciousness:*", move |event| {
        sink.lock().push(event.to_flat_json());
        Ok(())
    })
    .unwrap();

    bus.emit("consciousness:update", EventPayload::custom(json!({"v": 1})))
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["type"], "consciousness:update");
    assert_eq!(received[0]["v"], 1);
}

#[test]
fn test_csv_export_reparses_in_order() {
    let sink = Arc::new(MemoryExportSink::new());
    let recorder = SessionRecorder::builder(RecorderConfig::new())
        .sink(sink.clone())
        .build()
        .unwrap();
    recorder.start().unwrap();

    let base = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    for i in 0..5 {
        let mut values = BTreeMap::new();
        values.insert("t".to_string(), i as f64);
        values.insert("value".to_string(), 0.1 * i as f64);
        recorder
            .record_at(base + chrono::Duration::seconds(i), values, BTreeMap::new())
            .unwrap();
    }
    recorder.stop().unwrap();

    let outcome = recorder.export(ExportFormat::Csv).unwrap();
    assert!(matches!(outcome, ExportOutcome::Exported { .. }));
    let artifact = sink.last().unwrap();
    assert_eq!(artifact.mime_type, "text/csv");
    assert!(artifact.file_name.ends_with(".csv"));

    let mut lines = artifact.content.lines();
    let header: Vec<&str> = lines.next().unwrap().split(',').collect();
    assert_eq!(header, vec!["timestamp", "iso_datetime", "t", "value"]);
    let column = header.iter().position(|h| *h == "value").unwrap();
    let values: Vec<f64> = lines
        .map(|line| line.split(',').nth(column).unwrap().parse().unwrap())
        .collect();
    assert_eq!(values.len(), 5);
    for (value, expected) in values.iter().zip([0.0, 0.1, 0.2, 0.3, 0.4]) {
        assert!((value - expected).abs() < 1e-12, "{} != {}", value, expected);
    }
    // shortest round-trip text parses back to the recorded bits
    assert_eq!(values[3], 0.1 * 3.0);

    // export does not consume the session
    assert!(matches!(
        recorder.export(ExportFormat::Json).unwrap(),
        ExportOutcome::Exported { .. }
    ));
    assert_eq!(recorder.sample_count(), 5);
}

#[test]
fn test_start_then_stop_before_first_tick() {
    let backend = Arc::new(ManualTimerBackend::new());
    let bus = Arc::new(EventBus::default());
    let engine = engine_on(&backend, &bus, EngineConfig::new("field").interval_ms(100), &[0.5]);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    engine
        .on_update("panel", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    engine.start().unwrap();
    engine.stop().unwrap();
    backend.advance(Duration::from_secs(5));

    assert!(engine.history().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(bus.history(Some("field:")).is_empty());
}

#[test]
fn test_aggregator_defaults_missing_input() {
    let aggregator = MetricAggregator::new(
        AggregatorConfig::new()
            .input(AggregatorInput::new("a"))
            .input(AggregatorInput::new("b").default_value(0.5)),
    )
    .unwrap();

    let mut inputs = HashMap::new();
    inputs.insert("a".to_string(), 0.8);
    let reading = aggregator.recombine(&inputs).unwrap();

    assert!((reading.value - 0.65).abs() < 1e-12);
    assert_eq!(reading.inputs["b"], 0.5);
    assert_eq!(reading.defaulted, vec!["b".to_string()]);
}

#[test]
fn test_hub_pipeline_from_json_config() {
    let config = SyncConfig::from_json_str(
        r#"{
            "engines": [
                { "name": "coherence", "namespace": "consciousness", "interval_ms": 100 },
                { "name": "breath", "namespace": "breathing", "interval_ms": 200 }
            ],
            "aggregator": {
                "threshold": 0.8,
                "inputs": [ { "name": "coherence" }, { "name": "breath" } ]
            },
            "recorder": {
                "capture_prefixes": ["meta:", "consciousness:update"],
                "max_duration_ms": 1000
            }
        }"#,
    )
    .unwrap();

    let backend = Arc::new(ManualTimerBackend::new());
    let reporter = Arc::new(MemoryReporter::new());
    let sink = Arc::new(MemoryExportSink::new());
    let hub = SyncHub::builder(config)
        .backend(backend.clone())
        .reporter(reporter.clone())
        .sink(sink.clone())
        .source("coherence", scripted(&[0.5, 0.6, 0.9, 0.95]))
        .source("breath", scripted(&[0.8]))
        .build()
        .unwrap();

    let transcendent = Arc::new(AtomicUsize::new(0));
    let counter = transcendent.clone();
    hub.bus()
        .subscribe("meta:transcendent", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    hub.recorder().start().unwrap();
    hub.start_all().unwrap();
    backend.advance(Duration::from_millis(1000));

    // auto-stop fired at 1s; engines keep running
    assert!(!hub.recorder().is_recording());
    assert!(hub.engine("coherence").unwrap().is_running());
    assert_eq!(hub.bus().history(Some("recording:complete")).len(), 1);
    assert_eq!(transcendent.load(Ordering::SeqCst), 1);

    let summary = hub.recorder().summary().unwrap();
    assert!(summary.numeric.contains_key("coherence"));
    assert!(summary.numeric.contains_key("meta"));
    assert!(summary.categorical.contains_key("meta_balance"));

    hub.recorder().export(ExportFormat::Json).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&sink.last().unwrap().content).unwrap();
    assert_eq!(
        doc["metadata"]["sample_count"].as_u64().unwrap() as usize,
        summary.sample_count
    );

    hub.shutdown().unwrap();
    assert_eq!(backend.pending(), 0);
    assert!(reporter.is_empty());
}
