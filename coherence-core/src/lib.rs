//! # Coherence Core - in-process state synchronizers
//!
//! Coherence Core keeps a set of independent producers and consumers of a
//! slowly varying scalar "field" in step:
//!
//! - **Event Bus**: namespaced publish/subscribe (`"namespace:verb"`) with a
//!   capped history and namespace-wide listeners (`"namespace:*"`)
//! - **Periodic State Engines**: sample a [`FieldSource`] on a fixed tick,
//!   keep a bounded history and notify subscribers
//! - **Metric Smoothers**: fixed-window and exponential smoothing of noisy
//!   input before it reaches an engine
//! - **Aggregator**: weighted composite of several engines' latest values
//! - **Recorder**: session buffer with summary statistics and CSV/JSON export
//!
//! ## Core Principle
//!
//! > One failing listener never takes the others down with it.
//!
//! Every callback boundary is isolated; failures go to a single injected
//! [`ErrorReporter`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coherence_core::{
//!     EngineConfig, EventBus, ManualTimerBackend, Oscillator, PeriodicEngine,
//! };
//!
//! let bus = Arc::new(EventBus::default());
//! let backend = Arc::new(ManualTimerBackend::new());
//!
//! let engine = PeriodicEngine::builder(EngineConfig::new("consciousness").interval_ms(100))
//!     .source(Oscillator::new(0.5, 0.3, Duration::from_secs(5)).unwrap())
//!     .backend(backend.clone())
//!     .bus(bus.clone())
//!     .build()
//!     .unwrap();
//!
//! bus.subscribe("consciousness:update", |event| {
//!     println!("{:?}", event.payload);
//!     Ok(())
//! })
//! .unwrap();
//!
//! engine.start().unwrap();
//! backend.advance(Duration::from_secs(1));
//!
//! assert_eq!(engine.history().len(), 10);
//! assert_eq!(bus.history(Some("consciousness:update")).len(), 10);
//! engine.destroy().unwrap();
//! ```

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod hub;
pub mod recorder;
pub mod smoother;
pub mod timing;

// Re-export main types
pub use aggregator::{Balance, BalanceStatus, CompositeReading, MetricAggregator, TARGET_RATIO};
pub use bus::{BusStats, Event, EventBus, EventPayload, Listener, ListenerId, ListenerResult};
pub use config::{
    AggregatorConfig, AggregatorInput, BusConfig, EngineConfig, FieldDomain, RecorderConfig,
    SyncConfig,
};
pub use engine::{
    BreathPhase, BreathShape, BreathingPattern, EngineStats, FieldReading, FieldSource,
    FieldState, InputHandle, LevelBands, Lifecycle, Oscillator, PeriodicEngine,
    PhaseTransition, SmoothedInput, TickContext,
};
pub use error::{
    ErrorCategory, ErrorDetail, ErrorReporter, ErrorResponse, MemoryReporter, Result, SyncError,
    TracingReporter,
};
pub use history::{HistoryRing, RingStats};
pub use hub::{SyncHub, SyncHubBuilder};
pub use recorder::{
    ExportArtifact, ExportFormat, ExportOutcome, ExportSink, FileExportSink, MemoryExportSink,
    RecorderState, Sample, SessionRecorder, SessionSummary,
};
pub use smoother::{ExponentialSmoother, MovingAverage, Smoother};
pub use timing::{ManualTimerBackend, ThreadTimerBackend, TimerBackend, TimerCallback, TimerEvent};

/// Crate version, stamped into exports
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
