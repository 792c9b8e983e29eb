//! Composition root
//!
//! A [`SyncHub`] wires one bus, the configured engines, an optional
//! aggregator and the session recorder together. Every part shares the
//! hub's timer backend and error reporter; nothing is global.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use coherence_core::{EngineConfig, ManualTimerBackend, Oscillator, SyncConfig, SyncHub};
//!
//! let backend = Arc::new(ManualTimerBackend::new());
//! let config = SyncConfig::new().engine(EngineConfig::new("coherence").interval_ms(100));
//! let hub = SyncHub::builder(config)
//!     .backend(backend.clone())
//!     .source("coherence", Oscillator::new(0.5, 0.2, Duration::from_secs(2)).unwrap())
//!     .build()
//!     .unwrap();
//!
//! hub.start_all().unwrap();
//! backend.advance(Duration::from_millis(500));
//! assert_eq!(hub.engine("coherence").unwrap().history().len(), 5);
//! hub.shutdown().unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregator::MetricAggregator;
use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::engine::{FieldSource, Lifecycle, PeriodicEngine};
use crate::error::{ErrorReporter, Result, SyncError, TracingReporter};
use crate::recorder::{ExportSink, SessionRecorder, SessionSummary};
use crate::timing::TimerBackend;

/// Builder for [`SyncHub`]
pub struct SyncHubBuilder {
    config: SyncConfig,
    backend: Option<Arc<dyn TimerBackend>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    sink: Option<Arc<dyn ExportSink>>,
    sources: HashMap<String, Box<dyn FieldSource>>,
    feeds: Vec<(String, String)>,
}

impl SyncHubBuilder {
    /// Timer backend shared by every engine and the recorder
    pub fn backend(mut self, backend: Arc<dyn TimerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to [`TracingReporter`]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Export destination for the recorder
    pub fn sink(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Field source for the engine named `engine`
    pub fn source(mut self, engine: &str, source: impl FieldSource + 'static) -> Self {
        self.sources.insert(engine.to_string(), Box::new(source));
        self
    }

    pub fn boxed_source(mut self, engine: &str, source: Box<dyn FieldSource>) -> Self {
        self.sources.insert(engine.to_string(), source);
        self
    }

    /// Feed aggregator input `input` from engine `engine`
    ///
    /// Inputs without an explicit feed are fed by the engine of the same
    /// name, when there is one.
    pub fn feed(mut self, engine: &str, input: &str) -> Self {
        self.feeds.push((engine.to_string(), input.to_string()));
        self
    }

    pub fn build(mut self) -> Result<SyncHub> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| SyncError::invalid("hub has no timer backend"))?;
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter));

        if let Some(name) = self
            .sources
            .keys()
            .find(|name| self.config.engine_config(name).is_none())
        {
            return Err(SyncError::invalid(format!(
                "source given for unknown engine '{}'",
                name
            )));
        }

        let bus = Arc::new(EventBus::new(self.config.bus.clone())?.with_reporter(reporter.clone()));

        let mut engines = Vec::with_capacity(self.config.engines.len());
        for engine_config in &self.config.engines {
            let source = self.sources.remove(&engine_config.name).ok_or_else(|| {
                SyncError::invalid(format!("engine '{}' has no field source", engine_config.name))
            })?;
            let engine = PeriodicEngine::builder(engine_config.clone())
                .boxed_source(source)
                .backend(backend.clone())
                .bus(bus.clone())
                .reporter(reporter.clone())
                .build()?;
            engines.push(engine);
        }

        let aggregator = match &self.config.aggregator {
            Some(aggregator_config) => {
                let aggregator = Arc::new(
                    MetricAggregator::new(aggregator_config.clone())?
                        .with_bus(bus.clone())
                        .with_reporter(reporter.clone()),
                );
                let mut feeds = self.feeds.clone();
                for input in &aggregator_config.inputs {
                    let explicit = feeds.iter().any(|(_, fed)| *fed == input.name);
                    if !explicit && self.config.engine_config(&input.name).is_some() {
                        feeds.push((input.name.clone(), input.name.clone()));
                    }
                }
                for (engine_name, input) in &feeds {
                    let engine = engines
                        .iter()
                        .find(|e| e.name() == engine_name)
                        .ok_or_else(|| {
                            SyncError::invalid(format!(
                                "aggregator feed names unknown engine '{}'",
                                engine_name
                            ))
                        })?;
                    aggregator.attach(&bus, engine.namespace(), input)?;
                }
                Some(aggregator)
            }
            None if !self.feeds.is_empty() => {
                return Err(SyncError::invalid(
                    "aggregator feeds given without an aggregator section",
                ));
            }
            None => None,
        };

        let mut recorder = SessionRecorder::builder(self.config.recorder.clone())
            .backend(backend.clone())
            .bus(bus.clone())
            .reporter(reporter.clone());
        if let Some(sink) = self.sink {
            recorder = recorder.sink(sink);
        }
        let recorder = recorder.build()?;
        if !self.config.recorder.capture_prefixes.is_empty() {
            recorder.attach(&bus)?;
        }

        tracing::info!(
            engines = engines.len(),
            aggregator = aggregator.is_some(),
            backend = backend.name(),
            "hub assembled"
        );

        Ok(SyncHub {
            config: self.config,
            bus,
            engines,
            aggregator,
            recorder,
            backend,
            reporter,
        })
    }
}

/// Owns one bus and everything publishing on it
pub struct SyncHub {
    config: SyncConfig,
    bus: Arc<EventBus>,
    engines: Vec<PeriodicEngine>,
    aggregator: Option<Arc<MetricAggregator>>,
    recorder: SessionRecorder,
    backend: Arc<dyn TimerBackend>,
    reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHub")
            .field("engines", &self.engines)
            .field("aggregator", &self.aggregator.is_some())
            .field("recorder", &self.recorder)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl SyncHub {
    pub fn builder(config: SyncConfig) -> SyncHubBuilder {
        SyncHubBuilder {
            config,
            backend: None,
            reporter: None,
            sink: None,
            sources: HashMap::new(),
            feeds: Vec::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn engine(&self, name: &str) -> Option<&PeriodicEngine> {
        self.engines.iter().find(|e| e.name() == name)
    }

    /// Engines in configuration order
    pub fn engines(&self) -> &[PeriodicEngine] {
        &self.engines
    }

    pub fn aggregator(&self) -> Option<&Arc<MetricAggregator>> {
        self.aggregator.as_ref()
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn backend(&self) -> &Arc<dyn TimerBackend> {
        &self.backend
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    /// Start every engine in configuration order
    pub fn start_all(&self) -> Result<()> {
        for engine in &self.engines {
            engine.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<()> {
        for engine in &self.engines {
            engine.stop()?;
        }
        Ok(())
    }

    /// Stop the recording, then destroy every engine
    ///
    /// Returns the summary of the session that was running, if any.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<Option<SessionSummary>> {
        let summary = if self.recorder.is_recording() {
            self.recorder.stop()?
        } else {
            None
        };
        for engine in &self.engines {
            if engine.lifecycle() != Lifecycle::Destroyed {
                engine.destroy()?;
            }
        }
        tracing::info!(engines = self.engines.len(), "hub shut down");
        Ok(summary)
    }
}
