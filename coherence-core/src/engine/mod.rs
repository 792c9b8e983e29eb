//! # Periodic State Engine
//!
//! An engine owns one field, recomputes it on every tick of an injected
//! [`TimerBackend`], keeps a bounded history and fans the new state out to
//! its subscribers and the bus.
//!
//! ## Lifecycle
//!
//! ```text
//!            start()               destroy()
//! Stopped ───────────► Running ───────────► Destroyed (terminal)
//!    ▲                    │
//!    └──────── stop() ────┘
//! ```
//!
//! `stop()` and `destroy()` cancel the timer. A tick the backend already
//! queued carries the generation of the `start()` it belongs to and is
//! discarded when it no longer matches, so no tick is observed after either
//! call returns.
//!
//! ## Tick
//!
//! 1. sample the source (non-finite readings skip the tick and are reported)
//! 2. clamp into the configured domain
//! 3. append to history
//! 4. call every subscriber with its own copy, in first-registration order
//! 5. emit `<namespace>:update`
//! 6. on a phase change emit `<namespace>:phase`
//! 7. on an upward threshold crossing emit `<namespace>:high`

mod sources;
mod threshold;

pub use sources::{
    BreathPhase, BreathShape, BreathingPattern, FieldReading, FieldSource, InputHandle,
    LevelBands, Oscillator, SmoothedInput, TickContext, CYCLE_COMPLETE,
};
pub use threshold::EdgeTrigger;

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, EventPayload, DELIMITER};
use crate::config::EngineConfig;
use crate::error::{panic_message, ErrorReporter, Result, SyncError, TracingReporter};
use crate::history::{HistoryRing, RingStats};
use crate::timing::{TimerBackend, TimerCallback, TimerEvent};

/// Snapshot of an engine's field after one tick
///
/// Always handed out by value; changing a copy never affects the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    /// Name of the producing engine
    pub engine: String,
    /// Clamped level
    pub level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Tick number that produced this state
    pub tick: u64,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub markers: BTreeSet<String>,
}

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Running,
    Destroyed,
}

/// Count of one `from -> to` phase change
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: String,
    pub to: String,
    pub count: u64,
}

/// Engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub lifecycle: Lifecycle,
    /// Ticks that produced a state
    pub ticks: u64,
    /// Ticks skipped because the source produced a non-finite value
    pub skipped_ticks: u64,
    pub subscribers: usize,
    pub threshold_crossings: u64,
    pub history: RingStats,
}

/// What a subscriber hands back: `Err` is reported, never propagated
pub type SubscriberResult = std::result::Result<(), String>;

/// Subscriber callback; receives its own copy of every new state
pub type Subscriber = Arc<dyn Fn(FieldState) -> SubscriberResult + Send + Sync>;

struct EngineState {
    lifecycle: Lifecycle,
    generation: u64,
    tick: u64,
    skipped: u64,
    source: Box<dyn FieldSource>,
    current: Option<FieldState>,
    history: HistoryRing<FieldState>,
    trigger: Option<EdgeTrigger>,
    last_phase: Option<String>,
    transitions: BTreeMap<(String, String), u64>,
}

struct EngineInner {
    config: EngineConfig,
    timer_id: String,
    update_type: String,
    backend: Arc<dyn TimerBackend>,
    bus: Option<Arc<EventBus>>,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<EngineState>,
    subscribers: Mutex<Vec<(String, Subscriber)>>,
    /// Held for a whole tick; stop/destroy wait on it
    tick_gate: ReentrantMutex<()>,
}

/// Builder for [`PeriodicEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    source: Option<Box<dyn FieldSource>>,
    backend: Option<Arc<dyn TimerBackend>>,
    bus: Option<Arc<EventBus>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl EngineBuilder {
    pub fn source(mut self, source: impl FieldSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn boxed_source(mut self, source: Box<dyn FieldSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TimerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Publish updates on `bus`
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to the bus reporter, or the log when there is no bus
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<PeriodicEngine> {
        self.config.validate()?;
        let source = self.source.ok_or_else(|| {
            SyncError::invalid(format!("engine '{}' has no field source", self.config.name))
        })?;
        let backend = self.backend.ok_or_else(|| {
            SyncError::invalid(format!("engine '{}' has no timer backend", self.config.name))
        })?;
        let reporter = self
            .reporter
            .or_else(|| self.bus.as_ref().map(|bus| bus.reporter()))
            .unwrap_or_else(|| Arc::new(TracingReporter));

        let history = HistoryRing::new(self.config.history_capacity)?;
        let trigger = self.config.high_threshold.map(EdgeTrigger::new);
        let timer_id = format!("engine/{}/{}", self.config.name, uuid::Uuid::new_v4().simple());
        let update_type = format!("{}{}update", self.config.namespace, DELIMITER);

        Ok(PeriodicEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                timer_id,
                update_type,
                backend,
                bus: self.bus,
                reporter,
                state: Mutex::new(EngineState {
                    lifecycle: Lifecycle::Stopped,
                    generation: 0,
                    tick: 0,
                    skipped: 0,
                    source,
                    current: None,
                    history,
                    trigger,
                    last_phase: None,
                    transitions: BTreeMap::new(),
                }),
                subscribers: Mutex::new(Vec::new()),
                tick_gate: ReentrantMutex::new(()),
            }),
        })
    }
}

/// Handle to a periodic state engine
///
/// Clones share the same engine. The timer is cancelled when the last
/// handle is dropped.
#[derive(Clone)]
pub struct PeriodicEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PeriodicEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicEngine")
            .field("name", &self.inner.config.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl PeriodicEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            source: None,
            backend: None,
            bus: None,
            reporter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Begin ticking; a no-op when already running
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.tick_gate.lock();
        let generation = {
            let mut state = inner.state.lock();
            match state.lifecycle {
                Lifecycle::Destroyed => return Err(inner.destroyed()),
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => {}
            }
            state.generation += 1;
            state.lifecycle = Lifecycle::Running;
            state.generation
        };

        let callback: Arc<dyn TimerCallback> = Arc::new(TickHandle {
            engine: Arc::downgrade(inner),
        });
        let scheduled = inner.backend.schedule_repeating(
            &inner.timer_id,
            inner.config.tick_interval(),
            TimerEvent::EngineTick {
                engine: inner.config.name.clone(),
                generation,
            },
            callback,
        );
        if let Err(err) = scheduled {
            inner.state.lock().lifecycle = Lifecycle::Stopped;
            return Err(err);
        }

        tracing::info!(
            engine = %inner.config.name,
            interval_ms = inner.config.interval_ms,
            backend = inner.backend.name(),
            "engine started"
        );
        Ok(())
    }

    /// Stop ticking; a no-op when already stopped
    ///
    /// Waits for a tick in progress on another thread to finish.
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.tick_gate.lock();
        {
            let mut state = inner.state.lock();
            match state.lifecycle {
                Lifecycle::Destroyed => return Err(inner.destroyed()),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Running => state.lifecycle = Lifecycle::Stopped,
            }
        }
        inner.backend.cancel(&inner.timer_id)?;
        tracing::info!(engine = %inner.config.name, "engine stopped");
        Ok(())
    }

    /// Stop for good and drop every subscription
    pub fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.tick_gate.lock();
        {
            let mut state = inner.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return Err(inner.destroyed());
            }
            state.lifecycle = Lifecycle::Destroyed;
        }
        inner.backend.cancel(&inner.timer_id)?;
        let dropped = {
            let mut subscribers = inner.subscribers.lock();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        tracing::info!(engine = %inner.config.name, subscribers = dropped, "engine destroyed");
        Ok(())
    }

    /// Register `callback` under `id`, replacing any callback already there
    ///
    /// A replaced subscriber keeps its position in the call order.
    pub fn on_update<F>(&self, id: &str, callback: F) -> Result<()>
    where
        F: Fn(FieldState) -> SubscriberResult + Send + Sync + 'static,
    {
        self.subscribe(id, Arc::new(callback))
    }

    /// Register a shared subscriber
    pub fn subscribe(&self, id: &str, callback: Subscriber) -> Result<()> {
        let inner = &self.inner;
        if id.is_empty() {
            return Err(SyncError::invalid("subscriber id must not be empty"));
        }
        if inner.state.lock().lifecycle == Lifecycle::Destroyed {
            return Err(inner.destroyed());
        }
        let mut subscribers = inner.subscribers.lock();
        match subscribers.iter_mut().find(|(existing, _)| existing == id) {
            Some(entry) => {
                entry.1 = callback;
                tracing::debug!(engine = %inner.config.name, subscriber = id, "subscriber replaced");
            }
            None => {
                subscribers.push((id.to_string(), callback));
                tracing::debug!(engine = %inner.config.name, subscriber = id, "subscriber added");
            }
        }
        Ok(())
    }

    /// Remove the subscriber under `id`; false if there was none
    pub fn remove_update(&self, id: &str) -> Result<bool> {
        let inner = &self.inner;
        if inner.state.lock().lifecycle == Lifecycle::Destroyed {
            return Err(inner.destroyed());
        }
        let mut subscribers = inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| existing != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::debug!(engine = %inner.config.name, subscriber = id, "subscriber removed");
        }
        Ok(removed)
    }

    /// Run one tick now, whatever the timer state
    ///
    /// Returns the new state, or `None` when the reading was skipped.
    pub fn step(&self) -> Result<Option<FieldState>> {
        self.inner.run_tick(None)
    }

    /// Copy of the latest state; `None` before the first tick
    pub fn current(&self) -> Option<FieldState> {
        self.inner.state.lock().current.clone()
    }

    /// Copy of the retained states, oldest first
    pub fn history(&self) -> Vec<FieldState> {
        self.inner.state.lock().history.snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Phase changes seen so far, sorted by `(from, to)`
    pub fn phase_transitions(&self) -> Vec<PhaseTransition> {
        self.inner
            .state
            .lock()
            .transitions
            .iter()
            .map(|((from, to), count)| PhaseTransition {
                from: from.clone(),
                to: to.clone(),
                count: *count,
            })
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock();
        EngineStats {
            name: self.inner.config.name.clone(),
            lifecycle: state.lifecycle,
            ticks: state.tick - state.skipped,
            skipped_ticks: state.skipped,
            subscribers: self.inner.subscribers.lock().len(),
            threshold_crossings: state.trigger.as_ref().map(EdgeTrigger::crossings).unwrap_or(0),
            history: state.history.stats(),
        }
    }
}

struct TickOutcome {
    state: FieldState,
    phase_change: Option<(Option<String>, String)>,
    crossed: Option<f64>,
}

impl EngineInner {
    fn destroyed(&self) -> SyncError {
        SyncError::EngineAlreadyDestroyed {
            engine: self.config.name.clone(),
        }
    }

    /// `generation` is set for timer ticks and must match the running start()
    fn run_tick(&self, generation: Option<u64>) -> Result<Option<FieldState>> {
        let _gate = self.tick_gate.lock();

        let outcome = {
            let mut state = self.state.lock();
            match (state.lifecycle, generation) {
                (Lifecycle::Destroyed, None) => return Err(self.destroyed()),
                (Lifecycle::Running, Some(g)) if g == state.generation => {}
                (_, Some(_)) => return Ok(None),
                (_, None) => {}
            }

            state.tick += 1;
            let tick = state.tick;
            let ctx = TickContext {
                tick,
                elapsed: self.config.tick_interval().saturating_mul(tick.min(u32::MAX as u64) as u32),
                now: Utc::now(),
            };
            let reading = state.source.sample(&ctx);

            if !reading.level.is_finite() {
                state.skipped += 1;
                drop(state);
                self.reporter.report(&SyncError::InvalidReading {
                    engine: self.config.name.clone(),
                    value: reading.level,
                });
                return Ok(None);
            }

            let field = FieldState {
                engine: self.config.name.clone(),
                level: self.config.domain.clamp(reading.level),
                phase: reading.phase,
                tick,
                last_update: ctx.now,
                markers: reading.markers,
            };
            state.history.push(field.clone());
            state.current = Some(field.clone());

            let phase_change = match &field.phase {
                Some(phase) if state.last_phase.as_ref() != Some(phase) => {
                    let from = state.last_phase.replace(phase.clone());
                    if let Some(from) = &from {
                        *state
                            .transitions
                            .entry((from.clone(), phase.clone()))
                            .or_insert(0) += 1;
                    }
                    Some((from, phase.clone()))
                }
                _ => None,
            };

            let crossed = match state.trigger.as_mut() {
                Some(trigger) => trigger.update(field.level).then(|| trigger.threshold()),
                None => None,
            };

            TickOutcome {
                state: field,
                phase_change,
                crossed,
            }
        };

        tracing::debug!(
            engine = %self.config.name,
            tick = outcome.state.tick,
            level = outcome.state.level,
            "tick"
        );

        self.notify_subscribers(&outcome.state);
        self.publish(&outcome);
        Ok(Some(outcome.state))
    }

    fn notify_subscribers(&self, state: &FieldState) {
        let subscribers: Vec<(String, Subscriber)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, cb)| (id.clone(), Arc::clone(cb)))
            .collect();

        for (id, callback) in subscribers {
            let copy = state.clone();
            let reason = match catch_unwind(AssertUnwindSafe(|| callback(copy))) {
                Ok(Ok(())) => continue,
                Ok(Err(reason)) => reason,
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            self.reporter.report(&SyncError::ListenerFailure {
                event_type: self.update_type.clone(),
                subscriber: id,
                reason,
            });
        }
    }

    fn publish(&self, outcome: &TickOutcome) {
        let Some(bus) = &self.bus else {
            return;
        };
        let namespace = &self.config.namespace;
        let mut events = vec![(
            self.update_type.clone(),
            EventPayload::Field(outcome.state.clone()),
        )];
        if let Some((from, to)) = &outcome.phase_change {
            events.push((
                format!("{}{}phase", namespace, DELIMITER),
                EventPayload::PhaseChange {
                    engine: self.config.name.clone(),
                    from: from.clone(),
                    to: to.clone(),
                },
            ));
        }
        if let Some(threshold) = outcome.crossed {
            tracing::info!(
                engine = %self.config.name,
                level = outcome.state.level,
                threshold,
                "high threshold crossed"
            );
            events.push((
                format!("{}{}high", namespace, DELIMITER),
                EventPayload::Threshold {
                    source: self.config.name.clone(),
                    level: outcome.state.level,
                    threshold,
                },
            ));
        }
        for (event_type, payload) in events {
            if let Err(err) = bus.emit(&event_type, payload) {
                self.reporter.report(&err);
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let _ = self.backend.cancel(&self.timer_id);
    }
}

/// Timer callback holding only a weak reference to its engine
struct TickHandle {
    engine: Weak<EngineInner>,
}

impl TimerCallback for TickHandle {
    fn on_timer(&self, event: TimerEvent) -> Result<()> {
        let TimerEvent::EngineTick { generation, .. } = event else {
            return Ok(());
        };
        match self.engine.upgrade() {
            Some(engine) => engine.run_tick(Some(generation)).map(|_| ()),
            None => Ok(()),
        }
    }
}
