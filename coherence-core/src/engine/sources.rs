//! Field sources
//!
//! A source computes the raw reading for one tick; the engine owns clamping,
//! history and fan-out. The built-in formulas are illustrative producers and
//! any `FnMut(&TickContext) -> FieldReading` works as a source too.

use std::collections::BTreeSet;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Result, SyncError};
use crate::smoother::Smoother;

/// Marker attached when a breathing cycle wraps around
pub const CYCLE_COMPLETE: &str = "cycle-complete";

/// What a source knows about the tick it is sampling
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// 1-based tick number
    pub tick: u64,
    /// `tick * interval`, independent of wall-clock jitter
    pub elapsed: Duration,
    /// Wall-clock time of the tick
    pub now: DateTime<Utc>,
}

/// Raw output of a source, before clamping
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldReading {
    pub level: f64,
    pub phase: Option<String>,
    pub markers: BTreeSet<String>,
}

impl FieldReading {
    pub fn new(level: f64) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.insert(marker.into());
        self
    }
}

/// Computes an engine's field on each tick
pub trait FieldSource: Send {
    fn sample(&mut self, ctx: &TickContext) -> FieldReading;
}

impl<F> FieldSource for F
where
    F: FnMut(&TickContext) -> FieldReading + Send,
{
    fn sample(&mut self, ctx: &TickContext) -> FieldReading {
        self(ctx)
    }
}

/// Maps a level onto a named band (`phase`)
///
/// Each band starts at its lower bound; the highest bound not above the
/// level wins. Levels below the first bound get the first label.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelBands {
    bands: Vec<(f64, String)>,
}

impl LevelBands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a band starting at `lower`
    pub fn band(mut self, lower: f64, label: &str) -> Self {
        self.bands.push((lower, label.to_string()));
        self.bands.sort_by(|a, b| a.0.total_cmp(&b.0));
        self
    }

    pub fn classify(&self, level: f64) -> Option<&str> {
        self.bands
            .iter()
            .rev()
            .find(|(lower, _)| level >= *lower)
            .or_else(|| self.bands.first())
            .map(|(_, label)| label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

/// Sine wave around a baseline
#[derive(Debug, Clone)]
pub struct Oscillator {
    baseline: f64,
    amplitude: f64,
    period: Duration,
    bands: LevelBands,
}

impl Oscillator {
    pub fn new(baseline: f64, amplitude: f64, period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(SyncError::invalid("oscillator period must be non-zero"));
        }
        if !baseline.is_finite() || !amplitude.is_finite() {
            return Err(SyncError::invalid("oscillator baseline and amplitude must be finite"));
        }
        Ok(Self {
            baseline,
            amplitude,
            period,
            bands: LevelBands::default(),
        })
    }

    /// Label each reading with the band its level falls in
    pub fn with_bands(mut self, bands: LevelBands) -> Self {
        self.bands = bands;
        self
    }
}

impl FieldSource for Oscillator {
    fn sample(&mut self, ctx: &TickContext) -> FieldReading {
        let turns = ctx.elapsed.as_secs_f64() / self.period.as_secs_f64();
        let level = self.baseline + self.amplitude * (TAU * turns).sin();
        let mut reading = FieldReading::new(level);
        reading.phase = self.bands.classify(level).map(str::to_string);
        reading
    }
}

/// How the level moves through one breathing phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreathShape {
    /// 0 → 1 across the phase
    Rise,
    /// Stays at 1
    HoldHigh,
    /// 1 → 0 across the phase
    Fall,
    /// Stays at 0
    HoldLow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreathPhase {
    pub name: String,
    pub duration: Duration,
    pub shape: BreathShape,
}

impl BreathPhase {
    pub fn new(name: &str, duration: Duration, shape: BreathShape) -> Self {
        Self {
            name: name.to_string(),
            duration,
            shape,
        }
    }
}

/// Cycles through ordered phases, reporting the phase name and its progress
#[derive(Debug, Clone)]
pub struct BreathingPattern {
    phases: Vec<BreathPhase>,
    cycle: Duration,
    last_cycle: Option<u128>,
}

impl BreathingPattern {
    pub fn new(phases: Vec<BreathPhase>) -> Result<Self> {
        if phases.is_empty() {
            return Err(SyncError::invalid("breathing pattern needs at least one phase"));
        }
        if phases.iter().any(|p| p.duration.is_zero()) {
            return Err(SyncError::invalid("breathing phase durations must be non-zero"));
        }
        let cycle = phases.iter().map(|p| p.duration).sum();
        Ok(Self {
            phases,
            cycle,
            last_cycle: None,
        })
    }

    /// Four equal phases: inhale, hold, exhale, rest
    pub fn box_breathing(side: Duration) -> Result<Self> {
        Self::new(vec![
            BreathPhase::new("inhale", side, BreathShape::Rise),
            BreathPhase::new("hold", side, BreathShape::HoldHigh),
            BreathPhase::new("exhale", side, BreathShape::Fall),
            BreathPhase::new("rest", side, BreathShape::HoldLow),
        ])
    }

    pub fn cycle_length(&self) -> Duration {
        self.cycle
    }

    pub fn phases(&self) -> &[BreathPhase] {
        &self.phases
    }
}

impl FieldSource for BreathingPattern {
    fn sample(&mut self, ctx: &TickContext) -> FieldReading {
        let elapsed = ctx.elapsed.as_nanos();
        let cycle = self.cycle.as_nanos().max(1);
        let cycle_index = elapsed / cycle;
        let mut offset = elapsed % cycle;

        let mut current = &self.phases[0];
        let mut progress = 0.0;
        for phase in &self.phases {
            let length = phase.duration.as_nanos();
            if offset < length {
                current = phase;
                progress = offset as f64 / length as f64;
                break;
            }
            offset -= length;
        }

        let level = match current.shape {
            BreathShape::Rise => progress,
            BreathShape::HoldHigh => 1.0,
            BreathShape::Fall => 1.0 - progress,
            BreathShape::HoldLow => 0.0,
        };

        let mut reading = FieldReading::new(level).with_phase(current.name.clone());
        if matches!(self.last_cycle, Some(last) if cycle_index > last) {
            reading.markers.insert(CYCLE_COMPLETE.to_string());
        }
        self.last_cycle = Some(cycle_index);
        reading
    }
}

struct InputState {
    smoother: Box<dyn Smoother>,
    pushed: u64,
}

/// Producer side of a [`SmoothedInput`]
///
/// Cloneable; every clone feeds the same smoother.
#[derive(Clone)]
pub struct InputHandle {
    state: Arc<Mutex<InputState>>,
}

impl InputHandle {
    /// Feed a raw value, returning the smoothed value
    pub fn push(&self, value: f64) -> Result<f64> {
        if !value.is_finite() {
            return Err(SyncError::invalid(format!(
                "input value must be finite, got {}",
                value
            )));
        }
        let mut state = self.state.lock();
        state.pushed += 1;
        Ok(state.smoother.push(value))
    }

    /// Latest smoothed value, if anything was pushed
    pub fn current(&self) -> Option<f64> {
        self.state.lock().smoother.current()
    }

    /// Number of values pushed so far
    pub fn pushed(&self) -> u64 {
        self.state.lock().pushed
    }
}

impl std::fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputHandle")
            .field("current", &self.current())
            .field("pushed", &self.pushed())
            .finish()
    }
}

/// Publishes the smoothed value of an external feed
pub struct SmoothedInput {
    handle: InputHandle,
    default: f64,
    bands: LevelBands,
}

impl SmoothedInput {
    /// `default` is reported until the first push
    pub fn new(smoother: impl Smoother + 'static, default: f64) -> Self {
        Self {
            handle: InputHandle {
                state: Arc::new(Mutex::new(InputState {
                    smoother: Box::new(smoother),
                    pushed: 0,
                })),
            },
            default,
            bands: LevelBands::default(),
        }
    }

    pub fn with_bands(mut self, bands: LevelBands) -> Self {
        self.bands = bands;
        self
    }

    /// Handle for the producer
    pub fn handle(&self) -> InputHandle {
        self.handle.clone()
    }
}

impl FieldSource for SmoothedInput {
    fn sample(&mut self, _ctx: &TickContext) -> FieldReading {
        let level = self.handle.current().unwrap_or(self.default);
        let mut reading = FieldReading::new(level);
        reading.phase = self.bands.classify(level).map(str::to_string);
        reading
    }
}
