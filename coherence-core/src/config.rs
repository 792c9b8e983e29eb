//! Configuration for buses, engines, the aggregator and the recorder
//!
//! Every struct has sensible defaults, chained setters, and deserializes
//! from partial JSON so a config file only needs the values it changes:
//!
//! ```json
//! {
//!   "bus": { "history_capacity": 50 },
//!   "engines": [
//!     { "name": "coherence", "namespace": "consciousness", "interval_ms": 250,
//!       "high_threshold": 0.95 }
//!   ],
//!   "aggregator": { "inputs": [ { "name": "coherence" } ], "threshold": 0.9 }
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::history::DEFAULT_HISTORY_CAPACITY;

/// Default engine tick interval
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events retained for `history()`
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(SyncError::invalid("bus history_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Closed interval a field level is clamped into
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDomain {
    pub min: f64,
    pub max: f64,
}

impl Default for FieldDomain {
    fn default() -> Self {
        Self::UNIT
    }
}

impl FieldDomain {
    /// `[0, 1]`
    pub const UNIT: FieldDomain = FieldDomain { min: 0.0, max: 1.0 };

    pub fn new(min: f64, max: f64) -> Result<Self> {
        let domain = Self { min, max };
        domain.validate()?;
        Ok(domain)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(SyncError::invalid(format!(
                "field domain [{}, {}] is not a finite, ordered interval",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Periodic state engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine name (unique within a hub; used as the aggregator input name)
    pub name: String,
    /// Bus namespace for `<namespace>:update`, `:phase` and `:high`
    pub namespace: String,
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Field states retained for `history()`
    pub history_capacity: usize,
    /// Clamp domain of the level
    pub domain: FieldDomain,
    /// Level above which a one-shot `<namespace>:high` event fires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_threshold: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "field".to_string(),
            namespace: "field".to_string(),
            interval_ms: DEFAULT_INTERVAL_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            domain: FieldDomain::UNIT,
            high_threshold: None,
        }
    }
}

impl EngineConfig {
    /// Engine whose namespace equals its name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: name.to_string(),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn domain(mut self, domain: FieldDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn high_threshold(mut self, threshold: f64) -> Self {
        self.high_threshold = Some(threshold);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SyncError::invalid("engine name must not be empty"));
        }
        if self.namespace.is_empty() || self.namespace.contains(crate::bus::DELIMITER) {
            return Err(SyncError::invalid(format!(
                "engine '{}' namespace '{}' must be non-empty and contain no '{}'",
                self.name,
                self.namespace,
                crate::bus::DELIMITER
            )));
        }
        if self.interval_ms == 0 {
            return Err(SyncError::invalid(format!(
                "engine '{}' interval_ms must be at least 1",
                self.name
            )));
        }
        if self.history_capacity == 0 {
            return Err(SyncError::invalid(format!(
                "engine '{}' history_capacity must be at least 1",
                self.name
            )));
        }
        self.domain.validate()?;
        if let Some(threshold) = self.high_threshold {
            if !self.domain.contains(threshold) {
                return Err(SyncError::invalid(format!(
                    "engine '{}' high_threshold {} lies outside [{}, {}]",
                    self.name, threshold, self.domain.min, self.domain.max
                )));
            }
        }
        Ok(())
    }
}

/// One named aggregator input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorInput {
    pub name: String,
    /// Relative weight in the composite
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Value substituted until the input first reports
    #[serde(default = "default_input_value")]
    pub default: f64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_input_value() -> f64 {
    0.5
}

impl AggregatorInput {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: default_weight(),
            default: default_input_value(),
        }
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn default_value(mut self, value: f64) -> Self {
        self.default = value;
        self
    }
}

/// Derived-metric aggregator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Bus namespace for `<namespace>:update` and `:transcendent`
    pub namespace: String,
    pub inputs: Vec<AggregatorInput>,
    /// Composite value above which `<namespace>:transcendent` fires once
    pub threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            namespace: "meta".to_string(),
            inputs: Vec::new(),
            threshold: 0.9,
        }
    }
}

impl AggregatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn input(mut self, input: AggregatorInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(crate::bus::DELIMITER) {
            return Err(SyncError::invalid(format!(
                "aggregator namespace '{}' must be non-empty and contain no '{}'",
                self.namespace,
                crate::bus::DELIMITER
            )));
        }
        if self.inputs.is_empty() {
            return Err(SyncError::invalid("aggregator needs at least one input"));
        }
        let mut seen = HashSet::new();
        for input in &self.inputs {
            if input.name.trim().is_empty() {
                return Err(SyncError::invalid("aggregator input name must not be empty"));
            }
            if !seen.insert(input.name.as_str()) {
                return Err(SyncError::invalid(format!(
                    "aggregator input '{}' is listed twice",
                    input.name
                )));
            }
            if !(input.weight.is_finite() && input.weight > 0.0) {
                return Err(SyncError::invalid(format!(
                    "aggregator input '{}' weight must be positive, got {}",
                    input.name, input.weight
                )));
            }
            if !FieldDomain::UNIT.contains(input.default) {
                return Err(SyncError::invalid(format!(
                    "aggregator input '{}' default {} lies outside [0, 1]",
                    input.name, input.default
                )));
            }
        }
        if !FieldDomain::UNIT.contains(self.threshold) {
            return Err(SyncError::invalid(format!(
                "aggregator threshold {} lies outside [0, 1]",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Recording/export sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Bus namespace for `<namespace>:started` and `:complete`
    pub namespace: String,
    /// Event type prefixes that qualify as samples when attached to a bus;
    /// each names its namespace, e.g. `"eeg:"` or `"consciousness:up"`
    pub capture_prefixes: Vec<String>,
    /// Auto-stop after this long (one-shot timer)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    /// Drop samples whose values all moved by at most this much (0 keeps all)
    pub min_change: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            namespace: "recording".to_string(),
            capture_prefixes: Vec::new(),
            max_duration_ms: None,
            min_change: 0.0,
        }
    }
}

impl RecorderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn capture(mut self, prefix: &str) -> Self {
        self.capture_prefixes.push(prefix.to_string());
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn min_change(mut self, delta: f64) -> Self {
        self.min_change = delta;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(crate::bus::DELIMITER) {
            return Err(SyncError::invalid(format!(
                "recorder namespace '{}' must be non-empty and contain no '{}'",
                self.namespace,
                crate::bus::DELIMITER
            )));
        }
        for prefix in &self.capture_prefixes {
            match prefix.split_once(crate::bus::DELIMITER) {
                Some((namespace, _)) if !namespace.is_empty() => {}
                _ => {
                    return Err(SyncError::invalid(format!(
                        "recorder capture prefix '{}' must start with a namespace and '{}'",
                        prefix,
                        crate::bus::DELIMITER
                    )))
                }
            }
        }
        if self.max_duration_ms == Some(0) {
            return Err(SyncError::invalid("recorder max_duration_ms must be at least 1"));
        }
        if !(self.min_change.is_finite() && self.min_change >= 0.0) {
            return Err(SyncError::invalid(format!(
                "recorder min_change must be a non-negative number, got {}",
                self.min_change
            )));
        }
        Ok(())
    }
}

/// Everything a hub needs, loadable from one JSON document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub bus: BusConfig,
    pub engines: Vec<EngineConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<AggregatorConfig>,
    pub recorder: RecorderConfig,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json).map_err(|e| SyncError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| SyncError::Config {
            reason: format!("cannot read '{}': {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn recorder(mut self, recorder: RecorderConfig) -> Self {
        self.recorder = recorder;
        self
    }

    /// Validate every section plus cross-section rules
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        let mut names = HashSet::new();
        for engine in &self.engines {
            engine.validate()?;
            if !names.insert(engine.name.as_str()) {
                return Err(SyncError::invalid(format!(
                    "engine name '{}' is used twice",
                    engine.name
                )));
            }
        }
        if let Some(aggregator) = &self.aggregator {
            aggregator.validate()?;
        }
        self.recorder.validate()?;
        Ok(())
    }

    /// Look up an engine section by name
    pub fn engine_config(&self, name: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.name == name)
    }
}
