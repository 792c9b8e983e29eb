//! Derived-metric aggregation
//!
//! Combines the latest known value of several named inputs into one
//! composite score (a fixed-weight mean of inputs clamped to `[0, 1]`).
//! Inputs that have never reported contribute their configured default, so
//! engines that tick at different rates never block each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, EventPayload, ListenerId, ListenerResult, DELIMITER};
use crate::config::{AggregatorConfig, FieldDomain};
use crate::engine::EdgeTrigger;
use crate::error::{ErrorReporter, Result, SyncError, TracingReporter};

/// Composite-to-remainder ratio the balance status is centred on (3:1)
pub const TARGET_RATIO: f64 = 3.0;

/// How close the composite sits to the 3:1 ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    /// Ratio within [2.9, 3.1]
    Optimal,
    /// Ratio within [2.0, 4.0]
    Suboptimal,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// `value / max(1 - value, 0.01)`
    pub ratio: f64,
    pub status: BalanceStatus,
}

impl Balance {
    pub fn of(value: f64) -> Self {
        let ratio = value / (1.0 - value).max(0.01);
        let status = if (2.9..=3.1).contains(&ratio) {
            BalanceStatus::Optimal
        } else if (2.0..=4.0).contains(&ratio) {
            BalanceStatus::Suboptimal
        } else {
            BalanceStatus::Critical
        };
        Self { ratio, status }
    }
}

/// Result of one recombination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeReading {
    /// Weighted mean of the effective inputs
    pub value: f64,
    /// Effective (clamped or defaulted) value of every configured input
    pub inputs: BTreeMap<String, f64>,
    /// Inputs that have never reported and used their default
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaulted: Vec<String>,
    pub balance: Balance,
    pub timestamp: DateTime<Utc>,
}

struct AggregatorState {
    latest: HashMap<String, f64>,
    trigger: EdgeTrigger,
    last: Option<CompositeReading>,
    recombinations: u64,
}

/// Weighted combiner of named inputs
pub struct MetricAggregator {
    config: AggregatorConfig,
    update_type: String,
    transcendent_type: String,
    bus: Option<Arc<EventBus>>,
    reporter: Arc<dyn ErrorReporter>,
    state: Mutex<AggregatorState>,
    attachments: Mutex<HashMap<(u64, String, String), ListenerId>>,
}

impl std::fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("namespace", &self.config.namespace)
            .field("inputs", &self.config.inputs.len())
            .field("recombinations", &self.state.lock().recombinations)
            .finish()
    }
}

impl MetricAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        let namespace = config.namespace.clone();
        let threshold = config.threshold;
        Ok(Self {
            config,
            update_type: format!("{}{}update", namespace, DELIMITER),
            transcendent_type: format!("{}{}transcendent", namespace, DELIMITER),
            bus: None,
            reporter: Arc::new(TracingReporter),
            attachments: Mutex::new(HashMap::new()),
            state: Mutex::new(AggregatorState {
                latest: HashMap::new(),
                trigger: EdgeTrigger::new(threshold),
                last: None,
                recombinations: 0,
            }),
        })
    }

    /// Publish composites on `bus`, reporting through the bus reporter
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.reporter = bus.reporter();
        self.bus = Some(bus);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Merge `inputs` into the latest-known values and recompute
    ///
    /// Unknown names are rejected before anything changes.
    pub fn recombine(&self, inputs: &HashMap<String, f64>) -> Result<CompositeReading> {
        for (name, value) in inputs {
            if !self.config.inputs.iter().any(|i| &i.name == name) {
                return Err(SyncError::UnknownInput { name: name.clone() });
            }
            if !value.is_finite() {
                return Err(SyncError::invalid(format!(
                    "aggregator input '{}' must be finite, got {}",
                    name, value
                )));
            }
        }

        let (reading, crossed) = {
            let mut state = self.state.lock();
            for (name, value) in inputs {
                state.latest.insert(name.clone(), *value);
            }
            let reading = self.compose(&state.latest);
            let crossed = state.trigger.update(reading.value);
            state.last = Some(reading.clone());
            state.recombinations += 1;
            (reading, crossed)
        };

        tracing::debug!(
            namespace = %self.config.namespace,
            value = reading.value,
            defaulted = reading.defaulted.len(),
            "recombined"
        );
        self.publish(&reading, crossed);
        Ok(reading)
    }

    /// Report a single input
    pub fn update(&self, name: &str, value: f64) -> Result<CompositeReading> {
        let mut inputs = HashMap::with_capacity(1);
        inputs.insert(name.to_string(), value);
        self.recombine(&inputs)
    }

    /// Composite of `latest` without touching any state
    pub fn compose(&self, latest: &HashMap<String, f64>) -> CompositeReading {
        let mut inputs = BTreeMap::new();
        let mut defaulted = Vec::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        for input in &self.config.inputs {
            let value = match latest.get(&input.name) {
                Some(v) => FieldDomain::UNIT.clamp(*v),
                None => {
                    defaulted.push(input.name.clone());
                    input.default
                }
            };
            weighted += input.weight * value;
            total_weight += input.weight;
            inputs.insert(input.name.clone(), value);
        }

        // validate() guarantees at least one positive weight
        let value = FieldDomain::UNIT.clamp(weighted / total_weight);
        CompositeReading {
            value,
            inputs,
            defaulted,
            balance: Balance::of(value),
            timestamp: Utc::now(),
        }
    }

    /// Latest composite, if any recombination happened
    pub fn current(&self) -> Option<CompositeReading> {
        self.state.lock().last.clone()
    }

    /// Number of recombinations so far
    pub fn recombinations(&self) -> u64 {
        self.state.lock().recombinations
    }

    /// Forget every reported input and re-arm the threshold
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.latest.clear();
        state.last = None;
        state.trigger.reset();
    }

    /// Feed `input_name` from the `<engine_namespace>:update` events on `bus`
    pub fn attach(
        self: &Arc<Self>,
        bus: &EventBus,
        engine_namespace: &str,
        input_name: &str,
    ) -> Result<ListenerId> {
        if !self.config.inputs.iter().any(|i| i.name == input_name) {
            return Err(SyncError::UnknownInput {
                name: input_name.to_string(),
            });
        }
        let event_type = format!("{}{}update", engine_namespace, DELIMITER);
        let key = (bus.instance_id(), event_type.clone(), input_name.to_string());
        let mut attachments = self.attachments.lock();
        if let Some(id) = attachments.get(&key) {
            return Ok(*id);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let name = input_name.to_string();
        let label = format!("aggregator:{}", input_name);
        let id = bus.on_labeled(
            &event_type,
            &label,
            Arc::new(move |event: &crate::bus::Event| -> ListenerResult {
                let (Some(aggregator), EventPayload::Field(state)) = (weak.upgrade(), &event.payload)
                else {
                    return Ok(());
                };
                aggregator
                    .update(&name, state.level)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        )?;
        attachments.insert(key, id);
        tracing::debug!(event_type = %event_type, input = input_name, "aggregator attached");
        Ok(id)
    }

    fn publish(&self, reading: &CompositeReading, crossed: bool) {
        if crossed {
            tracing::info!(
                namespace = %self.config.namespace,
                value = reading.value,
                threshold = self.config.threshold,
                "composite crossed threshold"
            );
        }
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(err) = bus.emit(&self.update_type, EventPayload::Composite(reading.clone())) {
            self.reporter.report(&err);
        }
        if crossed {
            let payload = EventPayload::Threshold {
                source: self.config.namespace.clone(),
                level: reading.value,
                threshold: self.config.threshold,
            };
            if let Err(err) = bus.emit(&self.transcendent_type, payload) {
                self.reporter.report(&err);
            }
        }
    }
}
