//! # Recording/Export Sink
//!
//! Buffers timestamped samples for one session and serializes them on
//! demand.
//!
//! ```text
//!          start()              stop()
//! Idle ───────────► Recording ─────────► Stopped
//!  ▲                    │  ▲                │
//!  │      clear()       │  └── start() ─────┤ (fresh session)
//!  └────────────────────┴───────────────────┘
//! ```
//!
//! Samples come from [`SessionRecorder::record`] or from bus events whose
//! type starts with a configured capture prefix (see
//! [`SessionRecorder::attach`]). Prefixes always name a namespace, so
//! `"eeg:"` covers all of `eeg` and `"consc"` is rejected. How an event
//! becomes a sample:
//!
//! | Payload              | values                 | labels                     |
//! |----------------------|------------------------|----------------------------|
//! | `Field`              | `<engine>` = level     | `<engine>_phase` = phase   |
//! | `Composite`          | `<namespace>` = value  | `<namespace>_balance`      |
//! | `Custom` (object)    | numeric members        | string members             |
//!
//! Other payloads are not samples.

mod export;
mod summary;

pub use export::{
    file_name, render, render_csv, ExportArtifact, ExportFormat, ExportOutcome, ExportSink,
    FileExportSink, MemoryExportSink,
};
pub use summary::{CategoryStats, FieldStats, SessionSummary};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Event, EventBus, EventPayload, ListenerId, ListenerResult, DELIMITER, WILDCARD};
use crate::config::RecorderConfig;
use crate::error::{ErrorReporter, Result, SyncError, TracingReporter};
use crate::timing::{TimerBackend, TimerCallback, TimerEvent};

/// One buffered row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the session started
    pub session_relative_ms: i64,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

struct Session {
    state: RecorderState,
    session_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    samples: Vec<Sample>,
    summary: Option<SessionSummary>,
    timer_id: Option<String>,
    last_values: BTreeMap<String, f64>,
    last_labels: BTreeMap<String, String>,
    dropped: u64,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: RecorderState::Idle,
            session_id: None,
            start_time: None,
            samples: Vec::new(),
            summary: None,
            timer_id: None,
            last_values: BTreeMap::new(),
            last_labels: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// True when every field is within `min_change` of its last kept value
    fn is_unchanged(
        &self,
        min_change: f64,
        values: &BTreeMap<String, f64>,
        labels: &BTreeMap<String, String>,
    ) -> bool {
        if min_change <= 0.0 || (values.is_empty() && labels.is_empty()) {
            return false;
        }
        values.iter().all(|(field, value)| {
            self.last_values
                .get(field)
                .is_some_and(|last| (value - last).abs() <= min_change)
        }) && labels
            .iter()
            .all(|(field, label)| self.last_labels.get(field) == Some(label))
    }
}

struct RecorderInner {
    config: RecorderConfig,
    complete_type: String,
    started_type: String,
    backend: Option<Arc<dyn TimerBackend>>,
    bus: Option<Arc<EventBus>>,
    sink: Arc<dyn ExportSink>,
    reporter: Arc<dyn ErrorReporter>,
    session: Mutex<Session>,
    attachments: Mutex<HashMap<u64, Vec<(String, ListenerId)>>>,
}

/// Builder for [`SessionRecorder`]
pub struct RecorderBuilder {
    config: RecorderConfig,
    backend: Option<Arc<dyn TimerBackend>>,
    bus: Option<Arc<EventBus>>,
    sink: Option<Arc<dyn ExportSink>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl RecorderBuilder {
    /// Needed only for `max_duration_ms`
    pub fn backend(mut self, backend: Arc<dyn TimerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Emit `<namespace>:started` and `<namespace>:complete` on `bus`
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to an in-memory sink
    pub fn sink(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<SessionRecorder> {
        self.config.validate()?;
        if self.config.max_duration_ms.is_some() && self.backend.is_none() {
            return Err(SyncError::invalid(
                "recorder max_duration_ms needs a timer backend",
            ));
        }
        let reporter = self
            .reporter
            .or_else(|| self.bus.as_ref().map(|bus| bus.reporter()))
            .unwrap_or_else(|| Arc::new(TracingReporter));
        let namespace = &self.config.namespace;
        Ok(SessionRecorder {
            inner: Arc::new(RecorderInner {
                complete_type: format!("{}{}complete", namespace, DELIMITER),
                started_type: format!("{}{}started", namespace, DELIMITER),
                config: self.config,
                backend: self.backend,
                bus: self.bus,
                sink: self
                    .sink
                    .unwrap_or_else(|| Arc::new(MemoryExportSink::new())),
                reporter,
                session: Mutex::new(Session::idle()),
                attachments: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Handle to a session recorder; clones share the same buffer
#[derive(Clone)]
pub struct SessionRecorder {
    inner: Arc<RecorderInner>,
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.lock();
        f.debug_struct("SessionRecorder")
            .field("state", &session.state)
            .field("session_id", &session.session_id)
            .field("samples", &session.samples.len())
            .finish()
    }
}

impl SessionRecorder {
    pub fn builder(config: RecorderConfig) -> RecorderBuilder {
        RecorderBuilder {
            config,
            backend: None,
            bus: None,
            sink: None,
            reporter: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RecorderState {
        self.inner.session.lock().state
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().session_id.clone()
    }

    /// Begin a session and return its id
    ///
    /// While recording this is a no-op returning the current id. From
    /// `Stopped` the previous session is discarded.
    pub fn start(&self) -> Result<String> {
        let inner = &self.inner;
        let (session_id, stale_timer) = {
            let mut session = inner.session.lock();
            if session.state == RecorderState::Recording {
                if let Some(id) = &session.session_id {
                    return Ok(id.clone());
                }
            }
            let stale_timer = session.timer_id.take();
            *session = Session::idle();
            let session_id = uuid::Uuid::new_v4().to_string();
            session.state = RecorderState::Recording;
            session.session_id = Some(session_id.clone());
            session.start_time = Some(Utc::now());
            (session_id, stale_timer)
        };
        if let (Some(id), Some(backend)) = (stale_timer, &inner.backend) {
            backend.cancel(&id)?;
        }

        if let (Some(max_ms), Some(backend)) = (inner.config.max_duration_ms, &inner.backend) {
            let timer_id = format!("recording/{}", session_id);
            let callback: Arc<dyn TimerCallback> = Arc::new(AutoStop {
                recorder: Arc::downgrade(inner),
            });
            backend.schedule_once(
                &timer_id,
                Duration::from_millis(max_ms),
                TimerEvent::RecordingTimeout {
                    session_id: session_id.clone(),
                },
                callback,
            )?;
            inner.session.lock().timer_id = Some(timer_id);
        }

        tracing::info!(
            session_id = %session_id,
            max_duration_ms = ?inner.config.max_duration_ms,
            "recording started"
        );
        inner.emit(
            &inner.started_type,
            EventPayload::SessionStarted {
                session_id: session_id.clone(),
            },
        );
        Ok(session_id)
    }

    /// Freeze the buffer and compute the summary
    ///
    /// Returns the summary of the stopped session; `None` when idle.
    pub fn stop(&self) -> Result<Option<SessionSummary>> {
        self.inner.stop_session(None)
    }

    /// Discard the buffer and session identity
    pub fn clear(&self) -> Result<()> {
        let timer = {
            let mut session = self.inner.session.lock();
            let timer = session.timer_id.take();
            *session = Session::idle();
            timer
        };
        if let (Some(id), Some(backend)) = (timer, &self.inner.backend) {
            backend.cancel(&id)?;
        }
        tracing::debug!("recording cleared");
        Ok(())
    }

    /// Append a sample stamped now
    ///
    /// Returns false when not recording or when the sample is within
    /// `min_change` of the last kept values.
    pub fn record(
        &self,
        values: BTreeMap<String, f64>,
        labels: BTreeMap<String, String>,
    ) -> Result<bool> {
        self.record_at(Utc::now(), values, labels)
    }

    /// Append a sample with an explicit timestamp
    pub fn record_at(
        &self,
        timestamp: DateTime<Utc>,
        values: BTreeMap<String, f64>,
        labels: BTreeMap<String, String>,
    ) -> Result<bool> {
        if let Some((field, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SyncError::invalid(format!(
                "sample field '{}' must be finite, got {}",
                field, value
            )));
        }

        let mut session = self.inner.session.lock();
        if session.state != RecorderState::Recording {
            return Ok(false);
        }
        if session.is_unchanged(self.inner.config.min_change, &values, &labels) {
            session.dropped += 1;
            return Ok(false);
        }

        let start = session.start_time.unwrap_or(timestamp);
        for (field, value) in &values {
            session.last_values.insert(field.clone(), *value);
        }
        for (field, label) in &labels {
            session.last_labels.insert(field.clone(), label.clone());
        }
        session.samples.push(Sample {
            timestamp,
            session_relative_ms: (timestamp - start).num_milliseconds(),
            values,
            labels,
        });
        Ok(true)
    }

    /// Record `event` if it qualifies as a sample
    pub fn capture(&self, event: &Event) -> Result<bool> {
        match sample_fields(event) {
            Some((values, labels)) => self.record_at(event.timestamp, values, labels),
            None => Ok(false),
        }
    }

    /// Capture events from `bus` whose type starts with a capture prefix
    ///
    /// Registers one namespace-wide listener per distinct namespace. Attaching
    /// to a bus that is already attached returns the existing ids.
    pub fn attach(&self, bus: &EventBus) -> Result<Vec<ListenerId>> {
        let mut attachments = self.inner.attachments.lock();
        if let Some(existing) = attachments.get(&bus.instance_id()) {
            return Ok(existing.iter().map(|(_, id)| *id).collect());
        }

        let prefixes = self.inner.config.capture_prefixes.clone();
        let namespaces: BTreeSet<String> = prefixes
            .iter()
            .filter_map(|p| p.split_once(DELIMITER))
            .map(|(namespace, _)| namespace.to_string())
            .collect();

        let mut registered = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            let weak: Weak<RecorderInner> = Arc::downgrade(&self.inner);
            let prefixes = prefixes.clone();
            let listener = Arc::new(move |event: &Event| -> ListenerResult {
                if !prefixes.iter().any(|p| event.event_type.starts_with(p.as_str())) {
                    return Ok(());
                }
                match weak.upgrade() {
                    Some(inner) => SessionRecorder { inner }
                        .capture(event)
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    None => Ok(()),
                }
            });
            let event_type = format!("{}{}{}", namespace, DELIMITER, WILDCARD);
            match bus.on_labeled(&event_type, "recorder", listener) {
                Ok(id) => registered.push((event_type, id)),
                Err(err) => {
                    for (event_type, id) in &registered {
                        bus.off(event_type, *id);
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(prefixes = ?self.inner.config.capture_prefixes, "recorder attached");
        let ids = registered.iter().map(|(_, id)| *id).collect();
        attachments.insert(bus.instance_id(), registered);
        Ok(ids)
    }

    /// Stop capturing from `bus`; returns whether it was attached
    pub fn detach(&self, bus: &EventBus) -> bool {
        let Some(registered) = self.inner.attachments.lock().remove(&bus.instance_id()) else {
            return false;
        };
        for (event_type, id) in registered {
            bus.off(&event_type, id);
        }
        tracing::debug!("recorder detached");
        true
    }

    /// Copy of the buffered samples
    pub fn samples(&self) -> Vec<Sample> {
        self.inner.session.lock().samples.clone()
    }

    pub fn sample_count(&self) -> usize {
        self.inner.session.lock().samples.len()
    }

    /// Samples dropped by the `min_change` filter this session
    pub fn dropped_count(&self) -> u64 {
        self.inner.session.lock().dropped
    }

    /// Final summary when stopped, provisional summary while recording
    pub fn summary(&self) -> Option<SessionSummary> {
        let session = self.inner.session.lock();
        match session.state {
            RecorderState::Idle => None,
            RecorderState::Stopped => session.summary.clone(),
            RecorderState::Recording => provisional_summary(&session),
        }
    }

    /// Render the session without delivering it; `None` when empty
    pub fn render(&self, format: ExportFormat) -> Result<Option<ExportArtifact>> {
        let session = self.inner.session.lock();
        if session.samples.is_empty() {
            return Ok(None);
        }
        let summary = match session.state {
            RecorderState::Stopped => session.summary.clone(),
            _ => provisional_summary(&session),
        };
        let Some(summary) = summary else {
            return Ok(None);
        };
        render(format, &summary, &session.samples).map(Some)
    }

    /// Render and hand the session to the sink
    ///
    /// Repeatable; the buffer is kept until `clear()`.
    pub fn export(&self, format: ExportFormat) -> Result<ExportOutcome> {
        let Some(artifact) = self.render(format)? else {
            tracing::warn!(format = %format, "nothing to export");
            return Ok(ExportOutcome::NothingToExport);
        };
        self.inner
            .sink
            .deliver(&artifact)
            .map_err(|e| SyncError::ExportFailure {
                reason: format!(
                    "{} sink rejected '{}': {}",
                    self.inner.sink.name(),
                    artifact.file_name,
                    e
                ),
            })?;
        tracing::info!(
            file_name = %artifact.file_name,
            sink = self.inner.sink.name(),
            bytes = artifact.content.len(),
            "session exported"
        );
        Ok(ExportOutcome::Exported {
            bytes: artifact.content.len(),
            file_name: artifact.file_name,
        })
    }
}

fn provisional_summary(session: &Session) -> Option<SessionSummary> {
    let id = session.session_id.as_deref()?;
    let start = session.start_time?;
    Some(summary::summarize(id, start, Utc::now(), &session.samples, true))
}

impl RecorderInner {
    /// Stop the running session; `only` restricts it to one session id
    fn stop_session(&self, only: Option<&str>) -> Result<Option<SessionSummary>> {
        let (summary, timer) = {
            let mut session = self.session.lock();
            match session.state {
                RecorderState::Idle => return Ok(None),
                RecorderState::Stopped => return Ok(session.summary.clone()),
                RecorderState::Recording => {}
            }
            if let Some(only) = only {
                if session.session_id.as_deref() != Some(only) {
                    return Ok(None);
                }
            }
            let (Some(id), Some(start)) = (session.session_id.clone(), session.start_time) else {
                return Ok(None);
            };
            let summary = summary::summarize(&id, start, Utc::now(), &session.samples, false);
            session.state = RecorderState::Stopped;
            session.summary = Some(summary.clone());
            (summary, session.timer_id.take())
        };

        // The auto-stop timer cancels nothing when it is the one firing
        if let (Some(id), Some(backend), None) = (timer, &self.backend, only) {
            backend.cancel(&id)?;
        }

        tracing::info!(
            session_id = %summary.session_id,
            samples = summary.sample_count,
            duration_ms = summary.duration_ms(),
            "recording complete"
        );
        self.emit(
            &self.complete_type,
            EventPayload::SessionComplete(summary.clone()),
        );
        Ok(Some(summary))
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.emit(event_type, payload) {
                self.reporter.report(&err);
            }
        }
    }
}

struct AutoStop {
    recorder: Weak<RecorderInner>,
}

impl TimerCallback for AutoStop {
    fn on_timer(&self, event: TimerEvent) -> Result<()> {
        let TimerEvent::RecordingTimeout { session_id } = event else {
            return Ok(());
        };
        let Some(recorder) = self.recorder.upgrade() else {
            return Ok(());
        };
        if recorder.stop_session(Some(&session_id))?.is_some() {
            tracing::info!(session_id = %session_id, "recording auto-stopped");
        }
        Ok(())
    }
}

/// Sample fields carried by `event`, if it is a sample at all
pub fn sample_fields(
    event: &Event,
) -> Option<(BTreeMap<String, f64>, BTreeMap<String, String>)> {
    let mut values = BTreeMap::new();
    let mut labels = BTreeMap::new();
    match &event.payload {
        EventPayload::Field(state) => {
            values.insert(state.engine.clone(), state.level);
            if let Some(phase) = &state.phase {
                labels.insert(format!("{}_phase", state.engine), phase.clone());
            }
        }
        EventPayload::Composite(reading) => {
            let namespace = event.namespace();
            values.insert(namespace.to_string(), reading.value);
            let status = serde_json::to_value(reading.balance.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))?;
            labels.insert(format!("{}_balance", namespace), status);
        }
        EventPayload::Custom {
            data: Value::Object(fields),
        } => {
            for (key, value) in fields {
                match value {
                    Value::Number(n) => {
                        if let Some(v) = n.as_f64() {
                            values.insert(key.clone(), v);
                        }
                    }
                    Value::String(s) => {
                        labels.insert(key.clone(), s.clone());
                    }
                    _ => {}
                }
            }
        }
        _ => return None,
    }
    if values.is_empty() && labels.is_empty() {
        return None;
    }
    Some((values, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryReporter;
    use crate::timing::ManualTimerBackend;
    use serde_json::json;

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn recorder() -> (SessionRecorder, Arc<MemoryExportSink>) {
        let sink = Arc::new(MemoryExportSink::new());
        let recorder = SessionRecorder::builder(RecorderConfig::new())
            .sink(sink.clone())
            .build()
            .unwrap();
        (recorder, sink)
    }

    #[test]
    fn test_records_only_while_recording() {
        let (recorder, _) = recorder();
        assert!(!recorder.record(values(&[("v", 1.0)]), BTreeMap::new()).unwrap());
        recorder.start().unwrap();
        assert!(recorder.record(values(&[("v", 1.0)]), BTreeMap::new()).unwrap());
        recorder.stop().unwrap();
        assert!(!recorder.record(values(&[("v", 2.0)]), BTreeMap::new()).unwrap());
        assert_eq!(recorder.sample_count(), 1);
    }

    #[test]
    fn test_start_while_recording_keeps_session() {
        let (recorder, _) = recorder();
        let first = recorder.start().unwrap();
        recorder.record(values(&[("v", 1.0)]), BTreeMap::new()).unwrap();
        assert_eq!(recorder.start().unwrap(), first);
        assert_eq!(recorder.sample_count(), 1);

        recorder.stop().unwrap();
        let second = recorder.start().unwrap();
        assert_ne!(first, second);
        assert_eq!(recorder.sample_count(), 0);
    }

    #[test]
    fn test_stop_summarizes() {
        let bus = Arc::new(EventBus::default());
        let recorder = SessionRecorder::builder(RecorderConfig::new())
            .bus(bus.clone())
            .build()
            .unwrap();
        assert!(recorder.stop().unwrap().is_none());

        recorder.start().unwrap();
        for (v, phase) in [(0.2, "inhale"), (0.4, "hold"), (0.6, "inhale")] {
            let mut labels = BTreeMap::new();
            labels.insert("phase".to_string(), phase.to_string());
            recorder.record(values(&[("level", v)]), labels).unwrap();
        }
        let summary = recorder.stop().unwrap().unwrap();

        assert_eq!(summary.sample_count, 3);
        assert!((summary.numeric["level"].mean - 0.4).abs() < 1e-12);
        assert_eq!(summary.categorical["phase"].mode, "inhale");
        assert!(!summary.provisional);
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert_eq!(recorder.stop().unwrap(), Some(summary));

        assert_eq!(bus.history(Some("recording:started")).len(), 1);
        assert_eq!(bus.history(Some("recording:complete")).len(), 1);
    }

    #[test]
    fn test_export_empty_is_nothing_to_export() {
        let (recorder, sink) = recorder();
        assert_eq!(
            recorder.export(ExportFormat::Csv).unwrap(),
            ExportOutcome::NothingToExport
        );
        recorder.start().unwrap();
        recorder.stop().unwrap();
        assert_eq!(
            recorder.export(ExportFormat::Json).unwrap(),
            ExportOutcome::NothingToExport
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_export_is_repeatable_until_clear() {
        let (recorder, sink) = recorder();
        recorder.start().unwrap();
        recorder.record(values(&[("v", 0.5)]), BTreeMap::new()).unwrap();
        recorder.stop().unwrap();

        assert!(matches!(
            recorder.export(ExportFormat::Csv).unwrap(),
            ExportOutcome::Exported { .. }
        ));
        assert!(matches!(
            recorder.export(ExportFormat::Json).unwrap(),
            ExportOutcome::Exported { .. }
        ));
        assert_eq!(sink.len(), 2);
        assert_eq!(recorder.sample_count(), 1);

        recorder.clear().unwrap();
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.session_id().is_none());
        assert_eq!(
            recorder.export(ExportFormat::Csv).unwrap(),
            ExportOutcome::NothingToExport
        );
    }

    #[test]
    fn test_export_while_recording_is_provisional() {
        let (recorder, sink) = recorder();
        recorder.start().unwrap();
        recorder.record(values(&[("v", 0.5)]), BTreeMap::new()).unwrap();
        recorder.export(ExportFormat::Json).unwrap();

        let doc: serde_json::Value = serde_json::from_str(&sink.last().unwrap().content).unwrap();
        assert_eq!(doc["summary"]["provisional"], true);
        assert!(recorder.is_recording());
    }

    struct FailingSink;

    impl ExportSink for FailingSink {
        fn deliver(&self, _artifact: &ExportArtifact) -> Result<()> {
            Err(SyncError::Io {
                message: "disk full".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_sink_failure_is_export_failure() {
        let recorder = SessionRecorder::builder(RecorderConfig::new())
            .sink(Arc::new(FailingSink))
            .build()
            .unwrap();
        recorder.start().unwrap();
        recorder.record(values(&[("v", 0.5)]), BTreeMap::new()).unwrap();
        let err = recorder.export(ExportFormat::Csv).unwrap_err();
        assert_eq!(err.error_code(), "EXPORT_FAILURE");
        assert!(err.to_string().contains("disk full"));
        assert_eq!(recorder.sample_count(), 1);
    }

    #[test]
    fn test_min_change_drops_flat_samples() {
        let recorder = SessionRecorder::builder(RecorderConfig::new().min_change(0.05))
            .build()
            .unwrap();
        recorder.start().unwrap();
        let kept: Vec<bool> = [0.50, 0.52, 0.54, 0.56, 0.57, 0.70]
            .iter()
            .map(|v| recorder.record(values(&[("v", *v)]), BTreeMap::new()).unwrap())
            .collect();
        assert_eq!(kept, vec![true, false, false, true, false, true]);
        assert_eq!(recorder.dropped_count(), 3);

        // a new field always counts as a change
        assert!(recorder
            .record(values(&[("v", 0.70), ("w", 0.1)]), BTreeMap::new())
            .unwrap());
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let (recorder, _) = recorder();
        recorder.start().unwrap();
        assert!(recorder
            .record(values(&[("v", f64::NAN)]), BTreeMap::new())
            .is_err());
        assert_eq!(recorder.sample_count(), 0);
    }

    #[test]
    fn test_auto_stop_after_max_duration() {
        let backend = Arc::new(ManualTimerBackend::new());
        let recorder = SessionRecorder::builder(RecorderConfig::new().max_duration(Duration::from_secs(3)))
            .backend(backend.clone())
            .build()
            .unwrap();

        recorder.start().unwrap();
        backend.advance(Duration::from_millis(2999));
        assert!(recorder.is_recording());
        backend.advance(Duration::from_millis(1));
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(recorder.summary().is_some());
    }

    #[test]
    fn test_manual_stop_cancels_auto_stop() {
        let backend = Arc::new(ManualTimerBackend::new());
        let recorder = SessionRecorder::builder(RecorderConfig::new().max_duration(Duration::from_secs(3)))
            .backend(backend.clone())
            .build()
            .unwrap();

        recorder.start().unwrap();
        assert_eq!(backend.pending(), 1);
        recorder.stop().unwrap();
        assert_eq!(backend.pending(), 0);

        recorder.start().unwrap();
        recorder.clear().unwrap();
        assert_eq!(backend.pending(), 0);
    }

    #[test]
    fn test_max_duration_requires_backend() {
        assert!(SessionRecorder::builder(RecorderConfig::new().max_duration(Duration::from_secs(1)))
            .build()
            .is_err());
    }

    #[test]
    fn test_attach_captures_matching_prefixes() {
        let reporter = Arc::new(MemoryReporter::new());
        let bus = EventBus::default().with_reporter(reporter.clone());
        let recorder = SessionRecorder::builder(
            RecorderConfig::new().capture("consciousness:update").capture("eeg:"),
        )
        .build()
        .unwrap();
        let ids = recorder.attach(&bus).unwrap();
        assert_eq!(ids.len(), 2);
        recorder.start().unwrap();

        bus.emit("eeg:sample", EventPayload::custom(json!({"alpha": 0.4, "state": "calm", "raw": [1, 2]})))
            .unwrap();
        bus.emit("consciousness:high", EventPayload::custom(json!({"v": 1.0})))
            .unwrap();
        bus.emit("other:update", EventPayload::custom(json!({"v": 1.0})))
            .unwrap();
        bus.emit("consciousness:update", EventPayload::custom(json!({"coherence": 0.9})))
            .unwrap();

        let samples = recorder.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].values["alpha"], 0.4);
        assert_eq!(samples[0].labels["state"], "calm");
        assert_eq!(samples[1].values["coherence"], 0.9);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_capture_prefix_matches_within_namespace() {
        let bus = EventBus::default();
        let recorder =
            SessionRecorder::builder(RecorderConfig::new().capture("consciousness:up"))
                .build()
                .unwrap();
        recorder.attach(&bus).unwrap();
        recorder.start().unwrap();

        bus.emit("consciousness:update", EventPayload::custom(json!({"coherence": 0.7})))
            .unwrap();
        bus.emit("consciousness:high", EventPayload::custom(json!({"coherence": 0.9})))
            .unwrap();

        let samples = recorder.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].values["coherence"], 0.7);
    }

    #[test]
    fn test_prefix_without_namespace_is_rejected() {
        let result = SessionRecorder::builder(RecorderConfig::new().capture("consc")).build();
        assert!(matches!(result, Err(SyncError::InvalidArgument { .. })));
    }

    #[test]
    fn test_attach_twice_records_each_event_once() {
        let bus = EventBus::default();
        let recorder = SessionRecorder::builder(
            RecorderConfig::new().capture("eeg:").capture("consciousness:update"),
        )
        .build()
        .unwrap();
        let first = recorder.attach(&bus).unwrap();
        let second = recorder.attach(&bus).unwrap();
        assert_eq!(first, second);
        assert_eq!(bus.listener_count("eeg:*"), 1);
        recorder.start().unwrap();

        bus.emit("eeg:sample", EventPayload::custom(json!({"alpha": 0.4})))
            .unwrap();
        assert_eq!(recorder.sample_count(), 1);

        assert!(recorder.detach(&bus));
        assert!(!recorder.detach(&bus));
        assert_eq!(bus.listener_count("eeg:*"), 0);
        bus.emit("eeg:sample", EventPayload::custom(json!({"alpha": 0.5})))
            .unwrap();
        assert_eq!(recorder.sample_count(), 1);

        recorder.attach(&bus).unwrap();
        bus.emit("eeg:sample", EventPayload::custom(json!({"alpha": 0.6})))
            .unwrap();
        assert_eq!(recorder.sample_count(), 2);
    }

    #[test]
    fn test_sample_fields_from_payloads() {
        let event = |event_type: &str, payload| Event {
            event_type: event_type.to_string(),
            sequence: 0,
            timestamp: Utc::now(),
            payload,
        };

        let field = crate::engine::FieldState {
            engine: "breath".to_string(),
            level: 0.3,
            phase: Some("exhale".to_string()),
            tick: 4,
            last_update: Utc::now(),
            markers: Default::default(),
        };
        let (v, l) = sample_fields(&event("breathing:update", EventPayload::Field(field))).unwrap();
        assert_eq!(v["breath"], 0.3);
        assert_eq!(l["breath_phase"], "exhale");

        assert!(sample_fields(&event(
            "recording:started",
            EventPayload::SessionStarted {
                session_id: "s".to_string()
            }
        ))
        .is_none());
        assert!(sample_fields(&event("x:y", EventPayload::custom(json!([1, 2])))).is_none());
    }
}
