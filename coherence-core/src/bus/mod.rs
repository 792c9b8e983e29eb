//! Namespaced publish/subscribe
//!
//! The bus is the seam between producers (engines, the aggregator, the
//! recorder, external feeds) and everything that reacts to them.
//!
//! ```text
//! emit("consciousness:update", payload)
//!   │
//!   ├─► history ring (capped, oldest evicted)
//!   ├─► listeners on "consciousness:update"   (registration order)
//!   └─► listeners on "consciousness:*"        (registration order)
//! ```
//!
//! ## Listener isolation
//!
//! A listener that returns `Err` or panics is reported through the injected
//! [`ErrorReporter`] as `ListenerFailure`; remaining listeners still run and
//! `emit` still returns `Ok`.
//!
//! ## Re-entrancy
//!
//! No lock is held while listeners run, so a listener may emit, subscribe
//! or unsubscribe on the same bus.

mod event;

pub use event::{split_event_type, Event, EventPayload, DELIMITER, WILDCARD};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::BusConfig;
use crate::error::{panic_message, ErrorReporter, Result, SyncError, TracingReporter};
use crate::history::{HistoryRing, RingStats};

/// What a listener hands back: `Err` is reported, never propagated
pub type ListenerResult = std::result::Result<(), String>;

/// Shared listener callback
///
/// Registering the same `Arc` twice under one type is a no-op that returns
/// the original id. The same `Arc` registered under both `"ns:verb"` and
/// `"ns:*"` is called once per emission.
pub type Listener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Registration {
    id: ListenerId,
    label: String,
    callback: Listener,
}

impl Registration {
    fn same_callback(&self, other: &Listener) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.callback) as *const (),
            Arc::as_ptr(other) as *const (),
        )
    }
}

/// Bus statistics
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Total successful emissions
    pub emitted: u64,
    /// Listener invocations that failed
    pub listener_failures: u64,
    /// Registered listeners across all types
    pub listeners: usize,
    /// History ring counters
    pub history: RingStats,
}

/// Namespaced event bus with bounded history
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
    history: Mutex<HistoryRing<Event>>,
    sequence: AtomicU64,
    next_id: AtomicU64,
    failures: AtomicU64,
    instance: u64,
    reporter: Arc<dyn ErrorReporter>,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("emitted", &self.sequence.load(Ordering::SeqCst))
            .field("types", &self.listeners.read().len())
            .field("history", &self.history.lock().stats())
            .finish()
    }
}

impl EventBus {
    /// Create a bus from configuration
    pub fn new(config: BusConfig) -> Result<Self> {
        Ok(Self {
            listeners: RwLock::new(HashMap::new()),
            history: Mutex::new(HistoryRing::new(config.history_capacity)?),
            sequence: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            reporter: Arc::new(TracingReporter),
        })
    }

    /// Route isolated failures to `reporter` instead of the log
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Register `listener` for `event_type` (exact type or `"namespace:*"`)
    pub fn on(&self, event_type: &str, listener: Listener) -> Result<ListenerId> {
        self.register(event_type, None, listener)
    }

    /// Register with a label used when reporting failures
    pub fn on_labeled(
        &self,
        event_type: &str,
        label: &str,
        listener: Listener,
    ) -> Result<ListenerId> {
        self.register(event_type, Some(label), listener)
    }

    /// Convenience: wrap a closure and register it
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Result<ListenerId>
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(event_type, None, Arc::new(callback))
    }

    fn register(
        &self,
        event_type: &str,
        label: Option<&str>,
        listener: Listener,
    ) -> Result<ListenerId> {
        split_event_type(event_type, true)?;

        let mut listeners = self.listeners.write();
        let entries = listeners.entry(event_type.to_string()).or_default();

        if let Some(existing) = entries.iter().find(|r| r.same_callback(&listener)) {
            tracing::debug!(event_type, id = %existing.id, "listener already registered");
            return Ok(existing.id);
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        entries.push(Registration {
            id,
            label: label.map(str::to_string).unwrap_or_else(|| id.to_string()),
            callback: listener,
        });
        tracing::debug!(event_type, id = %id, "listener registered");
        Ok(id)
    }

    /// Unregister; returns false if `id` was not registered for `event_type`
    pub fn off(&self, event_type: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|r| r.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event_type);
        }
        removed
    }

    /// Emit an event
    ///
    /// Fails only for a malformed type; listener failures are reported and
    /// swallowed.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> Result<()> {
        let (namespace, _) = split_event_type(event_type, false)?;
        let wildcard = format!("{}{}{}", namespace, DELIMITER, WILDCARD);

        let event = Event {
            event_type: event_type.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            payload,
        };

        self.history.lock().push(event.clone());

        // Snapshot so listeners can touch the bus without deadlocking
        let targets: Vec<(String, Listener)> = {
            let listeners = self.listeners.read();
            let mut targets: Vec<(String, Listener)> = Vec::new();
            let entries = [event_type, wildcard.as_str()]
                .into_iter()
                .filter_map(|t| listeners.get(t))
                .flatten();
            for r in entries {
                if !targets.iter().any(|(_, seen)| r.same_callback(seen)) {
                    targets.push((r.label.clone(), Arc::clone(&r.callback)));
                }
            }
            targets
        };

        tracing::trace!(
            event_type,
            kind = event.payload.kind(),
            listeners = targets.len(),
            "emit"
        );

        for (label, callback) in targets {
            self.invoke(&label, &callback, &event);
        }
        Ok(())
    }

    fn invoke(&self, label: &str, callback: &Listener, event: &Event) {
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(event)));
        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(reason)) => reason,
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.reporter.report(&SyncError::ListenerFailure {
            event_type: event.event_type.clone(),
            subscriber: label.to_string(),
            reason,
        });
    }

    /// Copy of the history, oldest first, optionally filtered by type prefix
    pub fn history(&self, prefix: Option<&str>) -> Vec<Event> {
        let history = self.history.lock();
        match prefix {
            Some(prefix) => history.snapshot_where(|e| e.event_type.starts_with(prefix)),
            None => history.snapshot(),
        }
    }

    /// Drop all retained history
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Number of listeners registered for exactly `event_type`
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted: self.sequence.load(Ordering::SeqCst),
            listener_failures: self.failures.load(Ordering::SeqCst),
            listeners: self.listeners.read().values().map(Vec::len).sum(),
            history: self.history.lock().stats(),
        }
    }

    /// Process-unique id of this bus, for keeping track of attachments
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    /// The reporter isolated failures go to
    pub fn reporter(&self) -> Arc<dyn ErrorReporter> {
        Arc::clone(&self.reporter)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            history: Mutex::new(HistoryRing::default()),
            sequence: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            reporter: Arc::new(TracingReporter),
        }
    }
}
