//! # Scheduling
//!
//! Engines and the recorder never sleep or spawn on their own. They ask an
//! injected [`TimerBackend`] to call them back, which lets tests drive time
//! by hand and lets a host swap in its own clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │   PeriodicEngine     │   │   SessionRecorder    │
//! │  repeating tick      │   │  one-shot auto-stop  │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │ schedule / cancel        │
//!            ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │               TimerBackend (trait)              │
//! ├────────────────────────┬────────────────────────┤
//! │ ManualTimerBackend     │ ThreadTimerBackend     │
//! │ (fake clock, tests)    │ (one driver thread)    │
//! └────────────────────────┴────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use coherence_core::timing::{ManualTimerBackend, TimerBackend, TimerEvent};
//!
//! let backend = ManualTimerBackend::new();
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! backend
//!     .schedule_repeating(
//!         "pulse",
//!         Duration::from_millis(100),
//!         TimerEvent::custom("pulse"),
//!         Arc::new(move |_event: TimerEvent| -> coherence_core::Result<()> {
//!             counter.fetch_add(1, Ordering::SeqCst);
//!             Ok(())
//!         }),
//!     )
//!     .unwrap();
//!
//! assert_eq!(backend.advance(Duration::from_millis(350)), 3);
//! assert_eq!(fired.load(Ordering::SeqCst), 3);
//! ```

pub mod backends;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub use backends::{ManualTimerBackend, ThreadTimerBackend};

/// What a timer carries back to its callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerEvent {
    /// Periodic engine tick; `generation` identifies the start() it belongs to
    EngineTick { engine: String, generation: u64 },
    /// Recording session reached its maximum duration
    RecordingTimeout { session_id: String },
    /// Host-defined timer
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl TimerEvent {
    /// Custom timer with no data
    pub fn custom(name: &str) -> Self {
        TimerEvent::Custom {
            name: name.to_string(),
            data: serde_json::Value::Null,
        }
    }
}

/// Callback for timer events
///
/// Errors are handed to the backend's reporter; they never stop the timer.
pub trait TimerCallback: Send + Sync {
    /// Called when a timer fires
    fn on_timer(&self, event: TimerEvent) -> Result<()>;
}

impl<F> TimerCallback for F
where
    F: Fn(TimerEvent) -> Result<()> + Send + Sync,
{
    fn on_timer(&self, event: TimerEvent) -> Result<()> {
        self(event)
    }
}

/// Abstract timer backend
///
/// Scheduling under an id that already exists replaces the old timer.
pub trait TimerBackend: Send + Sync {
    /// Schedule a one-shot timer
    fn schedule_once(
        &self,
        id: &str,
        delay: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()>;

    /// Schedule a repeating timer; the first firing is one interval from now
    fn schedule_repeating(
        &self,
        id: &str,
        interval: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()>;

    /// Cancel a scheduled timer; false if nothing was scheduled under `id`
    fn cancel(&self, id: &str) -> Result<bool>;

    /// Check if a timer exists
    fn exists(&self, id: &str) -> bool;

    /// Time until the timer next fires
    fn time_remaining(&self, id: &str) -> Option<Duration>;

    /// Backend name (for logging)
    fn name(&self) -> &'static str;
}

pub(crate) fn check_interval(id: &str, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(SyncError::invalid(format!(
            "repeating timer '{}' needs a non-zero interval",
            id
        )));
    }
    Ok(())
}
