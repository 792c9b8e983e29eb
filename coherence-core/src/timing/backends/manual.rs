//! Manual timer backend
//!
//! A fake clock that only moves when the caller advances it. Due timers fire
//! synchronously on the caller's thread in deadline order, so tests can step
//! an engine tick by tick without sleeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ErrorReporter, Result, TracingReporter};
use crate::timing::{check_interval, TimerBackend, TimerCallback, TimerEvent};

struct ManualTimer {
    deadline: Duration,
    /// Scheduling order, breaks deadline ties
    seq: u64,
    interval: Option<Duration>,
    event: TimerEvent,
    callback: Arc<dyn TimerCallback>,
}

#[derive(Default)]
struct ClockState {
    now: Duration,
    next_seq: u64,
    timers: HashMap<String, ManualTimer>,
}

/// Timer backend driven by [`advance`](ManualTimerBackend::advance)
///
/// Callbacks may schedule or cancel timers on the same backend, including
/// their own. Callback errors go to the reporter.
pub struct ManualTimerBackend {
    state: Mutex<ClockState>,
    reporter: Arc<dyn ErrorReporter>,
}

impl ManualTimerBackend {
    /// Create a backend whose clock starts at zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState::default()),
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Send callback errors to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Time elapsed on the fake clock
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of scheduled timers
    pub fn pending(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Ids of scheduled timers, soonest first
    pub fn pending_ids(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<(&String, &ManualTimer)> = state.timers.iter().collect();
        ids.sort_by_key(|(_, t)| (t.deadline, t.seq));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Move the clock forward by `by`, firing every timer that comes due
    ///
    /// Returns how many callbacks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        self.run_until(target)
    }

    /// Jump to the next deadline and fire everything due then
    ///
    /// Returns 0 without moving the clock when nothing is scheduled.
    pub fn advance_to_next(&self) -> usize {
        let next = self.state.lock().timers.values().map(|t| t.deadline).min();
        match next {
            Some(deadline) => self.run_until(deadline),
            None => 0,
        }
    }

    fn run_until(&self, target: Duration) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state
                    .timers
                    .iter()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.seq))
                    .map(|(id, _)| id.clone());

                let Some(id) = next else {
                    if state.now < target {
                        state.now = target;
                    }
                    break;
                };

                let seq = state.next_seq;
                state.next_seq += 1;
                let (deadline, repeat) = match state.timers.get(&id) {
                    Some(t) => (t.deadline, t.interval),
                    None => break,
                };
                state.now = state.now.max(deadline);

                match repeat {
                    Some(interval) => state.timers.get_mut(&id).map(|timer| {
                        timer.deadline = deadline + interval;
                        timer.seq = seq;
                        (id.clone(), timer.event.clone(), Arc::clone(&timer.callback))
                    }),
                    None => state
                        .timers
                        .remove(&id)
                        .map(|timer| (id.clone(), timer.event, timer.callback)),
                }
            };

            let Some((id, event, callback)) = due else {
                continue;
            };

            fired += 1;
            tracing::trace!(timer = %id, "manual timer fired");
            if let Err(err) = callback.on_timer(event) {
                self.reporter.report(&err);
            }
        }
        fired
    }

    fn insert(
        &self,
        id: &str,
        delay: Duration,
        interval: Option<Duration>,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = state.now + delay;
        state.timers.insert(
            id.to_string(),
            ManualTimer {
                deadline,
                seq,
                interval,
                event,
                callback,
            },
        );
    }
}

impl Default for ManualTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ManualTimerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualTimerBackend")
            .field("now", &state.now)
            .field("pending", &state.timers.len())
            .finish()
    }
}

impl TimerBackend for ManualTimerBackend {
    fn schedule_once(
        &self,
        id: &str,
        delay: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        self.insert(id, delay, None, event, callback);
        Ok(())
    }

    fn schedule_repeating(
        &self,
        id: &str,
        interval: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        check_interval(id, interval)?;
        self.insert(id, interval, Some(interval), event, callback);
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        Ok(self.state.lock().timers.remove(id).is_some())
    }

    fn exists(&self, id: &str) -> bool {
        self.state.lock().timers.contains_key(id)
    }

    fn time_remaining(&self, id: &str) -> Option<Duration> {
        let state = self.state.lock();
        state
            .timers
            .get(id)
            .map(|t| t.deadline.saturating_sub(state.now))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
