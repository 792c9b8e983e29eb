//! Thread timer backend
//!
//! One driver thread owns the wait; timers live in a shared table and the
//! driver is woken over a crossbeam channel whenever the table changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{ErrorReporter, Result, SyncError, TracingReporter};
use crate::timing::{check_interval, TimerBackend, TimerCallback, TimerEvent};

enum Command {
    Wake,
    Shutdown,
}

struct ThreadTimer {
    deadline: Instant,
    seq: u64,
    interval: Option<Duration>,
    event: TimerEvent,
    callback: Arc<dyn TimerCallback>,
}

#[derive(Default)]
struct TimerTable {
    next_seq: u64,
    timers: HashMap<String, ThreadTimer>,
}

/// Real-time backend with a single driver thread
///
/// Callbacks run on the driver thread, one at a time. A repeating timer that
/// falls behind fires once and its next deadline is a full interval after
/// the current instant.
pub struct ThreadTimerBackend {
    table: Arc<Mutex<TimerTable>>,
    commands: Sender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimerBackend {
    /// Start the driver thread, reporting callback errors to the log
    pub fn new() -> Result<Self> {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    /// Start the driver thread, reporting callback errors to `reporter`
    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        let table = Arc::new(Mutex::new(TimerTable::default()));
        let (commands, inbox) = channel::unbounded();

        let driver_table = Arc::clone(&table);
        let driver = thread::Builder::new()
            .name("coherence-timer".to_string())
            .spawn(move || drive(driver_table, inbox, reporter))
            .map_err(|e| SyncError::Io {
                message: format!("cannot spawn timer thread: {}", e),
            })?;

        Ok(Self {
            table,
            commands,
            driver: Mutex::new(Some(driver)),
        })
    }

    fn insert(
        &self,
        id: &str,
        delay: Duration,
        interval: Option<Duration>,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        {
            let mut table = self.table.lock();
            let seq = table.next_seq;
            table.next_seq += 1;
            table.timers.insert(
                id.to_string(),
                ThreadTimer {
                    deadline: Instant::now() + delay,
                    seq,
                    interval,
                    event,
                    callback,
                },
            );
        }
        self.commands.send(Command::Wake).map_err(|_| SyncError::Io {
            message: "timer thread has stopped".to_string(),
        })
    }

    /// Stop the driver thread; pending timers never fire
    pub fn shutdown(&self) {
        self.table.lock().timers.clear();
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            // A callback dropping the last handle runs on the driver itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Next deadline of a repeating timer firing at `now`; skipped periods are dropped
fn next_deadline(deadline: Instant, interval: Duration, now: Instant) -> Instant {
    let next = deadline + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

fn drive(table: Arc<Mutex<TimerTable>>, inbox: Receiver<Command>, reporter: Arc<dyn ErrorReporter>) {
    tracing::debug!("timer thread started");
    loop {
        let now = Instant::now();
        let (due, wait) = {
            let mut table = table.lock();
            let next = table
                .timers
                .iter()
                .min_by_key(|(_, t)| (t.deadline, t.seq))
                .map(|(id, t)| (id.clone(), t.deadline));

            match next {
                Some((id, deadline)) if deadline <= now => {
                    let seq = table.next_seq;
                    table.next_seq += 1;
                    let due = match table.timers.get(&id).and_then(|t| t.interval) {
                        Some(interval) => table.timers.get_mut(&id).map(|timer| {
                            timer.deadline = next_deadline(deadline, interval, now);
                            timer.seq = seq;
                            let rearm = Some((id.clone(), seq, interval));
                            (timer.event.clone(), Arc::clone(&timer.callback), rearm)
                        }),
                        None => table
                            .timers
                            .remove(&id)
                            .map(|timer| (timer.event, timer.callback, None)),
                    };
                    (due, None)
                }
                Some((_, deadline)) => (None, Some(deadline - now)),
                None => (None, None),
            }
        };

        if let Some((event, callback, rearm)) = due {
            if let Err(err) = callback.on_timer(event) {
                reporter.report(&err);
            }
            // callbacks that overrun their interval re-arm from when they return
            if let Some((id, seq, interval)) = rearm {
                let now = Instant::now();
                if let Some(timer) = table.lock().timers.get_mut(&id) {
                    if timer.seq == seq && timer.deadline <= now {
                        timer.deadline = now + interval;
                    }
                }
            }
            continue;
        }

        let command = match wait {
            Some(wait) => match inbox.recv_timeout(wait) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => Command::Shutdown,
            },
            None => inbox.recv().unwrap_or(Command::Shutdown),
        };
        if let Command::Shutdown = command {
            break;
        }
    }
    tracing::debug!("timer thread stopped");
}

impl Drop for ThreadTimerBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadTimerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTimerBackend")
            .field("pending", &self.table.lock().timers.len())
            .finish()
    }
}

impl TimerBackend for ThreadTimerBackend {
    fn schedule_once(
        &self,
        id: &str,
        delay: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        self.insert(id, delay, None, event, callback)
    }

    fn schedule_repeating(
        &self,
        id: &str,
        interval: Duration,
        event: TimerEvent,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        check_interval(id, interval)?;
        self.insert(id, interval, Some(interval), event, callback)
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        let removed = self.table.lock().timers.remove(id).is_some();
        if removed {
            let _ = self.commands.send(Command::Wake);
        }
        Ok(removed)
    }

    fn exists(&self, id: &str) -> bool {
        self.table.lock().timers.contains_key(id)
    }

    fn time_remaining(&self, id: &str) -> Option<Duration> {
        self.table
            .lock()
            .timers
            .get(id)
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    fn name(&self) -> &'static str {
        "thread"
    }
}
