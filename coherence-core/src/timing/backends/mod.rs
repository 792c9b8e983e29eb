//! Timer backend implementations
//!
//! - `ManualTimerBackend`: fake clock advanced by the caller; deterministic
//! - `ThreadTimerBackend`: real time, one driver thread for all timers
//!
//! ## Choosing a Backend
//!
//! - **Tests and simulations**: Use `ManualTimerBackend`
//! - **Live hosts**: Use `ThreadTimerBackend`

mod manual;
mod thread;

pub use manual::ManualTimerBackend;
pub use thread::ThreadTimerBackend;
