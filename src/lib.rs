//! dynein: a process supervisor.
//!
//! The [`supervisor::Supervisor`] owns a table of [`subprocess::Subprocess`]
//! records grouped by [`registry::ProcessGroup`], and drives them from a
//! single-threaded loop built on a readiness [`poller`]. Lifecycle changes are
//! published as [`events`] to event listener pools, and long-running control
//! operations are expressed as [`deferred`] calls.
pub mod buffd;
pub mod bus;
pub mod conf;
pub mod control;
pub mod deferred;
pub mod error;
pub mod events;
pub mod exec;
pub mod listener;
pub mod logging;
pub mod output;
pub mod poller;
pub mod registry;
pub mod signals;
pub mod states;
pub mod subprocess;
pub mod supervisor;
pub mod utils;

pub use supervisor::{Exit, Options, Supervisor};

/// Tests that fork must not overlap: reaping collects any child of the
/// test process.
#[cfg(test)]
pub(crate) fn fork_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
