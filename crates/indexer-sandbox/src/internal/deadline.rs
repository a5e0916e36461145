use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Wall-clock budget of the command the engine is currently running.
///
/// The engine's interrupt handler polls [`Deadline::expired`]; native helpers
/// that block (host services, child processes) consult
/// [`Deadline::remaining`] so they cannot outlive the call either.
#[derive(Debug, Default)]
pub struct Deadline {
    at: Mutex<Option<Instant>>,
}

/// Keeps a deadline armed until dropped.
pub struct ArmedDeadline {
    deadline: Arc<Deadline>,
}

impl Deadline {
    /// Returns `None` without arming when `at` has already passed.
    pub fn arm(self: &Arc<Self>, at: Instant) -> Option<ArmedDeadline> {
        if Instant::now() >= at {
            return None;
        }
        *self.at.lock() = Some(at);
        Some(ArmedDeadline {
            deadline: Arc::clone(self),
        })
    }

    pub fn expired(&self) -> bool {
        self.at.lock().is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the armed deadline, `None` when nothing is armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .lock()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for ArmedDeadline {
    fn drop(&mut self) {
        *self.deadline.at.lock() = None;
    }
}
