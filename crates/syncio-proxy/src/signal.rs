//! Edge-triggered wakeup for the control worker
//!
//! Hooks (connection listener, blocked reservers) raise the signal and
//! return; the control worker consumes it and re-checks its
//! predicates. The raised flag persists until consumed, so a raise
//! that lands while the worker is busy is never lost.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// One-bit latching wakeup signal
pub(crate) struct WorkSignal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl WorkSignal {
    pub(crate) fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Raise the signal and wake the worker
    pub(crate) fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.cv.notify_all();
    }

    /// Wait until the signal is raised or `timeout` elapses, consuming
    /// the signal if it was raised
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        let mut raised = self.raised.lock();
        if !*raised {
            self.cv.wait_for(&mut raised, timeout);
        }
        *raised = false;
    }
}
