//! Capacity monitor
//!
//! Caches a statfs-style snapshot of the target with a freshness
//! deadline. Readers never block: they get the last good snapshot, or
//! `NotReady` before the first refresh ever lands. The actual network
//! query is issued by the control worker, which shares its loop with
//! the id pool's top-up; a failed refresh re-arms immediately so the
//! next loop pass retries.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use syncio_common::{CapacityConfig, CapacitySnapshot, Error, Result};
use tracing::debug;

struct CapacityState {
    snapshot: Option<CapacitySnapshot>,
    /// None means a refresh is due now
    fresh_until: Option<Instant>,
}

/// Cached view of the target's capacity
pub struct CapacityMonitor {
    state: Mutex<CapacityState>,
    refresh_interval: Duration,
}

impl CapacityMonitor {
    pub(crate) fn new(config: CapacityConfig) -> Self {
        Self {
            state: Mutex::new(CapacityState {
                snapshot: None,
                fresh_until: None,
            }),
            refresh_interval: config.refresh_interval,
        }
    }

    /// Last good snapshot, or `NotReady` before the first refresh
    pub fn snapshot(&self) -> Result<CapacitySnapshot> {
        self.state.lock().snapshot.ok_or(Error::NotReady)
    }

    /// True when the control worker should issue a refresh
    pub(crate) fn refresh_due(&self, now: Instant) -> bool {
        self.state
            .lock()
            .fresh_until
            .map_or(true, |deadline| now >= deadline)
    }

    /// Record a successful refresh and re-arm the deadline
    pub(crate) fn store(&self, snapshot: CapacitySnapshot, now: Instant) {
        let mut state = self.state.lock();
        state.snapshot = Some(snapshot);
        state.fresh_until = Some(now + self.refresh_interval);
        debug!(
            free_bytes = snapshot.free_bytes,
            free_objects = snapshot.free_objects,
            "capacity snapshot refreshed"
        );
    }

    /// Record a failed refresh; the next loop pass retries
    pub(crate) fn note_failure(&self) {
        self.state.lock().fresh_until = None;
    }
}
