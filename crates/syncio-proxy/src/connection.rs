//! Connection state machine
//!
//! Tracks the link to the target through three states: disconnected,
//! negotiating (link up, handshake outstanding) and synchronized.
//! Transport callbacks only flip the state here; the handshake itself
//! runs on the control worker, so a disconnect can race a handshake in
//! flight. `set_synchronized` therefore refuses to promote unless the
//! link is still negotiating, discarding the stale handshake reply.

use parking_lot::Mutex;
use tracing::debug;

/// State of the link to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Link established, reconnect handshake not yet completed
    Negotiating,
    /// Handshake completed; dispatch and id reservation may proceed
    Synchronized,
}

pub(crate) struct ConnectionTracker {
    state: Mutex<LinkState>,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LinkState::Disconnected),
        }
    }

    pub(crate) fn link(&self) -> LinkState {
        *self.state.lock()
    }

    pub(crate) fn note_connected(&self) {
        let mut state = self.state.lock();
        debug!(from = ?*state, "link up; negotiating");
        *state = LinkState::Negotiating;
    }

    pub(crate) fn note_disconnected(&self) {
        let mut state = self.state.lock();
        debug!(from = ?*state, "link down");
        *state = LinkState::Disconnected;
    }

    /// Promote to synchronized; returns false if a disconnect raced the
    /// handshake and the reply must be discarded
    pub(crate) fn set_synchronized(&self) -> bool {
        let mut state = self.state.lock();
        if *state == LinkState::Negotiating {
            *state = LinkState::Synchronized;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_negotiating(&self) -> bool {
        self.link() == LinkState::Negotiating
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.link() == LinkState::Synchronized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_promotes() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.link(), LinkState::Disconnected);

        tracker.note_connected();
        assert!(tracker.is_negotiating());
        assert!(tracker.set_synchronized());
        assert!(tracker.is_synchronized());
    }

    #[test]
    fn test_disconnect_discards_stale_handshake() {
        let tracker = ConnectionTracker::new();
        tracker.note_connected();
        tracker.note_disconnected();
        assert!(!tracker.set_synchronized());
        assert_eq!(tracker.link(), LinkState::Disconnected);
    }

    #[test]
    fn test_reconnect_renegotiates() {
        let tracker = ConnectionTracker::new();
        tracker.note_connected();
        assert!(tracker.set_synchronized());
        tracker.note_disconnected();
        tracker.note_connected();
        assert!(tracker.is_negotiating());
    }
}
