//! Object-id pool
//!
//! Keeps a window of pre-created object ids cached locally so that
//! object creation never waits on a network round trip. The window is
//! `next_id..last_created`: everything below `next_id` is used,
//! everything in the window exists on the target and is free to hand
//! out. `reserved` counts tickets handed out but not yet claimed.
//!
//! Invariants: `next_id <= last_created` and
//! `reserved <= last_created - next_id`. A breach poisons this
//! target's pool (status `Failed`) but never aborts the process.
//!
//! `reserve` blocks on a condvar while fewer than `low_water_mark` ids
//! remain usable, poking the control worker to grow the window in the
//! background.

use crate::signal::WorkSignal;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use syncio_common::{Error, ObjectId, PoolConfig, Result};
use tracing::{debug, error, info, warn};

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Waiting for the first handshake; reservations block
    Starting,
    /// Window synchronized with the target
    Ready,
    /// Link down; reservations block until resynchronized
    Disconnected,
    /// Terminal: target unavailable or invariant breached
    Failed,
    /// Terminal: proxy shut down
    ShutDown,
}

/// Counter snapshot for introspection and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub next_id: ObjectId,
    pub last_created: ObjectId,
    pub reserved: u64,
    pub status: PoolStatus,
}

struct PoolState {
    next_id: ObjectId,
    last_created: ObjectId,
    reserved: u64,
    status: PoolStatus,
    /// Bumped by every resync; tickets from an older epoch are void
    epoch: u64,
}

impl PoolState {
    /// Ids usable right now, net of outstanding reservations
    fn available(&self) -> u64 {
        (self.last_created.raw() - self.next_id.raw()).saturating_sub(self.reserved)
    }

    fn check_invariants(&self) -> Result<()> {
        if self.next_id > self.last_created {
            return Err(Error::fault(format!(
                "pool window inverted: next_id {} > last_created {}",
                self.next_id, self.last_created
            )));
        }
        if self.reserved > self.last_created.raw() - self.next_id.raw() {
            return Err(Error::fault(format!(
                "reserved {} exceeds window {}..{}",
                self.reserved, self.next_id, self.last_created
            )));
        }
        Ok(())
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    grown: Condvar,
    topup: Arc<WorkSignal>,
    config: PoolConfig,
}

/// Locally cached pool of pre-created object ids.
///
/// Cheap to clone; all clones share one window.
#[derive(Clone)]
pub struct IdPool {
    inner: Arc<PoolInner>,
}

impl IdPool {
    pub(crate) fn new(config: PoolConfig, topup: Arc<WorkSignal>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    next_id: ObjectId::new(0),
                    last_created: ObjectId::new(0),
                    reserved: 0,
                    status: PoolStatus::Starting,
                    epoch: 0,
                }),
                grown: Condvar::new(),
                topup,
                config,
            }),
        }
    }

    /// Reserve the exclusive right to one object id.
    ///
    /// Blocks while the usable window is below the low water mark,
    /// waking the background top-up; returns a terminal error once the
    /// pool is failed or shut down.
    pub fn reserve(&self) -> Result<IdTicket> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        loop {
            match state.status {
                PoolStatus::Failed => {
                    return Err(Error::TargetUnavailable("id pool failed".into()))
                }
                PoolStatus::ShutDown => return Err(Error::ShuttingDown),
                PoolStatus::Starting | PoolStatus::Ready | PoolStatus::Disconnected => {}
            }

            if state.status == PoolStatus::Ready
                && state.available() >= inner.config.low_water_mark
            {
                state.reserved += 1;
                return Ok(IdTicket {
                    pool: Arc::clone(inner),
                    epoch: state.epoch,
                    claimed: false,
                });
            }

            inner.topup.raise();
            inner.grown.wait(&mut state);
        }
    }

    /// Grow the window after a successful pre-create batch
    pub(crate) fn refill(&self, new_last_created: ObjectId) -> Result<()> {
        let mut state = self.inner.state.lock();
        if new_last_created < state.last_created {
            warn!(
                %new_last_created,
                last_created = %state.last_created,
                "ignoring stale pre-create reply"
            );
            return Ok(());
        }
        state.last_created = new_last_created;
        if let Err(fault) = state.check_invariants() {
            state.status = PoolStatus::Failed;
            self.inner.grown.notify_all();
            return Err(fault);
        }
        debug!(last_created = %new_last_created, "refilled id pool");
        self.inner.grown.notify_all();
        Ok(())
    }

    /// Reset the window from the handshake's next-usable id.
    ///
    /// The target has purged every pre-created object above our last
    /// used id; nothing below `next_usable` may ever be handed out
    /// again, and the window is empty until the next top-up. Tickets
    /// reserved before the reconnect refer to purged objects, so they
    /// are voided: claiming one returns `ConnectionLost` and the
    /// caller reserves again against the corrected window.
    pub(crate) fn resync(&self, next_usable: ObjectId) {
        let mut state = self.inner.state.lock();
        if next_usable < state.next_id {
            // The target must never report an id we already consumed.
            error!(
                %next_usable,
                next_id = %state.next_id,
                "handshake reported an already-used id; poisoning id pool"
            );
            state.status = PoolStatus::Failed;
            self.inner.grown.notify_all();
            return;
        }
        if state.reserved > 0 {
            info!(
                voided = state.reserved,
                "reconnect voids outstanding reservations"
            );
            state.reserved = 0;
        }
        state.epoch += 1;
        state.next_id = next_usable;
        state.last_created = next_usable;
        state.status = PoolStatus::Ready;
        info!(%next_usable, "id pool resynchronized");
        self.inner.grown.notify_all();
        self.inner.topup.raise();
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut state = self.inner.state.lock();
        if state.status == PoolStatus::Ready {
            state.status = PoolStatus::Disconnected;
        }
        self.inner.grown.notify_all();
    }

    pub(crate) fn mark_failed(&self) {
        self.inner.state.lock().status = PoolStatus::Failed;
        self.inner.grown.notify_all();
    }

    pub(crate) fn mark_shutdown(&self) {
        self.inner.state.lock().status = PoolStatus::ShutDown;
        self.inner.grown.notify_all();
    }

    /// True when the control worker should request another batch
    pub(crate) fn needs_topup(&self) -> bool {
        let state = self.inner.state.lock();
        state.status == PoolStatus::Ready
            && state.available() < self.inner.config.low_water_mark
    }

    /// Highest id ever handed out (handshake input)
    pub(crate) fn last_used(&self) -> ObjectId {
        let state = self.inner.state.lock();
        ObjectId::new(state.next_id.raw().saturating_sub(1))
    }

    /// Current top of the pre-created window
    pub(crate) fn last_created(&self) -> ObjectId {
        self.inner.state.lock().last_created
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            next_id: state.next_id,
            last_created: state.last_created,
            reserved: state.reserved,
            status: state.status,
        }
    }
}

impl PoolInner {
    fn claim_id(&self, epoch: u64) -> Result<ObjectId> {
        let mut state = self.state.lock();
        if epoch != state.epoch {
            debug!("ticket predates a reconnect; reservation void");
            return Err(Error::ConnectionLost);
        }
        if state.next_id >= state.last_created || state.reserved == 0 {
            let fault = Error::fault(format!(
                "claim outside window: next_id {} last_created {} reserved {}",
                state.next_id, state.last_created, state.reserved
            ));
            error!(%fault, "poisoning id pool");
            state.status = PoolStatus::Failed;
            self.grown.notify_all();
            return Err(fault);
        }
        let id = state.next_id;
        state.next_id = id.next();
        state.reserved -= 1;
        debug!(%id, "claimed object id");
        Ok(id)
    }

    fn release_reservation(&self, epoch: u64) {
        let mut state = self.state.lock();
        if epoch != state.epoch {
            // Already voided by a resync; nothing to release.
            return;
        }
        if state.reserved == 0 {
            error!("reservation released twice; poisoning id pool");
            state.status = PoolStatus::Failed;
        } else {
            state.reserved -= 1;
        }
        self.grown.notify_all();
    }
}

/// Exclusive right to one object id.
///
/// Claim it inside the transaction that materializes the object;
/// dropping an unclaimed ticket releases the reservation (the
/// pre-created object on the target becomes an orphan and is reclaimed
/// by the next reconnect handshake). A reconnect voids tickets issued
/// before it: claiming one returns the retryable `ConnectionLost`.
pub struct IdTicket {
    pool: Arc<PoolInner>,
    epoch: u64,
    claimed: bool,
}

impl IdTicket {
    /// Consume the ticket for a concrete object id
    pub fn claim(mut self) -> Result<ObjectId> {
        self.claimed = true;
        self.pool.claim_id(self.epoch)
    }
}

impl std::fmt::Debug for IdTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTicket")
            .field("epoch", &self.epoch)
            .field("claimed", &self.claimed)
            .finish()
    }
}

impl Drop for IdTicket {
    fn drop(&mut self) {
        if !self.claimed {
            self.pool.release_reservation(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn ready_pool(next: u64, last: u64) -> IdPool {
        let pool = IdPool::new(PoolConfig::default(), Arc::new(WorkSignal::new()));
        pool.resync(ObjectId::new(next));
        pool.refill(ObjectId::new(last)).unwrap();
        pool
    }

    #[test]
    fn test_reserve_and_claim_sequential() {
        let pool = ready_pool(1, 51);
        let a = pool.reserve().unwrap().claim().unwrap();
        let b = pool.reserve().unwrap().claim().unwrap();
        assert_eq!(a, ObjectId::new(1));
        assert_eq!(b, ObjectId::new(2));
    }

    #[test]
    fn test_window_scenario() {
        // next=1, last=51: forty reserve/claim pairs never block, the
        // forty-second blocks until another top-up.
        let pool = ready_pool(1, 51);
        for _ in 0..41 {
            pool.reserve().unwrap().claim().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.next_id, ObjectId::new(42));

        let blocked = pool.clone();
        let handle = thread::spawn(move || blocked.reserve().unwrap().claim().unwrap());
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished(), "42nd reserve should block");

        pool.refill(ObjectId::new(101)).unwrap();
        assert_eq!(handle.join().unwrap(), ObjectId::new(42));
    }

    #[test]
    fn test_no_double_allocation() {
        let pool = ready_pool(1, 101);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(pool.reserve().unwrap().claim().unwrap());
                }
                ids
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} allocated twice");
            }
        }
        assert_eq!(seen.len(), 80);
    }

    #[test]
    fn test_dropped_ticket_releases_reservation() {
        let pool = ready_pool(1, 51);
        {
            let _ticket = pool.reserve().unwrap();
            assert_eq!(pool.stats().reserved, 1);
        }
        assert_eq!(pool.stats().reserved, 0);
        // The window itself is untouched; the orphan is the target's
        // problem at the next handshake.
        assert_eq!(pool.stats().next_id, ObjectId::new(1));
    }

    #[test]
    fn test_reserve_fails_terminal() {
        let pool = ready_pool(1, 51);
        pool.mark_failed();
        assert!(matches!(
            pool.reserve().unwrap_err(),
            Error::TargetUnavailable(_)
        ));

        let pool = ready_pool(1, 51);
        pool.mark_shutdown();
        assert!(matches!(pool.reserve().unwrap_err(), Error::ShuttingDown));
    }

    #[test]
    fn test_blocked_reserver_unblocked_by_failure() {
        let pool = ready_pool(1, 2); // window of 1, below low water
        let blocked = pool.clone();
        let handle = thread::spawn(move || blocked.reserve());
        thread::sleep(Duration::from_millis(20));
        pool.mark_failed();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_resync_corrects_window() {
        // Local view says next=55 but the target reports 60 after the
        // orphan purge; nothing below 60 may ever be reserved again.
        let pool = ready_pool(1, 101);
        for _ in 0..54 {
            pool.reserve().unwrap().claim().unwrap();
        }
        assert_eq!(pool.stats().next_id, ObjectId::new(55));

        pool.resync(ObjectId::new(60));
        pool.refill(ObjectId::new(110)).unwrap();
        let id = pool.reserve().unwrap().claim().unwrap();
        assert_eq!(id, ObjectId::new(60));
    }

    #[test]
    fn test_ticket_across_resync_is_voided() {
        let pool = ready_pool(1, 101);
        let ticket = pool.reserve().unwrap();

        // Reconnect: the target purged our pre-created window.
        pool.resync(ObjectId::new(60));
        pool.refill(ObjectId::new(110)).unwrap();

        // The pre-reconnect reservation refers to purged objects;
        // claiming it fails retryably and leaves the pool healthy.
        assert!(matches!(ticket.claim().unwrap_err(), Error::ConnectionLost));
        let stats = pool.stats();
        assert_eq!(stats.status, PoolStatus::Ready);
        assert_eq!(stats.reserved, 0);

        // A retried reservation gets the corrected window.
        assert_eq!(pool.reserve().unwrap().claim().unwrap(), ObjectId::new(60));
    }

    #[test]
    fn test_stale_ticket_drop_leaves_new_reservations_intact() {
        let pool = ready_pool(1, 101);
        let stale = pool.reserve().unwrap();
        pool.resync(ObjectId::new(60));
        pool.refill(ObjectId::new(110)).unwrap();

        let fresh = pool.reserve().unwrap();
        assert_eq!(pool.stats().reserved, 1);

        // Dropping the voided ticket must not release the fresh
        // reservation or trip the double-release guard.
        drop(stale);
        let stats = pool.stats();
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.status, PoolStatus::Ready);
        assert_eq!(fresh.claim().unwrap(), ObjectId::new(60));
    }

    #[test]
    fn test_resync_below_used_poisons() {
        let pool = ready_pool(1, 101);
        for _ in 0..10 {
            pool.reserve().unwrap().claim().unwrap();
        }
        pool.resync(ObjectId::new(5));
        assert_eq!(pool.stats().status, PoolStatus::Failed);
    }

    #[test]
    fn test_invariants_hold_under_churn() {
        use rand::Rng;

        let pool = ready_pool(1, 201);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..20 {
                    let ticket = pool.reserve().unwrap();
                    if rng.gen_bool(0.3) {
                        drop(ticket); // abandon some reservations
                    } else {
                        ticket.claim().unwrap();
                    }
                    let stats = pool.stats();
                    assert!(stats.next_id <= stats.last_created);
                    assert!(
                        stats.reserved <= stats.last_created.raw() - stats.next_id.raw()
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_reserve_wakes_topup_signal() {
        let signal = Arc::new(WorkSignal::new());
        let pool = IdPool::new(PoolConfig::default(), Arc::clone(&signal));
        pool.resync(ObjectId::new(1)); // empty window
        signal.wait_timeout(Duration::from_millis(1)); // consume the resync raise

        let blocked = pool.clone();
        let handle = thread::spawn(move || blocked.reserve());

        // The blocked reserver must have raised the top-up signal.
        let start = std::time::Instant::now();
        signal.wait_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));

        pool.refill(ObjectId::new(51)).unwrap();
        assert!(handle.join().unwrap().is_ok());
    }
}
