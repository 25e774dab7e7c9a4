//! Target proxy facade
//!
//! One `TargetProxy` per remote storage target. Starting it stamps a
//! fresh generation marker into the intent log, requeues every durable
//! record left over from the previous incarnation, and spawns two
//! threads: the dispatch worker (queue draining, see [`crate::dispatch`])
//! and the control worker, which owns all synchronous target calls
//! (reconnect handshake, id pre-create, capacity refresh).
//!
//! Metadata operations never touch the network: they reserve an id,
//! append intent records inside the caller's transaction, and return.
//! Synchronization with the target happens behind the caller's back.

use crate::capacity::CapacityMonitor;
use crate::connection::{ConnectionTracker, LinkState};
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::pool::{IdPool, IdTicket, PoolStats};
use crate::signal::WorkSignal;
use crate::transport::{ConnectionListener, TargetTransport};
use crate::SyncRequest;
use parking_lot::Mutex;
use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use syncio_common::{
    CapacitySnapshot, Error, Generation, ObjectAttrs, ObjectGroup, ObjectId, ProxyConfig, Result,
};
use syncio_log::{IntentLog, IntentRecord, Txn, TxnEngine};
use tracing::{error, info, warn};

/// Transport listener wiring link transitions into the proxy parts.
///
/// Callbacks only flip state and raise the control signal; everything
/// slow (the handshake) runs on the control worker.
struct LinkEvents {
    tracker: Arc<ConnectionTracker>,
    pool: IdPool,
    dispatcher: Arc<Dispatcher>,
    signal: Arc<WorkSignal>,
}

impl ConnectionListener for LinkEvents {
    fn on_connected(&self) {
        info!("target link up; handshake pending");
        self.tracker.note_connected();
        self.signal.raise();
    }

    fn on_disconnected(&self) {
        warn!("target link down; suspending dispatch and reservations");
        self.tracker.note_disconnected();
        self.dispatcher.note_disconnected();
        self.pool.mark_disconnected();
        self.signal.raise();
    }
}

/// Control worker state, owned by its thread
struct ControlWorker {
    transport: Arc<dyn TargetTransport>,
    tracker: Arc<ConnectionTracker>,
    pool: IdPool,
    capacity: Arc<CapacityMonitor>,
    dispatcher: Arc<Dispatcher>,
    signal: Arc<WorkSignal>,
    shutdown: Arc<AtomicBool>,
    config: ProxyConfig,
    generation: Generation,
}

impl ControlWorker {
    fn run(self) {
        info!("control worker started");
        let pause = cmp::min(
            self.config.pool.topup_retry_interval,
            self.config.capacity.refresh_interval,
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick();
            self.signal.wait_timeout(pause);
        }
        info!("control worker stopped");
    }

    /// One pass over the control duties; each failure is retried on a
    /// later pass
    fn tick(&self) {
        if self.tracker.is_negotiating() {
            self.negotiate();
        }
        if self.tracker.is_synchronized() {
            if self.pool.needs_topup() {
                self.topup();
            }
            let now = Instant::now();
            if self.capacity.refresh_due(now) {
                self.refresh_capacity(now);
            }
        }
    }

    /// Reconnect handshake: the target purges pre-created objects above
    /// our last used id and reports the true next-usable id
    fn negotiate(&self) {
        let last_used = self.pool.last_used();
        match self.transport.handshake(self.generation, last_used) {
            Ok(reply) => {
                if self.tracker.set_synchronized() {
                    info!(next_usable = %reply.next_usable, "handshake completed");
                    self.pool.resync(reply.next_usable);
                    self.dispatcher.set_gate(true);
                } else {
                    // A disconnect raced the handshake; the reply
                    // describes a dead connection.
                    warn!("discarding handshake reply for a lost link");
                }
            }
            Err(error) if error.is_terminal() => {
                error!(%error, "target rejected the handshake; failing this target");
                self.pool.mark_failed();
                self.tracker.note_disconnected();
            }
            Err(error) => {
                warn!(%error, "handshake failed; retrying");
            }
        }
    }

    fn topup(&self) {
        let last_created = self.pool.last_created();
        match self
            .transport
            .precreate(last_created, self.config.pool.window_step)
        {
            Ok(new_last) => {
                if let Err(fault) = self.pool.refill(new_last) {
                    error!(%fault, "pre-create reply violated the pool window");
                }
            }
            Err(error) => {
                warn!(%error, "pre-create failed; retrying");
            }
        }
    }

    fn refresh_capacity(&self, now: Instant) {
        match self.transport.statfs() {
            Ok(snapshot) => self.capacity.store(snapshot, now),
            Err(error) => {
                warn!(%error, "capacity refresh failed; retrying");
                self.capacity.note_failure();
            }
        }
    }
}

/// Synchronization proxy for one remote storage target
pub struct TargetProxy {
    pool: IdPool,
    capacity: Arc<CapacityMonitor>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<ConnectionTracker>,
    log: Arc<IntentLog>,
    signal: Arc<WorkSignal>,
    shutdown: Arc<AtomicBool>,
    generation: Generation,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    control_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TargetProxy {
    /// Start the proxy over an opened intent log.
    ///
    /// Stamps a fresh generation marker, requeues the previous
    /// incarnation's surviving records, registers on the transport and
    /// spawns the worker threads. Records replayed here are dispatched
    /// as soon as the first handshake completes.
    pub fn start(
        config: ProxyConfig,
        log: Arc<IntentLog>,
        engine: &TxnEngine,
        transport: Arc<dyn TargetTransport>,
    ) -> Result<Arc<Self>> {
        let generation = Generation::new();
        log.append_generation(generation)?;
        let replayed = log.replay(generation)?;
        if !replayed.is_empty() {
            info!(records = replayed.len(), "requeuing records from previous incarnation");
        }

        let signal = Arc::new(WorkSignal::new());
        let pool = IdPool::new(config.pool.clone(), Arc::clone(&signal));
        let capacity = Arc::new(CapacityMonitor::new(config.capacity.clone()));
        let tracker = Arc::new(ConnectionTracker::new());
        let dispatcher = Dispatcher::new(
            config.dispatch.clone(),
            Arc::clone(&log),
            Arc::clone(&transport),
        );
        dispatcher.enqueue_replayed(replayed);

        engine.register_commit_observer(Arc::clone(&dispatcher) as _);
        transport.set_request_observer(Arc::clone(&dispatcher) as _);

        let shutdown = Arc::new(AtomicBool::new(false));
        let dispatch_handle = Dispatcher::spawn_worker(Arc::clone(&dispatcher));
        let control = ControlWorker {
            transport: Arc::clone(&transport),
            tracker: Arc::clone(&tracker),
            pool: pool.clone(),
            capacity: Arc::clone(&capacity),
            dispatcher: Arc::clone(&dispatcher),
            signal: Arc::clone(&signal),
            shutdown: Arc::clone(&shutdown),
            config,
            generation,
        };
        let control_handle = thread::spawn(move || control.run());

        // Registered last: a transport that is already connected emits
        // on_connected inline and the workers are ready for it.
        transport.set_connection_listener(Arc::new(LinkEvents {
            tracker: Arc::clone(&tracker),
            pool: pool.clone(),
            dispatcher: Arc::clone(&dispatcher),
            signal: Arc::clone(&signal),
        }));

        info!(%generation, "target proxy started");
        Ok(Arc::new(Self {
            pool,
            capacity,
            dispatcher,
            tracker,
            log,
            signal,
            shutdown,
            generation,
            dispatch_handle: Mutex::new(Some(dispatch_handle)),
            control_handle: Mutex::new(Some(control_handle)),
        }))
    }

    /// Reserve the exclusive right to one pre-created object id.
    ///
    /// Blocks while the pool is below its low water mark or the link is
    /// not synchronized.
    pub fn reserve(&self) -> Result<IdTicket> {
        self.pool.reserve()
    }

    /// Declare a future destroy record in `txn`.
    ///
    /// After a successful declare the matching append cannot fail for
    /// space reasons.
    pub fn declare_destroy(&self, txn: &mut Txn) -> Result<()> {
        self.log.declare(txn)
    }

    /// Declare a future setattr record in `txn`
    pub fn declare_set_attr(&self, txn: &mut Txn) -> Result<()> {
        self.log.declare(txn)
    }

    /// Record the intent to destroy an object on the target.
    ///
    /// Durable with the caller's transaction; the matching request is
    /// dispatched after local commit.
    pub fn append_destroy(&self, txn: &mut Txn, id: ObjectId, group: ObjectGroup) -> Result<()> {
        let record = IntentRecord::Destroy { id, group };
        let cookie = self.log.append(txn, record)?;
        self.dispatcher
            .enqueue(cookie, SyncRequest::Destroy { id, group });
        Ok(())
    }

    /// Record the intent to apply ownership attributes on the target
    pub fn append_set_attr(
        &self,
        txn: &mut Txn,
        id: ObjectId,
        group: ObjectGroup,
        attrs: ObjectAttrs,
    ) -> Result<()> {
        let record = IntentRecord::SetAttr { id, group, attrs };
        let cookie = self.log.append(txn, record)?;
        self.dispatcher
            .enqueue(cookie, SyncRequest::SetAttr { id, group, attrs });
        Ok(())
    }

    /// Last known capacity of the target; never blocks
    pub fn statfs(&self) -> Result<CapacitySnapshot> {
        self.capacity.snapshot()
    }

    /// Current link state
    #[must_use]
    pub fn link(&self) -> LinkState {
        self.tracker.link()
    }

    /// This incarnation's generation marker
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Stop the workers and verify the queues drained.
    ///
    /// Callers that need a clean shutdown must quiesce their own
    /// mutations first; records still queued or in flight are reported
    /// as a fault and will replay on the next start.
    pub fn stop(&self) -> Result<()> {
        info!("stopping target proxy");
        self.shutdown.store(true, Ordering::Relaxed);
        self.dispatcher.begin_shutdown();
        self.signal.raise();
        self.pool.mark_shutdown();

        for handle in [
            self.dispatch_handle.lock().take(),
            self.control_handle.lock().take(),
        ] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("proxy worker panicked");
                }
            }
        }

        if self.dispatcher.is_drained() {
            info!("target proxy stopped");
            Ok(())
        } else {
            let stats = self.dispatcher.stats();
            error!(?stats, "proxy stopped with records still queued");
            Err(Error::fault(format!(
                "stopped with records still queued: {stats:?}"
            )))
        }
    }
}
