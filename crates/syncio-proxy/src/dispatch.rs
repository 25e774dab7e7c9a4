//! Commit-triggered dispatcher and remote-commit reconciler
//!
//! Jobs move through staged queues under one mutex:
//!
//!   pending    appended locally, transaction not committed yet
//!   committed  durable locally, awaiting an admission slot (log order)
//!   ready      admitted, waiting for a send slot
//!   inflight   handed to the transport
//!   acked      durably applied by the target, awaiting cancellation
//!
//! Two counters gate the flow: `in_flight` caps concurrent outstanding
//! requests and `in_progress` caps jobs admitted but not yet cancelled.
//! The worker thread drains the queues in passes; all log and transport
//! I/O happens outside the state lock.
//!
//! Cancellation of a durable record happens strictly after the
//! target's acknowledgment. A completion without an acknowledgment
//! frees the send slot but leaves the record durable, so a crash
//! between the two replays the request (the target applies it
//! idempotently).

use crate::job::{JobId, JobState, SyncJob};
use crate::transport::{RequestObserver, SyncRequest, TargetTransport};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use syncio_common::{DispatchConfig, Result};
use syncio_log::{CommitObserver, Cookie, IntentLog, ReplayEntry};
use tracing::{debug, error, info, warn};

/// Queue depths and gate counters, for introspection and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub pending: usize,
    pub committed: usize,
    pub ready: usize,
    pub inflight: usize,
    pub acked: usize,
    pub in_flight: usize,
    pub in_progress: usize,
    pub changes_pending: u64,
}

struct DispatchState {
    /// Keyed by record offset; moved to `committed` by the commit hook
    pending: HashMap<u64, SyncJob>,
    /// Keyed by record offset so admission follows log order
    committed: BTreeMap<u64, SyncJob>,
    /// Keyed by record offset: sends and resends both pick the
    /// earliest record first
    ready: BTreeMap<u64, SyncJob>,
    inflight: HashMap<JobId, SyncJob>,
    acked: VecDeque<SyncJob>,
    /// Outstanding sends (completion pending)
    in_flight: usize,
    /// Admitted jobs whose records are not yet cancelled
    in_progress: usize,
    /// Jobs not yet admitted (pending + committed)
    changes_pending: u64,
    /// Closed while the link is not synchronized
    gate_open: bool,
    shutdown: bool,
}

impl DispatchState {
    fn stats(&self) -> DispatchStats {
        DispatchStats {
            pending: self.pending.len(),
            committed: self.committed.len(),
            ready: self.ready.len(),
            inflight: self.inflight.len(),
            acked: self.acked.len(),
            in_flight: self.in_flight,
            in_progress: self.in_progress,
            changes_pending: self.changes_pending,
        }
    }

    /// True when a `pump` pass would make progress
    fn actionable(&self, config: &DispatchConfig) -> bool {
        if !self.acked.is_empty() {
            return true;
        }
        if !self.gate_open {
            return false;
        }
        (self.in_progress < config.max_in_progress && !self.committed.is_empty())
            || (self.in_flight < config.max_in_flight && !self.ready.is_empty())
    }
}

/// Dispatcher for one target's sync jobs
pub struct Dispatcher {
    state: Mutex<DispatchState>,
    work: Condvar,
    next_job_id: AtomicU64,
    log: Arc<IntentLog>,
    transport: Arc<dyn TargetTransport>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        config: DispatchConfig,
        log: Arc<IntentLog>,
        transport: Arc<dyn TargetTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DispatchState {
                pending: HashMap::new(),
                committed: BTreeMap::new(),
                ready: BTreeMap::new(),
                inflight: HashMap::new(),
                acked: VecDeque::new(),
                in_flight: 0,
                in_progress: 0,
                changes_pending: 0,
                gate_open: false,
                shutdown: false,
            }),
            work: Condvar::new(),
            next_job_id: AtomicU64::new(1),
            log,
            transport,
            config,
        })
    }

    /// Pair a freshly appended (uncommitted) record with its request
    pub(crate) fn enqueue(&self, cookie: Cookie, request: SyncRequest) {
        let id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
        let job = SyncJob::new(id, cookie, request);
        debug!(job = %id, offset = job.cookie_offset(), "queued sync job");
        let mut state = self.state.lock();
        state.changes_pending += 1;
        state.pending.insert(job.cookie_offset(), job);
        // Not dispatchable until its transaction commits; no wakeup.
    }

    /// Seed the committed queue from a startup replay
    pub(crate) fn enqueue_replayed(&self, entries: Vec<ReplayEntry>) {
        let mut state = self.state.lock();
        for entry in entries {
            let Some(request) = SyncRequest::from_record(&entry.record) else {
                warn!(offset = entry.cookie.offset(), "replayed record has no request; skipping");
                continue;
            };
            let id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst));
            let job = SyncJob::new(id, entry.cookie, request);
            debug!(job = %id, offset = job.cookie_offset(), "requeued replayed record");
            state.changes_pending += 1;
            state.committed.insert(job.cookie_offset(), job);
        }
        self.work.notify_all();
    }

    /// Open or close the dispatch gate (closed while the link is not
    /// synchronized)
    pub(crate) fn set_gate(&self, open: bool) {
        let mut state = self.state.lock();
        if state.gate_open != open {
            info!(open, "dispatch gate changed");
        }
        state.gate_open = open;
        if open {
            self.work.notify_all();
        }
    }

    /// Close the gate and requeue every sent-but-unacknowledged job.
    ///
    /// Called when the link drops: completions and acknowledgments for
    /// outstanding requests will never arrive, so the jobs return to
    /// the ready stage and are resent after the next handshake. The
    /// target applies requests idempotently, so a duplicate send of an
    /// already-applied request is harmless.
    pub(crate) fn note_disconnected(&self) {
        let mut state = self.state.lock();
        state.gate_open = false;
        if state.inflight.is_empty() && state.in_flight == 0 {
            return;
        }
        let jobs: Vec<SyncJob> = state.inflight.drain().map(|(_, job)| job).collect();
        let requeued = jobs.len();
        for mut job in jobs {
            if let Err(fault) = job.advance(JobState::Ready) {
                error!(%fault, ?job, "dropping job in illegal state");
                state.in_progress = state.in_progress.saturating_sub(1);
                continue;
            }
            state.ready.insert(job.cookie_offset(), job);
        }
        state.in_flight = 0;
        info!(requeued, "link lost; unacknowledged jobs requeued for resend");
    }

    /// Stop admitting and sending; the worker exits after flushing
    /// outstanding cancellations
    pub(crate) fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.gate_open = false;
        self.work.notify_all();
    }

    /// True once every queue is empty and all counters returned to zero
    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty()
            && state.committed.is_empty()
            && state.ready.is_empty()
            && state.inflight.is_empty()
            && state.acked.is_empty()
            && state.in_flight == 0
            && state.in_progress == 0
            && state.changes_pending == 0
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.state.lock().stats()
    }

    /// Spawn the worker thread draining the queues
    pub(crate) fn spawn_worker(dispatcher: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("dispatch worker started");
            loop {
                let worked = dispatcher.pump();
                let mut state = dispatcher.state.lock();
                if state.shutdown {
                    if state.acked.is_empty() {
                        break;
                    }
                    continue; // flush remaining cancellations
                }
                if !worked && !state.actionable(&dispatcher.config) {
                    dispatcher.work.wait(&mut state);
                }
            }
            info!("dispatch worker stopped");
        })
    }

    /// One full pass over the queues; returns true if anything moved.
    ///
    /// Exposed to tests so queue movement can be driven without the
    /// worker thread.
    pub(crate) fn pump(&self) -> bool {
        let mut did_work = self.cancel_acked();

        // Admission and send selection under one lock acquisition.
        let to_send: Vec<(JobId, SyncRequest)> = {
            let mut state = self.state.lock();
            if !state.gate_open {
                return did_work;
            }

            while state.in_progress < self.config.max_in_progress {
                let Some((&offset, _)) = state.committed.iter().next() else {
                    break;
                };
                let Some(mut job) = state.committed.remove(&offset) else {
                    break;
                };
                if let Err(fault) = job.advance(JobState::Ready) {
                    error!(%fault, ?job, "dropping job in illegal state");
                    continue;
                }
                state.in_progress += 1;
                state.changes_pending = state.changes_pending.saturating_sub(1);
                state.ready.insert(offset, job);
                did_work = true;
            }

            let mut batch = Vec::new();
            while state.in_flight < self.config.max_in_flight {
                let Some((&offset, _)) = state.ready.iter().next() else {
                    break;
                };
                let Some(mut job) = state.ready.remove(&offset) else {
                    break;
                };
                if let Err(fault) = job.advance(JobState::Sent) {
                    error!(%fault, ?job, "dropping job in illegal state");
                    state.in_progress = state.in_progress.saturating_sub(1);
                    continue;
                }
                state.in_flight += 1;
                batch.push((job.id, job.request.clone()));
                state.inflight.insert(job.id, job);
            }
            batch
        };

        for (id, request) in to_send {
            did_work = true;
            debug!(job = %id, "sending sync request");
            if let Err(error) = self.transport.send(id, request) {
                warn!(job = %id, %error, "request could not be queued; requeuing job");
                let mut state = self.state.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
                if let Some(mut job) = state.inflight.remove(&id) {
                    if job.advance(JobState::Ready).is_ok() {
                        state.ready.insert(job.cookie_offset(), job);
                    }
                }
            }
        }
        did_work
    }

    /// Cancel the durable records of acknowledged jobs
    fn cancel_acked(&self) -> bool {
        let batch: Vec<SyncJob> = {
            let mut state = self.state.lock();
            state.acked.drain(..).collect()
        };
        if batch.is_empty() {
            return false;
        }

        let released = batch.len();
        for mut job in batch {
            let id = job.id;
            if let Err(fault) = job.advance(JobState::Cancelled) {
                error!(%fault, job = %id, "dropping job in illegal state");
                continue;
            }
            // Cancellation outside the lock: one fsync per record.
            if let Err(error) = self.log.cancel(job.into_cookie()) {
                warn!(job = %id, %error, "record cancellation failed; it will replay");
            } else {
                debug!(job = %id, "sync job finished; record cancelled");
            }
        }

        let mut state = self.state.lock();
        state.in_progress = state.in_progress.saturating_sub(released);
        drop(state);
        self.work.notify_all();
        true
    }
}

impl CommitObserver for Dispatcher {
    /// Local-commit hook: promote the transaction's jobs to the
    /// committed queue and wake the worker if a slot is free or enough
    /// work piled up
    fn on_commit(&self, txn_id: u64, record_offsets: &[u64]) {
        let mut state = self.state.lock();
        let mut moved = 0usize;
        for offset in record_offsets {
            if let Some(job) = state.pending.remove(offset) {
                state.committed.insert(*offset, job);
                moved += 1;
            }
        }
        if moved == 0 {
            return;
        }
        debug!(txn_id, jobs = moved, "transaction committed; jobs dispatchable");
        if state.in_progress < self.config.max_in_progress
            || state.committed.len() as u64 >= self.config.new_work_threshold
        {
            self.work.notify_all();
        }
    }
}

impl RequestObserver for Dispatcher {
    fn on_complete(&self, job: JobId, result: Result<()>) {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            error!(%job, "completion with no request in flight");
            return;
        }
        state.in_flight -= 1;
        match result {
            Ok(()) => {
                debug!(%job, "request completed; awaiting remote commit");
            }
            Err(error) => {
                warn!(%job, %error, "request failed; requeuing for resend");
                if let Some(mut failed) = state.inflight.remove(&job) {
                    if let Err(fault) = failed.advance(JobState::Ready) {
                        error!(%fault, %job, "dropping job in illegal state");
                    } else {
                        state.ready.insert(failed.cookie_offset(), failed);
                    }
                }
            }
        }
        self.work.notify_all();
    }

    fn on_ack(&self, job: JobId) {
        let mut state = self.state.lock();
        let Some(mut acked) = state.inflight.remove(&job) else {
            debug!(%job, "acknowledgment for unknown job; ignoring");
            return;
        };
        if let Err(fault) = acked.advance(JobState::Acknowledged) {
            error!(%fault, %job, "dropping job in illegal state");
            return;
        }
        state.acked.push_back(acked);
        self.work.notify_all();
    }
}
