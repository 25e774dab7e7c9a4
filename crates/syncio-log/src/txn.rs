//! Local transaction engine
//!
//! A thin declare/execute/commit engine over the intent log. The
//! metadata node's real transaction machinery is richer; the contract
//! the proxy depends on is narrow: records appended inside a
//! transaction become durable atomically with it, and registered
//! observers hear about each committed batch exactly once, after
//! durability.
//!
//! Observers run on the committing thread and must not block.

use crate::log::IntentLog;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syncio_common::Result;
use tracing::debug;

/// Observer of committed transactions.
///
/// `record_offsets` identifies the operational records appended inside
/// the committed transaction, in append order.
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, txn_id: u64, record_offsets: &[u64]);
}

/// An open local transaction
#[derive(Debug)]
pub struct Txn {
    pub(crate) id: u64,
    /// Declared-but-unused record slots
    pub(crate) declared: u64,
    /// Offsets of operational records appended so far
    pub(crate) cookies: Vec<u64>,
}

impl Txn {
    /// Transaction id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Transaction engine driving the intent log
pub struct TxnEngine {
    log: Arc<IntentLog>,
    next_txn_id: AtomicU64,
    observers: Mutex<Vec<Arc<dyn CommitObserver>>>,
}

impl TxnEngine {
    /// Create an engine over the given log
    #[must_use]
    pub fn new(log: Arc<IntentLog>) -> Self {
        Self {
            log,
            next_txn_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer invoked once per committed transaction
    pub fn register_commit_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.observers.lock().push(observer);
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Txn {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Txn {
            id,
            declared: 0,
            cookies: Vec::new(),
        }
    }

    /// Durably commit `txn` and notify observers
    pub fn commit(&self, txn: Txn) -> Result<u64> {
        self.log.commit_txn(&txn)?;
        debug!(txn_id = txn.id, records = txn.cookies.len(), "committed transaction");

        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_commit(txn.id, &txn.cookies);
        }
        Ok(txn.id)
    }

    /// Abort `txn`; its records are never replayed
    pub fn abort(&self, txn: Txn) -> Result<()> {
        self.log.abort_txn(&txn)?;
        debug!(txn_id = txn.id, "aborted transaction");
        Ok(())
    }
}
