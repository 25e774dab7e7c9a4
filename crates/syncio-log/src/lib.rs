//! Syncio Log - Durable intent log
//!
//! This crate implements the crash-surviving side of the proxy:
//! - Record framing with CRC protection
//! - The append-only intent log with consume-once cancellation cookies
//! - A local transaction engine with commit observers
//! - Bounded replay across process restarts (generation markers)

pub mod log;
pub mod record;
pub mod txn;

// Re-exports
pub use log::{Cookie, IntentLog, ReplayEntry};
pub use record::{FramedRecord, IntentRecord, RecordKind, MAX_RECORD_SIZE};
pub use txn::{CommitObserver, Txn, TxnEngine};
