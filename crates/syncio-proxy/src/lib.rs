//! Metadata-node side proxy for remote storage targets.
//!
//! The proxy keeps a metadata node's view of one remote storage target
//! consistent without ever putting a network round trip on the
//! metadata path. Object creation draws from a locally cached window
//! of pre-created ids ([`IdPool`]); destructive mutations are recorded
//! in a durable intent log inside the caller's transaction and shipped
//! to the target in the background ([`Dispatcher`] inside
//! [`TargetProxy`]); a record is erased only after the target durably
//! acknowledged it, so a crash anywhere in between replays the
//! mutation instead of losing it.

pub mod capacity;
pub mod connection;
pub mod dispatch;
pub mod job;
pub mod pool;
pub mod proxy;
pub mod transport;

mod signal;
#[cfg(test)]
mod test_support;

pub use capacity::CapacityMonitor;
pub use connection::LinkState;
pub use dispatch::{DispatchStats, Dispatcher};
pub use job::{JobId, JobState};
pub use pool::{IdPool, IdTicket, PoolStats, PoolStatus};
pub use proxy::TargetProxy;
pub use transport::{
    ConnectionListener, HandshakeReply, RequestObserver, SyncRequest, TargetTransport,
};
