//! Transport contract towards the storage target
//!
//! The proxy never talks bytes: the transport collaborator owns the
//! wire protocol, request retries, and timeouts. What the proxy needs
//! from it is narrow — fire a prepared request and hear back through
//! an observer, plus three synchronous control calls used by the
//! background control worker (pre-create, statfs, reconnect
//! handshake).
//!
//! Completion and acknowledgment are distinct events: a completion
//! (success or failure) frees a flow-control slot; the acknowledgment
//! fires only once the target has *durably* applied the request, and
//! it alone licenses cancellation of the matching durable record.
//! Observers may be invoked from any transport thread and must not
//! block.

use crate::job::JobId;
use syncio_common::{CapacitySnapshot, Generation, ObjectAttrs, ObjectGroup, ObjectId, Result};
use syncio_log::IntentRecord;
use std::sync::Arc;

/// A prepared outbound request, paired one-to-one with a durable
/// intent record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// Destroy the object on the target
    Destroy { id: ObjectId, group: ObjectGroup },
    /// Apply ownership attributes on the target
    SetAttr {
        id: ObjectId,
        group: ObjectGroup,
        attrs: ObjectAttrs,
    },
}

impl SyncRequest {
    /// Build the request mirroring an operational intent record
    #[must_use]
    pub fn from_record(record: &IntentRecord) -> Option<Self> {
        match *record {
            IntentRecord::Destroy { id, group } => Some(Self::Destroy { id, group }),
            IntentRecord::SetAttr { id, group, attrs } => Some(Self::SetAttr { id, group, attrs }),
            _ => None,
        }
    }
}

/// Reply to the reconnect handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReply {
    /// True next-usable id after the target purged orphaned
    /// pre-created objects
    pub next_usable: ObjectId,
}

/// Observer of per-request outcomes, registered once on the transport
pub trait RequestObserver: Send + Sync {
    /// The request finished (success or failure). Always fires exactly
    /// once per send and frees a flow-control slot; a failure means
    /// the transport has given up for now and the job will be resent.
    fn on_complete(&self, job: JobId, result: Result<()>);

    /// The target durably applied the request. Fires at most once,
    /// after a successful completion.
    fn on_ack(&self, job: JobId);
}

/// Observer of connection-state transitions, registered once.
///
/// Implementations must be non-blocking; the transport may call them
/// from any thread. A transport that is already connected when the
/// listener is registered must emit `on_connected` immediately.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self);
}

/// Client for one remote storage target
pub trait TargetTransport: Send + Sync + 'static {
    /// Fire a prepared request asynchronously. Outcomes arrive through
    /// the registered [`RequestObserver`]. An error return means the
    /// request could not even be queued.
    fn send(&self, job: JobId, request: SyncRequest) -> Result<()>;

    /// Ask the target to pre-create up to `count` more objects beyond
    /// `last_created`; returns the new highest created id.
    fn precreate(&self, last_created: ObjectId, count: u64) -> Result<ObjectId>;

    /// Query the target's capacity
    fn statfs(&self) -> Result<CapacitySnapshot>;

    /// Reconnect handshake: declare that this connection originates
    /// from the metadata node, have the target purge pre-created but
    /// unused objects above `last_used`, and learn the true
    /// next-usable id.
    fn handshake(&self, generation: Generation, last_used: ObjectId) -> Result<HandshakeReply>;

    /// Register the request observer (called once, before any send)
    fn set_request_observer(&self, observer: Arc<dyn RequestObserver>);

    /// Register the connection listener (called once)
    fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_record() {
        let record = IntentRecord::Destroy {
            id: ObjectId::new(7),
            group: ObjectGroup::new(1),
        };
        assert_eq!(
            SyncRequest::from_record(&record),
            Some(SyncRequest::Destroy {
                id: ObjectId::new(7),
                group: ObjectGroup::new(1),
            })
        );
    }

    #[test]
    fn test_no_request_for_sentinels() {
        let record = IntentRecord::Generation {
            generation: Generation::new(),
        };
        assert_eq!(SyncRequest::from_record(&record), None);
        assert_eq!(SyncRequest::from_record(&IntentRecord::Commit), None);
    }
}
