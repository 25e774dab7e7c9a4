//! Sync jobs
//!
//! A sync job pairs one durable intent record with its prepared
//! outbound request for the whole of its in-memory life. The state
//! machine is strictly linear — queued, ready, sent, acknowledged,
//! cancelled — with a single legal regression: a sent job whose
//! request failed goes back to ready for a resend. Skipping a state is
//! an invariant violation.

use crate::transport::SyncRequest;
use std::fmt;
use syncio_common::{Error, Result};
use syncio_log::Cookie;

/// Identifier of one in-memory sync job (unique per proxy instance)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed; its transaction has not committed locally yet
    Queued,
    /// Locally committed and admitted; waiting for a send slot
    Ready,
    /// Request handed to the transport
    Sent,
    /// Target durably applied the request
    Acknowledged,
    /// Durable record cancelled; terminal
    Cancelled,
}

/// One durable record paired with its in-flight request
pub(crate) struct SyncJob {
    pub(crate) id: JobId,
    cookie: Cookie,
    pub(crate) request: SyncRequest,
    state: JobState,
}

impl SyncJob {
    pub(crate) fn new(id: JobId, cookie: Cookie, request: SyncRequest) -> Self {
        Self {
            id,
            cookie,
            request,
            state: JobState::Queued,
        }
    }

    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    /// Log offset of the paired durable record
    pub(crate) fn cookie_offset(&self) -> u64 {
        self.cookie.offset()
    }

    /// Advance (or, for a failed send, regress) the state machine
    pub(crate) fn advance(&mut self, to: JobState) -> Result<()> {
        use JobState::{Acknowledged, Cancelled, Queued, Ready, Sent};
        let legal = matches!(
            (self.state, to),
            (Queued, Ready) | (Ready, Sent) | (Sent, Ready) | (Sent, Acknowledged)
                | (Acknowledged, Cancelled)
        );
        if !legal {
            return Err(Error::fault(format!(
                "job {} illegal transition {:?} -> {:?}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    /// Tear the job apart for cancellation, yielding the consume-once
    /// cookie
    pub(crate) fn into_cookie(self) -> Cookie {
        self.cookie
    }
}

impl fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncJob")
            .field("id", &self.id)
            .field("offset", &self.cookie.offset())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncio_common::{ObjectGroup, ObjectId};

    fn job() -> SyncJob {
        let request = SyncRequest::Destroy {
            id: ObjectId::new(1),
            group: ObjectGroup::new(0),
        };
        SyncJob::new(JobId(1), crate::test_support::cookie_at(4096), request)
    }

    #[test]
    fn test_full_lifecycle() {
        let mut j = job();
        for state in [
            JobState::Ready,
            JobState::Sent,
            JobState::Acknowledged,
            JobState::Cancelled,
        ] {
            j.advance(state).unwrap();
            assert_eq!(j.state(), state);
        }
    }

    #[test]
    fn test_resend_regression_allowed() {
        let mut j = job();
        j.advance(JobState::Ready).unwrap();
        j.advance(JobState::Sent).unwrap();
        j.advance(JobState::Ready).unwrap();
        j.advance(JobState::Sent).unwrap();
    }

    #[test]
    fn test_state_skip_is_fault() {
        let mut j = job();
        let err = j.advance(JobState::Sent).unwrap_err();
        assert!(err.is_fault());

        let mut j = job();
        j.advance(JobState::Ready).unwrap();
        assert!(j.advance(JobState::Acknowledged).unwrap_err().is_fault());
    }

    #[test]
    fn test_cancel_requires_ack() {
        let mut j = job();
        j.advance(JobState::Ready).unwrap();
        j.advance(JobState::Sent).unwrap();
        assert!(j.advance(JobState::Cancelled).unwrap_err().is_fault());
    }
}
