//! Shared test fixtures: a scriptable in-memory transport and small
//! polling helpers for thread-based tests.

use crate::job::JobId;
use crate::transport::{
    ConnectionListener, HandshakeReply, RequestObserver, SyncRequest, TargetTransport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use syncio_common::{CapacitySnapshot, Error, Generation, ObjectId, Result};
use syncio_log::Cookie;

/// Build a cookie for a job without a backing log
pub(crate) fn cookie_at(offset: u64) -> Cookie {
    Cookie::new_unchecked(offset)
}

/// Install a subscriber once so failing tests show their traces
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `pred` until it holds or `timeout` elapses
pub(crate) fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

struct MockState {
    observer: Option<Arc<dyn RequestObserver>>,
    listener: Option<Arc<dyn ConnectionListener>>,
    connected: bool,
    sent: Vec<(JobId, SyncRequest)>,
    fail_sends: bool,
    fail_precreate: bool,
    reject_handshake: bool,
    next_usable: ObjectId,
    precreate_calls: u64,
    handshakes: u64,
    capacity: CapacitySnapshot,
}

/// Scriptable transport double.
///
/// Sends are recorded, never executed; tests drive outcomes through
/// [`MockTransport::complete`] and [`MockTransport::ack`] and link
/// transitions through `connect`/`disconnect`. Callbacks are invoked
/// outside the internal lock, like a real transport's reactor thread
/// would.
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                observer: None,
                listener: None,
                connected: false,
                sent: Vec::new(),
                fail_sends: false,
                fail_precreate: false,
                reject_handshake: false,
                next_usable: ObjectId::new(1),
                precreate_calls: 0,
                handshakes: 0,
                capacity: CapacitySnapshot {
                    total_bytes: 1 << 40,
                    free_bytes: 1 << 39,
                    total_objects: 1 << 20,
                    free_objects: 1 << 19,
                },
            }),
        })
    }

    fn observer(&self) -> Option<Arc<dyn RequestObserver>> {
        self.state.lock().observer.clone()
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.state.lock().listener.clone()
    }

    pub(crate) fn connect(&self) {
        self.state.lock().connected = true;
        if let Some(listener) = self.listener() {
            listener.on_connected();
        }
    }

    pub(crate) fn disconnect(&self) {
        self.state.lock().connected = false;
        if let Some(listener) = self.listener() {
            listener.on_disconnected();
        }
    }

    pub(crate) fn complete(&self, job: JobId, result: Result<()>) {
        if let Some(observer) = self.observer() {
            observer.on_complete(job, result);
        }
    }

    pub(crate) fn ack(&self, job: JobId) {
        if let Some(observer) = self.observer() {
            observer.on_ack(job);
        }
    }

    pub(crate) fn sent(&self) -> Vec<(JobId, SyncRequest)> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn precreate_calls(&self) -> u64 {
        self.state.lock().precreate_calls
    }

    #[allow(dead_code)]
    pub(crate) fn handshakes(&self) -> u64 {
        self.state.lock().handshakes
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub(crate) fn set_fail_precreate(&self, fail: bool) {
        self.state.lock().fail_precreate = fail;
    }

    pub(crate) fn set_reject_handshake(&self, reject: bool) {
        self.state.lock().reject_handshake = reject;
    }

    pub(crate) fn set_next_usable(&self, id: ObjectId) {
        self.state.lock().next_usable = id;
    }
}

impl TargetTransport for MockTransport {
    fn send(&self, job: JobId, request: SyncRequest) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(Error::request_failed("mock send refused"));
        }
        state.sent.push((job, request));
        Ok(())
    }

    fn precreate(&self, last_created: ObjectId, count: u64) -> Result<ObjectId> {
        let mut state = self.state.lock();
        state.precreate_calls += 1;
        if state.fail_precreate {
            return Err(Error::request_failed("mock pre-create refused"));
        }
        Ok(ObjectId::new(last_created.raw() + count))
    }

    fn statfs(&self) -> Result<CapacitySnapshot> {
        Ok(self.state.lock().capacity)
    }

    fn handshake(&self, _generation: Generation, _last_used: ObjectId) -> Result<HandshakeReply> {
        let mut state = self.state.lock();
        state.handshakes += 1;
        if state.reject_handshake {
            return Err(Error::HandshakeRejected(
                "mock target rejected the handshake".into(),
            ));
        }
        Ok(HandshakeReply {
            next_usable: state.next_usable,
        })
    }

    fn set_request_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.state.lock().observer = Some(observer);
    }

    fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        let already_connected = {
            let mut state = self.state.lock();
            state.listener = Some(listener.clone());
            state.connected
        };
        if already_connected {
            listener.on_connected();
        }
    }
}
