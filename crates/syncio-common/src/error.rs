//! Error types for syncio
//!
//! One error enum covers the whole proxy. Callers mostly care about
//! the classification: retryable conditions are recovered below the
//! pool/dispatcher boundary, terminal conditions must be surfaced to
//! the user operation, and faults poison the one target's proxy while
//! the rest of the system keeps running.

use thiserror::Error;

/// Common result type for syncio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for syncio
#[derive(Debug, Error)]
pub enum Error {
    // Connection / target errors
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("handshake rejected by target: {0}")]
    HandshakeRejected(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    // Durable log errors
    #[error("log I/O error: {0}")]
    LogIo(#[from] std::io::Error),

    #[error("log is full: required {required} bytes, available {available} bytes")]
    LogFull { required: u64, available: u64 },

    #[error("log corruption detected: {0}")]
    LogCorrupt(String),

    #[error("transaction not found: {0}")]
    TxnNotFound(u64),

    #[error("append without a matching declare: {0}")]
    Undeclared(String),

    // Lifecycle errors
    #[error("capacity snapshot not ready")]
    NotReady,

    #[error("shutting down")]
    ShuttingDown,

    // Invariant violations. These poison the one target's proxy but
    // never abort the process.
    #[error("invariant violation: {0}")]
    Fault(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a request failure
    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::RequestFailed(msg.into())
    }

    /// Create a log corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::LogCorrupt(msg.into())
    }

    /// Create an invariant-violation fault
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }

    /// Check if this error is transient and worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost | Self::RequestFailed(_) | Self::Protocol(_) | Self::NotReady
        )
    }

    /// Check if this error is terminal for the target connection.
    ///
    /// Terminal errors cross the proxy boundary: callers must fail the
    /// user operation rather than retry indefinitely.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TargetUnavailable(_) | Self::HandshakeRejected(_) | Self::ShuttingDown
        )
    }

    /// Check if this error is an invariant violation
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}
