//! Transport layer error types.
//!
//! Transport failures are recoverable: the connection state machine treats
//! them as an unintentional disconnect and reconnects when allowed to.

use thiserror::Error;

/// Errors returned by the write half of a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The transport is closed and cannot carry frames.
    #[error("transport closed")]
    Closed,

    /// The frame could not be handed to the underlying socket.
    #[error("send failed: {0}")]
    Send(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
