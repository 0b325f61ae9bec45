//! Error types for remq operations.

use std::io;
use thiserror::Error;

/// The main error type for remq operations.
#[derive(Debug, Error)]
pub enum RemqError {
    /// No connection could be acquired before the acquisition timeout elapsed.
    #[error("connection pool exhausted: no connection available within {0:?}")]
    PoolExhausted(std::time::Duration),

    /// The connection carrying a non-blocking command was lost before its reply.
    #[error("connection lost before a reply was received")]
    ConnectionLost,

    /// The server answered with an error reply.
    #[error("remote error: {0}")]
    Remote(String),

    /// A non-blocking removal found the queue empty.
    #[error("no such element: queue is empty")]
    NoSuchElement,

    /// The operation was canceled by its caller.
    #[error("operation canceled")]
    Canceled,

    /// Connection-related errors (refused, reset, handshake failures).
    #[error("connection error: {0}")]
    Connection(String),

    /// Protocol-related errors (malformed frames, unexpected reply shapes).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connect or response deadline of non-blocking work elapsed.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Arguments rejected before anything was sent.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RemqError {
    /// Returns `true` for failures of the transport rather than of the command.
    ///
    /// Blocking operations absorb these and wait for the connection to come back.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RemqError::ConnectionLost | RemqError::Connection(_) | RemqError::Io(_)
        )
    }
}

/// A specialized `Result` type for remq operations.
pub type Result<T> = std::result::Result<T, RemqError>;
