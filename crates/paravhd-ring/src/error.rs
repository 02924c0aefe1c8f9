//! Transport error types

use thiserror::Error;

/// Error type for the ring transport and backend
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the host
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request slot: bad segment count, bad sector range,
    /// short buffer
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A grant reference could not be mapped
    #[error("grant mapping failed: {0}")]
    Grant(String),

    /// Event-channel binding or signalling failed
    #[error("event channel error: {0}")]
    Event(String),

    /// The underlying disk operation failed
    #[error("backend I/O failed: {0}")]
    BackendIo(#[from] paravhd_core::Error),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a grant-mapping error
    pub fn grant(msg: impl Into<String>) -> Self {
        Error::Grant(msg.into())
    }

    /// Create an event-channel error
    pub fn event(msg: impl Into<String>) -> Self {
        Error::Event(msg.into())
    }
}
