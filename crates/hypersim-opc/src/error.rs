//! Error types for the OPC server
use std::time::Duration;
use thiserror::Error;

/// OPC server errors
#[derive(Error, Debug)]
pub enum OpcError {
    /// Malformed header or payload length. Closes the offending connection only.
    #[error("Framing error: {0}")]
    FramingError(String),

    /// Unparseable sysEx body. The command is dropped, the connection continues.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Invalid parameter value
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Standby could not be engaged in time
    #[error("Standby lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// Listening socket could not be set up
    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for OPC operations
pub type Result<T> = std::result::Result<T, OpcError>;
