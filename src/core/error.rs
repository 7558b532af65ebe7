use std::io;
use thiserror::Error;

use crate::protocol::message::FileStatus;

/// Custom error types for the Z3K link
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("File transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Framing and payload failures. None of these affect other exchanges on the
/// same transport; the offending datagram is simply discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("telegram payload is empty")]
    EmptyPayload,

    #[error("invalid checksum: expected {expected:02x?}, got {actual:02x?}")]
    InvalidChecksum { expected: [u8; 2], actual: [u8; 2] },

    #[error("no decoder registered for type code 0x{0:02x}")]
    UnknownTypeCode(u8),

    #[error("truncated telegram: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed payload for type code 0x{type_code:02x}: {reason}")]
    MalformedPayload { type_code: u8, reason: String },
}

/// Correlated request failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("no free response address")]
    PoolExhausted,

    #[error("request on address {address} timed out")]
    Timeout { address: u8 },

    #[error("router is no longer running")]
    Closed,
}

/// File transfer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileTransferError {
    #[error("{operation} failed with device status {status}")]
    Device {
        operation: &'static str,
        status: FileStatus,
    },

    #[error("a file read is already in progress")]
    NotReentrant,

    #[error("transport closed before the transfer completed")]
    ChannelClosed,
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new malformed payload error
    pub fn malformed(type_code: u8, reason: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError::MalformedPayload {
            type_code,
            reason: reason.into(),
        })
    }

    /// Returns true if this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Request(RequestError::Timeout { .. }))
    }
}

impl FileTransferError {
    /// Maps a non-OK device status to an error, passing OK through
    pub fn check(operation: &'static str, status: FileStatus) -> std::result::Result<(), Self> {
        if status.is_ok() {
            Ok(())
        } else {
            Err(FileTransferError::Device { operation, status })
        }
    }
}
