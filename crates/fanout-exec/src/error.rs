//! Error types for fanout-exec

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a transport can report for one host
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    /// Could not reach the remote host (refused, unreachable, DNS)
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The server rejected the offered credential
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The server key does not match the known key for this host
    #[error("host key mismatch for {0}")]
    HostKeyMismatch(String),

    /// Deadline exceeded while connecting or running
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// An established connection was dropped
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Protocol-level failure on an established session
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local I/O failure (spawn, file access)
    #[error("I/O error: {0}")]
    Io(String),

    /// The transport panicked while serving this host
    #[error("transport panicked: {0}")]
    Panicked(String),
}

impl TransportError {
    /// Check if error is retryable
    ///
    /// Connection-level failures are transient; identity and protocol failures are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed(_)
                | TransportError::ConnectionReset(_)
                | TransportError::Timeout { .. }
        )
    }

    /// Whether the failure came from the credential being refused
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::AuthRejected(_))
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::UnknownKey => TransportError::HostKeyMismatch(err.to_string()),
            // keepalives went unanswered; the connection is gone
            russh::Error::ConnectionTimeout => TransportError::ConnectionReset(err.to_string()),
            russh::Error::IO(io) => match io.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => {
                    TransportError::ConnectionReset(io.to_string())
                }
                _ => TransportError::ConnectFailed(io.to_string()),
            },
            russh::Error::Disconnect => TransportError::ConnectionReset(err.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}
