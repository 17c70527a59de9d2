//! Core error types for fanout-core
//!
//! Per-host failures never show up here; they are reported as
//! [`HostOutcome`](crate::state::HostOutcome) values inside a batch result.

use thiserror::Error;

/// Errors that fail a whole call
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Policy cannot be executed (zero concurrency, zero timeout, ...)
    #[error("invalid execution policy: {0}")]
    InvalidPolicy(String),

    /// A second result arrived for the same host
    #[error("duplicate result for host #{index} ({host})")]
    DuplicateResult {
        /// Input position of the host
        index: usize,
        /// Host label
        host: String,
    },

    /// A result referenced a host outside the batch
    #[error("result for unknown host #{0}")]
    UnknownHost(usize),

    /// Aggregator actor communication error
    #[error("aggregator error: {0}")]
    Aggregator(String),

    /// The batch driver task died
    #[error("batch task failed: {0}")]
    BatchTask(String),

    /// Local file access for a transfer failed
    #[error("local I/O error on {path}: {reason}")]
    LocalIo {
        /// Local path involved
        path: String,
        /// Underlying error
        reason: String,
    },
}
