//! Per-host and per-batch result types

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;

use fanout_exec::{CommandOutput, TransportError};

/// Terminal outcome for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    /// The job ran to completion (the exit code may still be non-zero)
    Success(CommandOutput),
    /// Every allowed attempt hit the timeout
    TimedOut,
    /// No credential was available, or the server rejected it
    AuthFailed(String),
    /// A non-retryable transport failure
    TransportError(TransportError),
    /// Retryable failures used up every attempt
    RetriesExhausted(TransportError),
    /// The batch was cancelled before this host finished
    Cancelled,
}

impl HostOutcome {
    /// Short machine-readable name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HostOutcome::Success(_) => "success",
            HostOutcome::TimedOut => "timed_out",
            HostOutcome::AuthFailed(_) => "auth_failed",
            HostOutcome::TransportError(_) => "transport_error",
            HostOutcome::RetriesExhausted(_) => "retries_exhausted",
            HostOutcome::Cancelled => "cancelled",
        }
    }

    /// Whether the transport completed the job
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, HostOutcome::Success(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HostOutcome::Cancelled)
    }

    /// Captured output, if the job ran
    #[must_use]
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            HostOutcome::Success(output) => Some(output),
            _ => None,
        }
    }
}

impl fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOutcome::Success(output) => write!(f, "exit {}", output.exit_code),
            HostOutcome::TimedOut => f.write_str("timed out"),
            HostOutcome::AuthFailed(reason) => write!(f, "authentication failed: {reason}"),
            HostOutcome::TransportError(err) => write!(f, "{err}"),
            HostOutcome::RetriesExhausted(err) => write!(f, "retries exhausted: {err}"),
            HostOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result for one host, written once by its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResult {
    /// Position of the host in the input list
    pub index: usize,
    /// Host label
    pub host: String,
    pub outcome: HostOutcome,
    /// Attempts made (0 if the host never started)
    pub attempts: u32,
    /// Time spent on this host, backoff included
    pub elapsed: Duration,
    /// When the first attempt began
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl HostResult {
    /// Result for a host that never started
    #[must_use]
    pub fn cancelled(index: usize, host: impl Into<String>) -> Self {
        Self {
            index,
            host: host.into(),
            outcome: HostOutcome::Cancelled,
            attempts: 0,
            elapsed: Duration::ZERO,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    /// Job ran and exited 0
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }

    /// Remote exit code, if the job ran
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.output().map(|o| o.exit_code)
    }
}

/// Overall status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    AllSucceeded,
    PartialFailure,
    Cancelled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::AllSucceeded => "all_succeeded",
            BatchStatus::PartialFailure => "partial_failure",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of a batch
#[derive(Debug, Clone, Reply)]
pub struct BatchResult {
    /// One result per host, in input order
    pub results: Vec<HostResult>,
    /// Host indices in the order their results arrived
    pub completion_order: Vec<usize>,
    pub status: BatchStatus,
    /// Time from batch start to snapshot
    pub elapsed: Duration,
}

impl BatchResult {
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result for the host at input position `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&HostResult> {
        self.results.get(index)
    }

    /// Result for the host with this label
    #[must_use]
    pub fn by_host(&self, host: &str) -> Option<&HostResult> {
        self.results.iter().find(|r| r.host == host)
    }

    /// Results whose outcome is not `Success`
    pub fn failures(&self) -> impl Iterator<Item = &HostResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    /// Count results by outcome kind, in a stable order
    #[must_use]
    pub fn summary(&self) -> Vec<(&'static str, usize)> {
        let kinds = [
            "success",
            "timed_out",
            "auth_failed",
            "transport_error",
            "retries_exhausted",
            "cancelled",
        ];
        kinds
            .into_iter()
            .map(|kind| {
                let count = self
                    .results
                    .iter()
                    .filter(|r| r.outcome.kind() == kind)
                    .count();
                (kind, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}
