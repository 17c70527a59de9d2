//! Progress events and observability sinks

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Progress event emitted while a batch runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    /// A host task began; `active` counts it
    HostStarted { host: String, active: usize },
    AttemptStarted { host: String, attempt: u32 },
    AttemptFinished {
        host: String,
        attempt: u32,
        outcome: String,
        elapsed: Duration,
        will_retry: bool,
    },
    /// A host task ended; `active` no longer counts it
    HostFinished {
        host: String,
        outcome: String,
        attempts: u32,
        elapsed: Duration,
        active: usize,
    },
}

/// Receives progress events
///
/// `emit` is called inline from host tasks: it must return quickly and must
/// not panic.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecEvent);
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ExecEvent) {}
}

/// Logs events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ExecEvent) {
        match event {
            ExecEvent::HostStarted { host, active } => {
                debug!(host = %host, active, "host started");
            }
            ExecEvent::AttemptStarted { host, attempt } => {
                debug!(host = %host, attempt, "attempt started");
            }
            ExecEvent::AttemptFinished {
                host,
                attempt,
                outcome,
                elapsed,
                will_retry,
            } => {
                if will_retry {
                    warn!(host = %host, attempt, outcome = %outcome, elapsed = ?elapsed, "attempt failed, retrying");
                } else {
                    debug!(host = %host, attempt, outcome = %outcome, elapsed = ?elapsed, "attempt finished");
                }
            }
            ExecEvent::HostFinished {
                host,
                outcome,
                attempts,
                elapsed,
                active,
            } => {
                info!(host = %host, outcome = %outcome, attempts, elapsed = ?elapsed, active, "host finished");
            }
        }
    }
}

/// Publishes events on a broadcast channel
///
/// Send errors (no subscribers, lagging receivers) are ignored.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ExecEvent>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get a receiver for subsequent events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: ExecEvent) {
        let _ = self.tx.send(event);
    }
}
