//! Host task: one job on one host with timeout and retry
//!
//! Every failure, including a panic inside the transport, ends up in the
//! returned [`HostResult`]; nothing propagates past [`HostTask::run`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fanout_exec::{
    CommandOutput, Credential, CredentialResolver, HostSpec, Transport, TransportError,
};

use crate::config::ExecutionPolicy;
use crate::events::{EventSink, ExecEvent};
use crate::job::Job;
use crate::state::{HostOutcome, HostResult};

/// Shared collaborators for every task in a batch
#[derive(Clone)]
pub struct TaskContext {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<CredentialResolver>,
    pub sink: Arc<dyn EventSink>,
    pub policy: Arc<ExecutionPolicy>,
    pub job: Arc<Job>,
    pub cancel: CancellationToken,
}

/// One host's share of a batch
pub struct HostTask {
    index: usize,
    host: Arc<HostSpec>,
    label: String,
    ctx: TaskContext,
}

/// How a single attempt ended
enum Attempt {
    Done(CommandOutput),
    Failed(TransportError),
    Cancelled,
}

enum Resolved {
    Ready(Credential),
    Unavailable(String),
    Cancelled,
}

impl HostTask {
    #[must_use]
    pub fn new(index: usize, host: Arc<HostSpec>, ctx: TaskContext) -> Self {
        let label = host.label();
        Self {
            index,
            host,
            label,
            ctx,
        }
    }

    /// Position of the host in the batch input
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Drive attempts until success, a terminal error, exhaustion or cancellation
    #[instrument(skip(self), fields(host = %self.label))]
    pub async fn run(self) -> HostResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let policy = self.ctx.policy.clone();
        let max_attempts = policy.max_attempts();

        debug!(job = %self.ctx.job.describe(), max_attempts, "host task starting");

        let mut attempts = 0;
        let outcome = loop {
            if self.ctx.cancel.is_cancelled() {
                break HostOutcome::Cancelled;
            }

            let Some(attempt_timeout) = self.attempt_timeout(start) else {
                // deadline used up before this attempt could start
                break HostOutcome::TimedOut;
            };

            attempts += 1;
            self.ctx.sink.emit(ExecEvent::AttemptStarted {
                host: self.label.clone(),
                attempt: attempts,
            });
            let attempt_start = Instant::now();

            let credential = match self.resolve(attempt_timeout).await {
                Resolved::Ready(credential) => credential,
                Resolved::Unavailable(reason) => {
                    warn!(error = %reason, "no usable credential");
                    self.attempt_finished(attempts, "auth_failed", attempt_start, false);
                    break HostOutcome::AuthFailed(reason);
                }
                Resolved::Cancelled => {
                    self.attempt_finished(attempts, "cancelled", attempt_start, false);
                    break HostOutcome::Cancelled;
                }
            };

            // resolution time counts against the attempt
            let remaining = attempt_timeout.saturating_sub(attempt_start.elapsed());
            let err = match self.attempt(&credential, remaining).await {
                Attempt::Done(output) => {
                    if !output.success() {
                        warn!(status = output.exit_code, "remote job exited non-zero");
                    }
                    self.attempt_finished(attempts, "success", attempt_start, false);
                    break HostOutcome::Success(output);
                }
                Attempt::Cancelled => {
                    self.attempt_finished(attempts, "cancelled", attempt_start, false);
                    break HostOutcome::Cancelled;
                }
                Attempt::Failed(err) => err,
            };

            if !err.is_retryable() {
                let outcome = terminal_outcome(err);
                self.attempt_finished(attempts, outcome.kind(), attempt_start, false);
                break outcome;
            }

            let delay = policy.backoff.delay(attempts);
            let out_of_time = policy
                .deadline
                .is_some_and(|deadline| start.elapsed() + delay >= deadline);
            if attempts >= max_attempts || out_of_time {
                let outcome = exhausted_outcome(err);
                self.attempt_finished(attempts, outcome.kind(), attempt_start, false);
                break outcome;
            }

            self.attempt_finished(attempts, &err.to_string(), attempt_start, true);
            debug!(attempt = attempts, delay = ?delay, "backing off");

            let cancelled = tokio::select! {
                biased;
                () = self.ctx.cancel.cancelled() => true,
                () = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                break HostOutcome::Cancelled;
            }
        };

        let elapsed = start.elapsed();
        info!(outcome = %outcome, attempts, elapsed = ?elapsed, "host task finished");

        HostResult {
            index: self.index,
            host: self.label,
            outcome,
            attempts,
            elapsed,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    /// Per-attempt limit, shortened to what is left of the host deadline
    fn attempt_timeout(&self, start: Instant) -> Option<Duration> {
        let timeout = self.ctx.policy.timeout;
        match self.ctx.policy.deadline {
            None => Some(timeout),
            Some(deadline) => {
                let left = deadline.checked_sub(start.elapsed())?;
                (!left.is_zero()).then(|| timeout.min(left))
            }
        }
    }

    /// Credential lookup, bounded by `timeout` and the cancel token
    async fn resolve(&self, timeout: Duration) -> Resolved {
        let lookup = tokio::time::timeout(timeout, self.ctx.resolver.resolve(&self.host));

        tokio::select! {
            biased;
            () = self.ctx.cancel.cancelled() => Resolved::Cancelled,
            result = lookup => match result {
                Ok(Ok(credential)) => Resolved::Ready(credential),
                Ok(Err(e)) => Resolved::Unavailable(e.to_string()),
                Err(_) => Resolved::Unavailable(format!(
                    "credential resolution timed out after {timeout:?}"
                )),
            },
        }
    }

    /// One connect + run cycle, bounded by `timeout` and the cancel token
    async fn attempt(&self, credential: &Credential, timeout: Duration) -> Attempt {
        let connect_deadline = self
            .ctx
            .policy
            .connect_timeout
            .map_or(timeout, |c| c.min(timeout));

        let work = async {
            let mut session = self
                .ctx
                .transport
                .open_session(&self.host, credential, connect_deadline)
                .await?;
            let result = self.ctx.job.run_on(session.as_mut()).await;
            session.close().await;
            result
        };
        let guarded = AssertUnwindSafe(work).catch_unwind();

        tokio::select! {
            biased;
            () = self.ctx.cancel.cancelled() => Attempt::Cancelled,
            result = tokio::time::timeout(timeout, guarded) => match result {
                Err(_) => Attempt::Failed(TransportError::Timeout { timeout }),
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    warn!(panic = %message, "transport panicked");
                    Attempt::Failed(TransportError::Panicked(message))
                }
                Ok(Ok(Ok(output))) => Attempt::Done(output),
                Ok(Ok(Err(err))) => Attempt::Failed(err),
            },
        }
    }

    fn attempt_finished(&self, attempt: u32, outcome: &str, started: Instant, will_retry: bool) {
        self.ctx.sink.emit(ExecEvent::AttemptFinished {
            host: self.label.clone(),
            attempt,
            outcome: outcome.to_string(),
            elapsed: started.elapsed(),
            will_retry,
        });
    }
}

/// Outcome for an error that must not be retried
fn terminal_outcome(err: TransportError) -> HostOutcome {
    if err.is_auth() {
        HostOutcome::AuthFailed(err.to_string())
    } else {
        HostOutcome::TransportError(err)
    }
}

/// Outcome once a retryable error has used up the attempts
fn exhausted_outcome(err: TransportError) -> HostOutcome {
    match err {
        TransportError::Timeout { .. } => HostOutcome::TimedOut,
        other => HostOutcome::RetriesExhausted(other),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_timeout_is_timed_out() {
        let outcome = exhausted_outcome(TransportError::Timeout {
            timeout: Duration::from_secs(1),
        });
        assert_eq!(outcome, HostOutcome::TimedOut);

        let outcome = exhausted_outcome(TransportError::ConnectFailed("refused".into()));
        assert!(matches!(outcome, HostOutcome::RetriesExhausted(_)));
    }

    #[test]
    fn test_auth_rejection_is_auth_failed() {
        let outcome = terminal_outcome(TransportError::AuthRejected("denied".into()));
        assert!(matches!(outcome, HostOutcome::AuthFailed(_)));

        let outcome = terminal_outcome(TransportError::HostKeyMismatch("web1".into()));
        assert!(matches!(outcome, HostOutcome::TransportError(_)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
