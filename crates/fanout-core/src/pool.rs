//! Bounded execution pool
//!
//! Runs one [`HostTask`] per host on its own tokio task, keeping at most
//! `max_concurrent_hosts` in flight, and streams results into an
//! [`AggregatorActor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use kameo::actor::{ActorRef, Spawn};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use fanout_exec::{CredentialResolver, HostSpec, Transport, TransportError};

use crate::aggregator::{AggregatorActor, AggregatorActorArgs};
use crate::config::ExecutionPolicy;
use crate::error::CoreError;
use crate::events::{EventSink, ExecEvent};
use crate::job::Job;
use crate::message::{MarkCancelled, Record, Snapshot};
use crate::state::{BatchResult, HostOutcome, HostResult};
use crate::task::{HostTask, TaskContext, panic_message};

/// Runs batches against one transport
#[derive(Clone)]
pub struct ExecutionPool {
    transport: Arc<dyn Transport>,
    resolver: Arc<CredentialResolver>,
    sink: Arc<dyn EventSink>,
}

impl ExecutionPool {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<CredentialResolver>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            transport,
            resolver,
            sink,
        }
    }

    /// Run `job` on every host and collect one result per host
    ///
    /// # Errors
    /// `InvalidPolicy` before any host is contacted; `Aggregator` if the
    /// result actor fails.
    pub async fn run(
        &self,
        hosts: Vec<HostSpec>,
        job: Job,
        policy: ExecutionPolicy,
        cancel: CancellationToken,
    ) -> Result<BatchResult, CoreError> {
        policy.validate()?;
        self.run_validated(hosts, job, policy, cancel).await
    }

    /// Same as [`run`](Self::run) for a policy that already passed validation
    #[instrument(skip_all, fields(hosts = hosts.len(), job = %job.describe()))]
    pub(crate) async fn run_validated(
        &self,
        hosts: Vec<HostSpec>,
        job: Job,
        policy: ExecutionPolicy,
        cancel: CancellationToken,
    ) -> Result<BatchResult, CoreError> {
        let labels = hosts.iter().map(HostSpec::label).collect();
        let aggregator = AggregatorActor::spawn(AggregatorActorArgs { labels });

        let result = self.drive(hosts, job, policy, &cancel, &aggregator).await;
        let batch = match result {
            Ok(()) => aggregator
                .ask(Snapshot)
                .await
                .map_err(|e| CoreError::Aggregator(e.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = aggregator.stop_gracefully().await {
            warn!(error = %e, "failed to stop aggregator");
        }

        let batch = batch?;
        info!(
            status = %batch.status,
            summary = ?batch.summary(),
            elapsed = ?batch.elapsed,
            "batch finished"
        );
        Ok(batch)
    }

    async fn drive(
        &self,
        hosts: Vec<HostSpec>,
        job: Job,
        policy: ExecutionPolicy,
        cancel: &CancellationToken,
        aggregator: &ActorRef<AggregatorActor>,
    ) -> Result<(), CoreError> {
        let limit = policy.max_concurrent_hosts;
        let started = Instant::now();
        info!(total = hosts.len(), concurrency = limit, "batch starting");

        let ctx = TaskContext {
            transport: self.transport.clone(),
            resolver: self.resolver.clone(),
            sink: self.sink.clone(),
            policy: Arc::new(policy),
            job: Arc::new(job),
            cancel: cancel.clone(),
        };
        let active = Arc::new(AtomicUsize::new(0));
        let mut queue = hosts.into_iter().map(Arc::new).enumerate();
        let mut running = FuturesUnordered::new();

        loop {
            // Queued hosts are never started once cancelled; the snapshot
            // reports them as cancelled.
            while running.len() < limit && !cancel.is_cancelled() {
                let Some((index, host)) = queue.next() else {
                    break;
                };
                let task = HostTask::new(index, host, ctx.clone());
                running.push(spawn_host(task, self.sink.clone(), active.clone()));
            }

            let Some(result) = running.next().await else {
                break;
            };
            aggregator
                .ask(Record(result))
                .await
                .map_err(|e| CoreError::Aggregator(e.to_string()))?;
        }

        if cancel.is_cancelled() {
            info!(elapsed = ?started.elapsed(), "batch cancelled, queued hosts skipped");
            aggregator
                .ask(MarkCancelled)
                .await
                .map_err(|e| CoreError::Aggregator(e.to_string()))?;
        }

        Ok(())
    }
}

/// Start `task` on its own tokio task
///
/// The returned future resolves to the task's result, or to a
/// `TransportError` result if the task panicked.
fn spawn_host(
    task: HostTask,
    sink: Arc<dyn EventSink>,
    active: Arc<AtomicUsize>,
) -> impl Future<Output = HostResult> {
    let index = task.index();
    let label = task.label().to_string();
    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
    sink.emit(ExecEvent::HostStarted {
        host: label.clone(),
        active: now_active,
    });

    let started = Instant::now();
    let handle = tokio::spawn(task.run());

    async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => join_failure(index, label, started, e),
        };

        let now_active = active.fetch_sub(1, Ordering::SeqCst) - 1;
        sink.emit(ExecEvent::HostFinished {
            host: result.host.clone(),
            outcome: result.outcome.kind().to_string(),
            attempts: result.attempts,
            elapsed: result.elapsed,
            active: now_active,
        });
        result
    }
}

fn join_failure(index: usize, host: String, started: Instant, err: JoinError) -> HostResult {
    let outcome = if err.is_panic() {
        let message = panic_message(err.into_panic().as_ref());
        error!(host = %host, panic = %message, "host task panicked");
        HostOutcome::TransportError(TransportError::Panicked(message))
    } else {
        warn!(host = %host, "host task aborted");
        HostOutcome::Cancelled
    };

    HostResult {
        index,
        host,
        outcome,
        attempts: 1,
        elapsed: started.elapsed(),
        started_at: None,
        finished_at: Utc::now(),
    }
}
