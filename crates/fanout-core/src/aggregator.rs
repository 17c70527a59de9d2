//! `AggregatorActor`: collects host results for one batch
//!
//! The actor mailbox serializes every `Record`, so host tasks never share a
//! lock. Bookkeeping lives in [`BatchCollector`], which the actor wraps.

use std::time::Instant;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::message::{MarkCancelled, Record, Snapshot};
use crate::state::{BatchResult, BatchStatus, HostResult};

/// Result bookkeeping for one batch
#[derive(Debug)]
pub struct BatchCollector {
    labels: Vec<String>,
    results: Vec<Option<HostResult>>,
    completion_order: Vec<usize>,
    cancelled: bool,
    started: Instant,
}

impl BatchCollector {
    /// Collector expecting one result per label, in input order
    #[must_use]
    pub fn new(labels: Vec<String>) -> Self {
        let results = vec![None; labels.len()];
        Self {
            labels,
            results,
            completion_order: Vec::new(),
            cancelled: false,
            started: Instant::now(),
        }
    }

    /// Store a result
    ///
    /// # Errors
    /// Rejects indices outside the batch and a second result for a host.
    pub fn record(&mut self, result: HostResult) -> Result<(), CoreError> {
        let index = result.index;
        let slot = self
            .results
            .get_mut(index)
            .ok_or(CoreError::UnknownHost(index))?;

        if slot.is_some() {
            return Err(CoreError::DuplicateResult {
                index,
                host: result.host,
            });
        }

        *slot = Some(result);
        self.completion_order.push(index);
        Ok(())
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Number of hosts with a result
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completion_order.len()
    }

    /// Immutable view of the batch so far
    #[must_use]
    pub fn snapshot(&self) -> BatchResult {
        let results: Vec<HostResult> = self
            .results
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.clone()
                    .unwrap_or_else(|| HostResult::cancelled(index, self.labels[index].clone()))
            })
            .collect();

        let any_cancelled = results.iter().any(|r| r.outcome.is_cancelled());
        let status = if self.cancelled && any_cancelled {
            BatchStatus::Cancelled
        } else if results.iter().all(|r| r.outcome.is_success()) {
            BatchStatus::AllSucceeded
        } else {
            BatchStatus::PartialFailure
        };

        BatchResult {
            results,
            completion_order: self.completion_order.clone(),
            status,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Arguments for spawning an `AggregatorActor`
pub struct AggregatorActorArgs {
    /// Host labels in input order
    pub labels: Vec<String>,
}

/// Actor owning the collector for one batch
pub struct AggregatorActor {
    collector: BatchCollector,
}

impl Actor for AggregatorActor {
    type Args = AggregatorActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        debug!(id = %actor_ref.id(), hosts = args.labels.len(), "AggregatorActor starting");

        Ok(Self {
            collector: BatchCollector::new(args.labels),
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        debug!(
            reason = ?reason,
            completed = self.collector.completed(),
            "AggregatorActor stopping"
        );
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Record> for AggregatorActor {
    type Reply = Result<(), CoreError>;

    async fn handle(&mut self, msg: Record, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let host = msg.0.host.clone();
        let outcome = msg.0.outcome.kind();

        match self.collector.record(msg.0) {
            Ok(()) => {
                debug!(host = %host, outcome, completed = self.collector.completed(), "result recorded");
                Ok(())
            }
            Err(e) => {
                warn!(host = %host, error = %e, "result rejected");
                Err(e)
            }
        }
    }
}

impl Message<MarkCancelled> for AggregatorActor {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: MarkCancelled,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        info!(completed = self.collector.completed(), "batch cancelled");
        self.collector.mark_cancelled();
    }
}

impl Message<Snapshot> for AggregatorActor {
    type Reply = BatchResult;

    async fn handle(
        &mut self,
        _msg: Snapshot,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.collector.snapshot()
    }
}
