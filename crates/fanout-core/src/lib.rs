//! fanout-core: Batch execution engine
//!
//! Runs a job on many hosts with bounded concurrency, per-host timeout and
//! retry, and collects the outcomes through a kameo `AggregatorActor`.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod message;
pub mod pool;
pub mod state;
pub mod task;

pub use aggregator::{AggregatorActor, AggregatorActorArgs, BatchCollector};
pub use config::{Backoff, BackoffStrategy, ExecutionPolicy, Jitter};
pub use error::CoreError;
pub use events::{BroadcastSink, EventSink, ExecEvent, NullSink, TracingSink};
pub use executor::{CancelHandle, Executor, RunningBatch};
pub use job::Job;
pub use message::{MarkCancelled, Record, Snapshot};
pub use pool::ExecutionPool;
pub use state::{BatchResult, BatchStatus, HostOutcome, HostResult};
pub use task::{HostTask, TaskContext};
