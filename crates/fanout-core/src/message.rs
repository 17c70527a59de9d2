//! Message types for the aggregator actor
//!
//! Handlers live in [`crate::aggregator`].

use crate::state::HostResult;

/// Store the result for one host
#[derive(Debug)]
pub struct Record(pub HostResult);

/// Note that the caller cancelled the batch
#[derive(Debug)]
pub struct MarkCancelled;

/// Produce a `BatchResult`, filling missing hosts as cancelled
#[derive(Debug)]
pub struct Snapshot;
