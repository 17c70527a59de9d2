//! Rendering batch results for the terminal or as JSON

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use fanout_core::{BatchResult, BatchStatus, HostOutcome, HostResult};

/// JSON view of a batch
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub status: String,
    pub elapsed_ms: u64,
    pub hosts: Vec<HostReport>,
    /// Input indices in completion order
    pub completion_order: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct HostReport {
    pub host: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl From<&HostResult> for HostReport {
    fn from(result: &HostResult) -> Self {
        let output = result.outcome.output();
        let error = match &result.outcome {
            HostOutcome::Success(_) => None,
            other => Some(other.to_string()),
        };
        Self {
            host: result.host.clone(),
            outcome: result.outcome.kind(),
            exit_code: result.exit_code(),
            stdout: output.map(|o| o.stdout_lossy()),
            stderr: output.map(|o| o.stderr_lossy()),
            error,
            attempts: result.attempts,
            elapsed_ms: millis(result.elapsed),
            started_at: result.started_at,
            finished_at: result.finished_at,
        }
    }
}

impl From<&BatchResult> for BatchReport {
    fn from(batch: &BatchResult) -> Self {
        Self {
            status: batch.status.to_string(),
            elapsed_ms: millis(batch.elapsed),
            hosts: batch.results.iter().map(HostReport::from).collect(),
            completion_order: batch.completion_order.clone(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Human-readable rendering, one block per host in input order
#[must_use]
pub fn render_text(batch: &BatchResult) -> String {
    let mut out = String::new();
    for result in &batch.results {
        let attempts = match result.attempts {
            1 => "1 attempt".to_string(),
            n => format!("{n} attempts"),
        };
        let _ = writeln!(
            out,
            "[{}] {} ({attempts}, {:.2}s)",
            result.host,
            result.outcome,
            result.elapsed.as_secs_f64()
        );

        if let Some(output) = result.outcome.output() {
            for line in output.stdout_lossy().lines() {
                let _ = writeln!(out, "  {line}");
            }
            for line in output.stderr_lossy().lines() {
                let _ = writeln!(out, "  ! {line}");
            }
        }
    }

    let counts: Vec<String> = batch
        .summary()
        .into_iter()
        .map(|(kind, n)| format!("{n} {kind}"))
        .collect();
    let _ = writeln!(
        out,
        "{}: {} host(s), {} in {:.2}s",
        batch.status,
        batch.len(),
        counts.join(", "),
        batch.elapsed.as_secs_f64()
    );
    out
}

/// Process exit code for a finished batch
///
/// 0 when every host ran the job and exited 0, 130 when cancelled, else 1.
#[must_use]
pub fn exit_code(batch: &BatchResult) -> u8 {
    match batch.status {
        BatchStatus::Cancelled => 130,
        _ if batch.results.iter().all(HostResult::succeeded) => 0,
        _ => 1,
    }
}
