//! Public entry point: `Executor`
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fanout_core::{ExecutionPolicy, Executor};
//! use fanout_exec::{HostSpec, SshTransport};
//!
//! # async fn demo() -> Result<(), fanout_core::CoreError> {
//! let executor = Executor::new(Arc::new(SshTransport::new()));
//! let hosts = vec![HostSpec::new("web1.example.com", "deploy")];
//! let batch = executor
//!     .execute(hosts, "uptime", &ExecutionPolicy::default())
//!     .await?;
//! println!("{}", batch.status);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fanout_exec::{CredentialResolver, HostSpec, Transport};

use crate::config::ExecutionPolicy;
use crate::error::CoreError;
use crate::events::{EventSink, TracingSink};
use crate::job::Job;
use crate::pool::ExecutionPool;
use crate::state::{BatchResult, HostResult};

/// Runs commands and transfers across many hosts
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    resolver: Arc<CredentialResolver>,
    sink: Arc<dyn EventSink>,
}

impl Executor {
    /// Executor with the default credential sources and a tracing sink
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            resolver: Arc::new(CredentialResolver::new()),
            sink: Arc::new(TracingSink),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: CredentialResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn pool(&self) -> ExecutionPool {
        ExecutionPool::new(
            self.transport.clone(),
            self.resolver.clone(),
            self.sink.clone(),
        )
    }

    /// Run `command` on every host and wait for the batch
    ///
    /// # Errors
    /// Fails only for an invalid policy or an internal aggregator failure;
    /// per-host failures are reported in the result.
    pub async fn execute(
        &self,
        hosts: Vec<HostSpec>,
        command: &str,
        policy: &ExecutionPolicy,
    ) -> Result<BatchResult, CoreError> {
        self.execute_with_cancel(hosts, command, policy, CancellationToken::new())
            .await
    }

    /// [`execute`](Self::execute) with a caller-owned cancellation token
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute).
    pub async fn execute_with_cancel(
        &self,
        hosts: Vec<HostSpec>,
        command: &str,
        policy: &ExecutionPolicy,
        cancel: CancellationToken,
    ) -> Result<BatchResult, CoreError> {
        self.pool()
            .run(hosts, Job::command(command), policy.clone(), cancel)
            .await
    }

    /// Start a batch in the background
    ///
    /// The policy is validated before anything is spawned.
    ///
    /// # Errors
    /// `InvalidPolicy` if the policy cannot be executed.
    pub fn start(
        &self,
        hosts: Vec<HostSpec>,
        job: Job,
        policy: &ExecutionPolicy,
    ) -> Result<RunningBatch, CoreError> {
        policy.validate()?;

        let cancel = CancellationToken::new();
        let pool = self.pool();
        let policy = policy.clone();
        let token = cancel.clone();
        debug!(hosts = hosts.len(), job = %job.describe(), "starting background batch");
        let handle =
            tokio::spawn(async move { pool.run_validated(hosts, job, policy, token).await });

        Ok(RunningBatch { handle, cancel })
    }

    /// Copy a local file to one host
    ///
    /// # Errors
    /// `LocalIo` if the local file cannot be read, or a policy error.
    pub async fn put_file(
        &self,
        host: HostSpec,
        local: &Path,
        remote: &str,
        mode: Option<u32>,
        policy: &ExecutionPolicy,
    ) -> Result<HostResult, CoreError> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| local_io(local, &e))?;
        info!(host = %host, local = %local.display(), remote, bytes = data.len(), "uploading file");

        let job = Job::Upload {
            data,
            remote_path: remote.to_string(),
            mode,
        };
        self.single(host, job, policy).await
    }

    /// Copy a file from one host to a local path
    ///
    /// The local file is written only when the remote read exits 0.
    ///
    /// # Errors
    /// `LocalIo` if the local file cannot be written, or a policy error.
    pub async fn get_file(
        &self,
        host: HostSpec,
        remote: &str,
        local: &Path,
        policy: &ExecutionPolicy,
    ) -> Result<HostResult, CoreError> {
        info!(host = %host, remote, local = %local.display(), "downloading file");
        let job = Job::Download {
            remote_path: remote.to_string(),
        };
        let result = self.single(host, job, policy).await?;

        if let Some(output) = result.outcome.output().filter(|o| o.success()) {
            tokio::fs::write(local, &output.stdout)
                .await
                .map_err(|e| local_io(local, &e))?;
            debug!(bytes = output.stdout.len(), "download written");
        }

        Ok(result)
    }

    async fn single(
        &self,
        host: HostSpec,
        job: Job,
        policy: &ExecutionPolicy,
    ) -> Result<HostResult, CoreError> {
        let batch = self
            .pool()
            .run(vec![host], job, policy.clone(), CancellationToken::new())
            .await?;
        batch
            .results
            .into_iter()
            .next()
            .ok_or(CoreError::UnknownHost(0))
    }
}

fn local_io(path: &Path, err: &std::io::Error) -> CoreError {
    CoreError::LocalIo {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Cancels a running batch; cheap to clone
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Stop starting queued hosts and cancel in-flight ones
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A batch running in the background
#[derive(Debug)]
pub struct RunningBatch {
    handle: JoinHandle<Result<BatchResult, CoreError>>,
    cancel: CancellationToken,
}

impl RunningBatch {
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the batch to finish, cancelled or not
    ///
    /// # Errors
    /// `BatchTask` if the background task died, or the batch's own error.
    pub async fn wait(self) -> Result<BatchResult, CoreError> {
        self.handle
            .await
            .map_err(|e| CoreError::BatchTask(e.to_string()))?
    }
}
