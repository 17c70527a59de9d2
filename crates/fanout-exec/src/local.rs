//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::credentials::Credential;
use crate::error::TransportError;
use crate::result::{CommandOutput, HostSpec};
use crate::traits::{Session, Transport, upload_command};

/// Local transport
///
/// Runs jobs on this machine with `sh -c`, ignoring the credential. Used for
/// `localhost` entries and in tests.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create a new local transport
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open_session(
        &self,
        host: &HostSpec,
        _credential: &Credential,
        _deadline: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        debug!(host = %host.label(), "opening local session");
        Ok(Box::new(LocalSession))
    }

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

/// Session backed by local processes
#[derive(Debug)]
pub struct LocalSession;

impl LocalSession {
    #[instrument(skip(self, input), level = "debug")]
    async fn execute(
        &self,
        cmd: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        let start = Instant::now();

        // Use shell to support pipes, redirections, etc.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            match stdin.write_all(data).await {
                Ok(()) => {}
                // the shell quit early; its exit status tells why
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(command = %cmd, "stdin closed before upload finished");
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
            // dropping stdin sends EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let duration = start.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);

        debug!(
            command = %cmd,
            status = exit_code,
            duration = ?duration,
            "command completed"
        );

        if !output.status.success() {
            warn!(command = %cmd, status = exit_code, "command exited non-zero");
        }

        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration,
        })
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.execute(command, None).await
    }

    async fn upload(
        &mut self,
        data: &[u8],
        remote_path: &str,
        mode: Option<u32>,
    ) -> Result<CommandOutput, TransportError> {
        self.execute(&upload_command(remote_path, mode), Some(data)).await
    }

    async fn close(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session() -> Box<dyn Session> {
        LocalTransport::new()
            .open_session(
                &HostSpec::new("localhost", "me"),
                &Credential::Agent,
                Duration::from_secs(1),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_success() {
        let mut session = session().await;
        let result = session.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_lossy().trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let mut session = session().await;
        let result = session.run("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let mut session = session().await;
        let result = session.run("echo error >&2").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stderr_lossy().trim(), "error");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        let path = path.to_str().unwrap();

        let mut session = session().await;
        let written = session
            .upload(b"line one\nline two\n", path, Some(0o600))
            .await
            .unwrap();
        assert!(written.success());

        let read = session.download(path).await.unwrap();
        assert!(read.success());
        assert_eq!(read.stdout, b"line one\nline two\n");

        session.close().await;
    }

    #[tokio::test]
    async fn test_large_upload_to_unwritable_path_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("payload.bin");
        let path = path.to_str().unwrap();

        // larger than any pipe buffer, so the write outlives the shell
        let data = vec![b'x'; 4 * 1024 * 1024];
        let mut session = session().await;
        let result = session.upload(&data, path, None).await.unwrap();

        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }
}
