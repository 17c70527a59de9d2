//! Transport and session traits

use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::TransportError;
use crate::result::{CommandOutput, HostSpec};

/// Opens authenticated sessions to remote hosts
///
/// Implementations report every failure as a `TransportError`; they never
/// prompt and never exit the process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate, giving up after `deadline`
    async fn open_session(
        &self,
        host: &HostSpec,
        credential: &Credential,
        deadline: Duration,
    ) -> Result<Box<dyn Session>, TransportError>;

    /// Get transport type name
    fn transport_type(&self) -> &'static str;
}

/// An open session to one host
#[async_trait]
pub trait Session: Send {
    /// Run a shell command and capture its output
    async fn run(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Write `data` to `remote_path`, creating or truncating it
    async fn upload(
        &mut self,
        data: &[u8],
        remote_path: &str,
        mode: Option<u32>,
    ) -> Result<CommandOutput, TransportError>;

    /// Read `remote_path`; the file content is returned as stdout
    async fn download(&mut self, remote_path: &str) -> Result<CommandOutput, TransportError> {
        self.run(&format!("cat -- {}", shell_quote(remote_path))).await
    }

    /// Close the session; errors are logged, not returned
    async fn close(self: Box<Self>);
}

/// Quote `value` for a POSIX shell
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Command that writes stdin to `remote_path`, optionally setting its mode
#[must_use]
pub fn upload_command(remote_path: &str, mode: Option<u32>) -> String {
    let quoted = shell_quote(remote_path);
    match mode {
        Some(mode) => format!("cat > {quoted} && chmod {mode:o} {quoted}"),
        None => format!("cat > {quoted}"),
    }
}
