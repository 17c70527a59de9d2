//! Work performed on each host once a session is open

use fanout_exec::{CommandOutput, Session, TransportError};

/// What a host task does with its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Run a shell command
    Command(String),
    /// Write `data` to `remote_path`
    Upload {
        data: Vec<u8>,
        remote_path: String,
        mode: Option<u32>,
    },
    /// Read `remote_path`; content comes back as stdout
    Download { remote_path: String },
}

impl Job {
    pub fn command(command: impl Into<String>) -> Self {
        Job::Command(command.into())
    }

    /// Short description for logs
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Job::Command(cmd) => format!("run '{cmd}'"),
            Job::Upload {
                data, remote_path, ..
            } => format!("upload {} bytes to {remote_path}", data.len()),
            Job::Download { remote_path } => format!("download {remote_path}"),
        }
    }

    pub(crate) async fn run_on(
        &self,
        session: &mut dyn Session,
    ) -> Result<CommandOutput, TransportError> {
        match self {
            Job::Command(cmd) => session.run(cmd).await,
            Job::Upload {
                data,
                remote_path,
                mode,
            } => session.upload(data, remote_path, *mode).await,
            Job::Download { remote_path } => session.download(remote_path).await,
        }
    }
}
