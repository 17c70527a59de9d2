//! Result and host description types

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialSource;

/// Output captured from one job run on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Remote exit status (0 for success)
    pub exit_code: i32,
    /// Raw stdout bytes
    pub stdout: Vec<u8>,
    /// Raw stderr bytes
    pub stderr: Vec<u8>,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout decoded lossily as UTF-8
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr decoded lossily as UTF-8
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout_lossy();
        if self.stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n{}", self.stderr_lossy())
        }
    }
}

/// One remote host to run a job on
#[derive(Debug, Clone)]
pub struct HostSpec {
    /// Host address (name or IP)
    pub address: String,
    /// Port (default 22)
    pub port: u16,
    /// Login user
    pub username: String,
    /// Credential sources, tried in order; empty means resolver defaults
    pub credentials: Vec<CredentialSource>,
    /// Optional display name used in results and logs
    pub name: Option<String>,
}

impl HostSpec {
    /// Create new host spec on port 22
    pub fn new(address: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: 22,
            username: username.into(),
            credentials: Vec::new(),
            name: None,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Append a credential source
    #[must_use]
    pub fn with_credential(mut self, source: CredentialSource) -> Self {
        self.credentials.push(source);
        self
    }

    /// Set display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Label used in results: the display name, else `user@address:port`
    #[must_use]
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.to_string(),
        }
    }

    /// Whether this host points at the local machine
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}@{}", self.username, self.address)
        } else {
            write!(f, "{}@{}:{}", self.username, self.address, self.port)
        }
    }
}
