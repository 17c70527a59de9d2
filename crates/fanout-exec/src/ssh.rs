//! SSH transport using russh crate

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{ChannelMsg, Disconnect, client};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::credentials::Credential;
use crate::error::TransportError;
use crate::result::{CommandOutput, HostSpec};
use crate::traits::{Session, Transport, upload_command};

/// How server host keys are verified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyCheck {
    /// Accept every key (StrictHostKeyChecking=no)
    AcceptAll,
    /// Accept unknown hosts, reject changed keys
    #[default]
    AcceptNew,
    /// Only accept keys already in known_hosts
    Strict,
}

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    check: HostKeyCheck,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(verify_host_key(
            &self.host,
            self.port,
            server_public_key,
            self.check,
            self.known_hosts.as_deref(),
        ))
    }
}

/// Check `key` against known_hosts, recording it when `AcceptNew` meets an unknown host
fn verify_host_key(
    host: &str,
    port: u16,
    key: &ssh_key::PublicKey,
    check: HostKeyCheck,
    known_hosts: Option<&Path>,
) -> bool {
    if check == HostKeyCheck::AcceptAll {
        return true;
    }

    let known = match known_hosts {
        Some(path) => russh::keys::check_known_hosts_path(host, port, key, path),
        None => russh::keys::check_known_hosts(host, port, key),
    };

    match known {
        Ok(true) => true,
        Ok(false) if check == HostKeyCheck::AcceptNew => {
            info!(host = %host, "accepting unknown host key");
            let learned = match known_hosts {
                Some(path) => russh::keys::known_hosts::learn_known_hosts_path(host, port, key, path),
                None => russh::keys::known_hosts::learn_known_hosts(host, port, key),
            };
            if let Err(e) = learned {
                warn!(host = %host, error = %e, "failed to record host key");
            }
            true
        }
        Ok(false) => {
            warn!(host = %host, "host key not in known_hosts (strict mode)");
            false
        }
        Err(e) => {
            warn!(host = %host, error = %e, "host key verification failed");
            false
        }
    }
}

/// SSH transport
///
/// Every `open_session` call makes a fresh connection; sessions are not
/// pooled across attempts.
#[derive(Clone)]
pub struct SshTransport {
    config: Arc<client::Config>,
    host_key_check: HostKeyCheck,
    known_hosts: Option<PathBuf>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("host_key_check", &self.host_key_check)
            .field("known_hosts", &self.known_hosts)
            .finish_non_exhaustive()
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTransport {
    /// Create a transport with default client settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            host_key_check: HostKeyCheck::default(),
            known_hosts: None,
        }
    }

    /// Set host key verification mode
    #[must_use]
    pub fn with_host_key_check(mut self, check: HostKeyCheck) -> Self {
        self.host_key_check = check;
        self
    }

    /// Use a specific known_hosts file instead of `~/.ssh/known_hosts`
    #[must_use]
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Send keepalives on idle connections
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, max_missed: usize) -> Self {
        let config = client::Config {
            keepalive_interval: Some(interval),
            keepalive_max: max_missed,
            ..client::Config::default()
        };
        self.config = Arc::new(config);
        self
    }

    /// Connect and authenticate without a deadline
    #[instrument(skip(self, credential), fields(host = %host.label()))]
    async fn connect(
        &self,
        host: &HostSpec,
        credential: &Credential,
    ) -> Result<client::Handle<SshClientHandler>, TransportError> {
        info!(
            host = %host.address,
            port = host.port,
            user = %host.username,
            method = credential.method(),
            "connecting to SSH"
        );

        let handler = SshClientHandler {
            host: host.address.clone(),
            port: host.port,
            check: self.host_key_check,
            known_hosts: self.known_hosts.clone(),
        };

        let mut session = client::connect(
            self.config.clone(),
            (&host.address[..], host.port),
            handler,
        )
        .await
        .map_err(|e| match TransportError::from(e) {
            TransportError::HostKeyMismatch(_) => TransportError::HostKeyMismatch(host.label()),
            other => other,
        })?;

        authenticate(&mut session, &host.username, credential).await?;

        info!(host = %host.address, "SSH connected and authenticated");

        Ok(session)
    }
}

async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    user: &str,
    credential: &Credential,
) -> Result<(), TransportError> {
    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();

    let accepted = match credential {
        Credential::Key(key) => session
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
            .await?
            .success(),
        Credential::Password(password) => session
            .authenticate_password(user, password.expose())
            .await?
            .success(),
        #[cfg(unix)]
        Credential::Agent => {
            let mut agent = russh::keys::agent::client::AgentClient::connect_env()
                .await
                .map_err(|e| TransportError::AuthRejected(format!("ssh agent: {e}")))?;
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| TransportError::AuthRejected(format!("ssh agent: {e}")))?;

            let mut accepted = false;
            for identity in identities {
                let result = session
                    .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
                    .await;
                if matches!(result, Ok(ref auth) if auth.success()) {
                    accepted = true;
                    break;
                }
            }
            accepted
        }
        #[cfg(not(unix))]
        Credential::Agent => {
            return Err(TransportError::AuthRejected(
                "ssh agent not supported on this platform".to_string(),
            ));
        }
    };

    if accepted {
        Ok(())
    } else {
        Err(TransportError::AuthRejected(format!(
            "{} authentication failed for {user}",
            credential.method()
        )))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_session(
        &self,
        host: &HostSpec,
        credential: &Credential,
        deadline: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        let handle = timeout(deadline, self.connect(host, credential))
            .await
            .map_err(|_| TransportError::Timeout { timeout: deadline })??;

        Ok(Box::new(SshSession {
            label: host.label(),
            handle,
        }))
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

/// An authenticated SSH connection
pub struct SshSession {
    label: String,
    handle: client::Handle<SshClientHandler>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.label)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Run `cmd` on a fresh channel, optionally feeding `input` to stdin
    #[instrument(skip(self, input), fields(host = %self.label))]
    async fn exec(
        &mut self,
        cmd: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, cmd).await?;

        if let Some(data) = input {
            channel.data(data).await?;
            channel.eof().await?;
        }

        let mut exit_code = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                // ext 1 is stderr
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status.cast_signed());
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let duration = start.elapsed();

        let Some(exit_code) = exit_code else {
            return Err(TransportError::ConnectionReset(format!(
                "channel closed without exit status on {}",
                self.label
            )));
        };

        debug!(
            command = %cmd,
            status = exit_code,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration,
        })
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        self.exec(command, None).await
    }

    async fn upload(
        &mut self,
        data: &[u8],
        remote_path: &str,
        mode: Option<u32>,
    ) -> Result<CommandOutput, TransportError> {
        self.exec(&upload_command(remote_path, mode), Some(data)).await
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(host = %self.label, error = %e, "SSH disconnect failed");
        } else {
            debug!(host = %self.label, "SSH disconnected");
        }
    }
}
