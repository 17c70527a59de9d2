//! Transport selection per host

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fanout_exec::{
    Credential, HostSpec, LocalTransport, Session, SshTransport, Transport, TransportError,
};

use crate::config::{Config, TransportKind, expand_tilde};

/// Routes each host to the local or SSH transport
#[derive(Debug, Clone)]
pub struct RoutingTransport {
    kind: TransportKind,
    ssh: SshTransport,
    local: LocalTransport,
}

impl RoutingTransport {
    #[must_use]
    pub fn new(kind: TransportKind, ssh: SshTransport) -> Self {
        Self {
            kind,
            ssh,
            local: LocalTransport::new(),
        }
    }

    /// Transport configured from `[defaults]`
    #[must_use]
    pub fn from_config(config: &Config) -> Arc<Self> {
        let mut ssh = SshTransport::new()
            .with_host_key_check(config.defaults.host_key_check)
            .with_keepalive(Duration::from_secs(15), 3);
        if let Some(path) = &config.defaults.known_hosts {
            ssh = ssh.with_known_hosts(expand_tilde(path));
        }
        Arc::new(Self::new(config.defaults.transport, ssh))
    }

    fn pick(&self, host: &HostSpec) -> &dyn Transport {
        match self.kind {
            TransportKind::Local => &self.local,
            TransportKind::Ssh => &self.ssh,
            // For localhost connections, use the local transport
            TransportKind::Auto if host.is_local() => &self.local,
            TransportKind::Auto => &self.ssh,
        }
    }
}

#[async_trait]
impl Transport for RoutingTransport {
    async fn open_session(
        &self,
        host: &HostSpec,
        credential: &Credential,
        deadline: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        self.pick(host).open_session(host, credential, deadline).await
    }

    fn transport_type(&self) -> &'static str {
        match self.kind {
            TransportKind::Auto => "auto",
            TransportKind::Ssh => "ssh",
            TransportKind::Local => "local",
        }
    }
}
