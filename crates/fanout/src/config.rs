//! Configuration loading and types
//!
//! ```toml
//! [defaults]
//! user = "deploy"
//! key_file = "~/.ssh/fleet_ed25519"
//! host_key_check = "accept-new"
//! use_ssh_config = true
//!
//! [policy]
//! timeout_secs = 60
//! retries = 3
//! concurrency = 32
//!
//! [policy.backoff]
//! strategy = "exponential"
//! base_ms = 500
//!
//! [[host]]
//! address = "db[1-2].internal"
//! user = "postgres"
//! credentials = [{ type = "vault_lookup", key = "db" }]
//!
//! [secrets.db]
//! kind = "password"
//! password = "..."
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use serde::Deserialize;

use fanout_core::{Backoff, BackoffStrategy, ExecutionPolicy, Jitter};
use fanout_exec::{
    CredentialResolver, CredentialSource, HostKeyCheck, HostSpec, MapVault, Secret,
    credentials::default_sources,
};

use crate::hostlist::{self, HostTarget};
use crate::ssh_config::SshConfig;

/// Top-level configuration for the fanout CLI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Named hosts; `address` may use range expressions
    #[serde(default)]
    pub host: Vec<HostEntry>,
    /// Secrets served to `vault_lookup` credential sources
    #[serde(default)]
    pub secrets: HashMap<String, Secret>,
    /// Parsed `~/.ssh/config`, filled by [`Config::load_ssh_config`]
    #[serde(skip)]
    pub ssh: SshConfig,
}

/// Connection defaults applied to every host
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub user: Option<String>,
    pub port: u16,
    /// Use only this key instead of the usual `~/.ssh` identities
    pub key_file: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub host_key_check: HostKeyCheck,
    pub transport: TransportKind,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Resolve aliases through the ssh client config
    pub use_ssh_config: bool,
    /// Client config to read instead of `~/.ssh/config`
    pub ssh_config: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            user: None,
            port: 22,
            key_file: None,
            known_hosts: None,
            host_key_check: HostKeyCheck::default(),
            transport: TransportKind::default(),
            log_level: "warn".to_string(),
            log_format: LogFormat::default(),
            use_ssh_config: true,
            ssh_config: None,
        }
    }
}

/// Which transport serves a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local for localhost addresses, SSH otherwise
    #[default]
    Auto,
    Ssh,
    Local,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[policy]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: Option<u64>,
    pub retries: u32,
    pub concurrency: usize,
    pub deadline_secs: Option<u64>,
    pub backoff: BackoffConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            connect_timeout_secs: Some(30),
            retries: 2,
            concurrency: 16,
            deadline_secs: None,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    None,
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterKind {
    None,
    Full,
    Equal,
}

/// `[policy.backoff]` section
///
/// `base_ms` is the constant delay, the linear step or the exponential base.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub strategy: BackoffKind,
    pub base_ms: u64,
    pub factor: u32,
    pub max_ms: u64,
    pub jitter: JitterKind,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::Exponential,
            base_ms: 1000,
            factor: 2,
            max_ms: 30_000,
            jitter: JitterKind::Equal,
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub fn to_backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.base_ms);
        let max = Duration::from_millis(self.max_ms);
        let strategy = match self.strategy {
            BackoffKind::None => BackoffStrategy::None,
            BackoffKind::Constant => BackoffStrategy::Constant(base),
            BackoffKind::Linear => BackoffStrategy::Linear { step: base, max },
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                base,
                factor: self.factor,
                max,
            },
        };
        let jitter = match self.jitter {
            JitterKind::None => Jitter::None,
            JitterKind::Full => Jitter::Full,
            JitterKind::Equal => Jitter::Equal,
        };
        Backoff { strategy, jitter }
    }
}

impl PolicyConfig {
    #[must_use]
    pub fn to_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            max_retries: self.retries,
            backoff: self.backoff.to_backoff(),
            max_concurrent_hosts: self.concurrency,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }
}

/// One `[[host]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    /// Address or range expression
    pub address: String,
    pub name: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Credential sources tried in order; empty means the defaults
    #[serde(default)]
    pub credentials: Vec<CredentialSource>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        // Check environment variable
        if let Ok(path) = std::env::var("FANOUT_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![
            PathBuf::from("fanout.toml"),
            PathBuf::from("/etc/fanout/fanout.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("fanout/fanout.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // logging is not up yet, so this stays silent
        Ok(Config::default())
    }

    /// Read the ssh client config when `use_ssh_config` is on
    ///
    /// # Errors
    /// Returns error if the ssh config exists but cannot be parsed
    pub fn load_ssh_config(&mut self) -> eyre::Result<()> {
        if !self.defaults.use_ssh_config {
            return Ok(());
        }
        self.ssh = match &self.defaults.ssh_config {
            Some(path) => SshConfig::load(&expand_tilde(path))?,
            None => SshConfig::load_default()?,
        };
        Ok(())
    }

    /// Credential resolver for this configuration
    ///
    /// A configured `key_file` replaces the default identities entirely.
    #[must_use]
    pub fn resolver(&self) -> CredentialResolver {
        let defaults = match &self.defaults.key_file {
            Some(path) => vec![CredentialSource::KeyFile {
                path: expand_tilde(path),
                passphrase: None,
            }],
            None => default_sources(),
        };

        let resolver = CredentialResolver::new().with_defaults(defaults);
        if self.secrets.is_empty() {
            return resolver;
        }

        let vault = self
            .secrets
            .iter()
            .fold(MapVault::new(), |vault, (key, secret)| {
                vault.with_entry(key.clone(), secret.clone())
            });
        resolver.with_vault(Arc::new(vault))
    }

    /// Hosts declared in `[[host]]`, ranges expanded
    ///
    /// # Errors
    /// Returns error for an invalid address expression
    pub fn configured_hosts(&self) -> Result<Vec<HostSpec>, hostlist::HostlistError> {
        let mut hosts = Vec::new();
        for entry in &self.host {
            let addresses = hostlist::expand(&entry.address)?;
            let single = addresses.len() == 1;
            for address in addresses {
                let target = HostTarget::parse(&address)?;
                let mut spec = self.host_spec(&target);
                if let Some(user) = &entry.user {
                    spec.username.clone_from(user);
                }
                if let Some(port) = entry.port.or(target.port) {
                    spec.port = port;
                }
                if !entry.credentials.is_empty() {
                    spec.credentials.clone_from(&entry.credentials);
                }
                // a name only makes sense for a single expanded host
                if let Some(name) = entry.name.as_ref().filter(|_| single) {
                    spec.name = Some(name.clone());
                }
                hosts.push(spec);
            }
        }
        Ok(hosts)
    }

    /// Build a `HostSpec` for `target`, filling gaps from the ssh config and `[defaults]`
    ///
    /// An explicit `user@` or `:port` wins, then the ssh config, then
    /// `[defaults]`. A host that matches a `[[host]]` entry by address or name
    /// picks up that entry's credentials.
    #[must_use]
    pub fn host_spec(&self, target: &HostTarget) -> HostSpec {
        let ssh = self.ssh.resolve(&target.address);

        let user = target
            .user
            .clone()
            .or(ssh.user)
            .or_else(|| self.defaults.user.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        let port = target.port.or(ssh.port).unwrap_or(self.defaults.port);
        let address = ssh.hostname.unwrap_or_else(|| target.address.clone());

        let mut spec = HostSpec::new(address, user).with_port(port);
        if spec.address != target.address {
            // report under the alias that was asked for
            spec.name = Some(target.address.clone());
        }

        let entry_credentials = self
            .host
            .iter()
            .find(|h| h.address == target.address || h.name.as_deref() == Some(&target.address))
            .map(|h| &h.credentials)
            .filter(|c| !c.is_empty());
        if let Some(credentials) = entry_credentials {
            spec.credentials.clone_from(credentials);
        } else if self.defaults.key_file.is_none() && !ssh.identity_files.is_empty() {
            // IdentityFile entries go first, the usual identities still follow
            spec.credentials = ssh
                .identity_files
                .into_iter()
                .map(|path| CredentialSource::KeyFile {
                    path,
                    passphrase: None,
                })
                .chain(default_sources())
                .collect();
        }
        spec
    }
}

/// Replace a leading `~` with the home directory
#[must_use]
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
