//! Credential sources and non-interactive resolution
//!
//! Resolution never prompts. A source that would need user input (an
//! encrypted key without a passphrase, an agent that is not running) is
//! treated as unavailable and the next source is tried.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKey;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::result::HostSpec;

/// A string that never shows up in `Debug` output
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Secret material supplied directly by the caller or a vault
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Secret {
    /// Password authentication
    Password { password: SecretString },
    /// OpenSSH/PEM private key text
    PrivateKey {
        pem: SecretString,
        #[serde(default)]
        passphrase: Option<SecretString>,
    },
}

/// Where a login credential comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Private key file on disk
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<SecretString>,
    },
    /// Running SSH agent (`SSH_AUTH_SOCK`)
    Agent,
    /// Secret supplied inline
    InlineSecret { secret: Secret },
    /// Secret fetched from the resolver's vault
    VaultLookup { key: String },
    /// Base64-encoded private key in an environment variable
    EnvKey { var: String },
}

impl CredentialSource {
    /// Short description for logs and error reports (never includes secrets)
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            CredentialSource::KeyFile { path, .. } => format!("key file {}", path.display()),
            CredentialSource::Agent => "ssh agent".to_string(),
            CredentialSource::InlineSecret { .. } => "inline secret".to_string(),
            CredentialSource::VaultLookup { key } => format!("vault entry {key}"),
            CredentialSource::EnvKey { var } => format!("environment variable {var}"),
        }
    }
}

/// A credential ready to hand to a transport
#[derive(Clone)]
pub enum Credential {
    /// Decoded private key
    Key(Arc<PrivateKey>),
    /// Authenticate through the SSH agent
    Agent,
    /// Password authentication
    Password(SecretString),
}

impl Credential {
    /// Authentication method name
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Key(_) => "publickey",
            Credential::Agent => "agent",
            Credential::Password(_) => "password",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.method()).finish()
    }
}

/// Secret store consulted for `CredentialSource::VaultLookup`
///
/// Implementations must answer without waiting on user input; a missing
/// entry is `None`.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn lookup(&self, key: &str) -> Option<Secret>;
}

/// In-memory vault, e.g. filled from a config file
#[derive(Debug, Clone, Default)]
pub struct MapVault {
    entries: HashMap<String, Secret>,
}

impl MapVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, secret: Secret) -> Self {
        self.entries.insert(key.into(), secret);
        self
    }
}

#[async_trait]
impl SecretVault for MapVault {
    async fn lookup(&self, key: &str) -> Option<Secret> {
        self.entries.get(key).cloned()
    }
}

/// Why a single source could not produce a credential
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("cannot decode private key: {0}")]
    Decode(String),

    #[error("SSH agent not available (SSH_AUTH_SOCK unset)")]
    AgentUnavailable,

    #[error("no vault configured")]
    NoVault,

    #[error("vault has no entry {0}")]
    VaultMiss(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential resolution errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No source produced a credential
    #[error("no credential available for {host}: {reasons}")]
    AuthUnavailable {
        /// Host label
        host: String,
        /// Per-source failure reasons
        reasons: String,
    },
}

/// Resolves login credentials for hosts without prompting
#[derive(Clone)]
pub struct CredentialResolver {
    defaults: Vec<CredentialSource>,
    vault: Option<Arc<dyn SecretVault>>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("defaults", &self.defaults)
            .field("vault", &self.vault.is_some())
            .finish()
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    /// Resolver using the usual `~/.ssh` identities followed by the agent
    #[must_use]
    pub fn new() -> Self {
        Self {
            defaults: default_sources(),
            vault: None,
        }
    }

    /// Replace the fallback sources used for hosts that list none
    #[must_use]
    pub fn with_defaults(mut self, defaults: Vec<CredentialSource>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Register a vault for `VaultLookup` sources
    #[must_use]
    pub fn with_vault(mut self, vault: Arc<dyn SecretVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Resolve a credential for `host`
    ///
    /// # Errors
    /// Returns `CredentialError::AuthUnavailable` when no source succeeds.
    #[instrument(skip(self, host), fields(host = %host.label()), level = "debug")]
    pub async fn resolve(&self, host: &HostSpec) -> Result<Credential, CredentialError> {
        let sources = if host.credentials.is_empty() {
            &self.defaults
        } else {
            &host.credentials
        };

        let mut reasons = Vec::new();
        for source in sources {
            match self.try_source(source).await {
                Ok(credential) => {
                    debug!(source = %source.describe(), method = credential.method(), "credential resolved");
                    return Ok(credential);
                }
                Err(e) => {
                    debug!(source = %source.describe(), error = %e, "credential source unavailable");
                    reasons.push(format!("{}: {e}", source.describe()));
                }
            }
        }

        let reasons = if reasons.is_empty() {
            "no credential sources configured".to_string()
        } else {
            reasons.join("; ")
        };

        Err(CredentialError::AuthUnavailable {
            host: host.label(),
            reasons,
        })
    }

    async fn try_source(&self, source: &CredentialSource) -> Result<Credential, SourceError> {
        match source {
            CredentialSource::KeyFile { path, passphrase } => {
                if !path.exists() {
                    return Err(SourceError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                let key =
                    russh::keys::load_secret_key(path, passphrase.as_ref().map(SecretString::expose))
                        .map_err(|e| SourceError::Decode(e.to_string()))?;
                Ok(Credential::Key(Arc::new(key)))
            }
            CredentialSource::Agent => {
                if env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty()) {
                    Ok(Credential::Agent)
                } else {
                    Err(SourceError::AgentUnavailable)
                }
            }
            CredentialSource::InlineSecret { secret } => secret_to_credential(secret),
            CredentialSource::VaultLookup { key } => {
                let vault = self.vault.as_ref().ok_or(SourceError::NoVault)?;
                let secret = vault
                    .lookup(key)
                    .await
                    .ok_or_else(|| SourceError::VaultMiss(key.clone()))?;
                secret_to_credential(&secret)
            }
            CredentialSource::EnvKey { var } => {
                let encoded = env::var(var).map_err(|_| SourceError::EnvNotSet(var.clone()))?;
                let decoded = base64_decode(&encoded).map_err(|_| SourceError::InvalidBase64)?;
                let pem = String::from_utf8(decoded).map_err(|_| SourceError::InvalidBase64)?;
                decode_key(&pem, None)
            }
        }
    }
}

/// Standard identity files followed by the agent
#[must_use]
pub fn default_sources() -> Vec<CredentialSource> {
    let mut sources = Vec::new();
    if let Some(home) = dirs::home_dir() {
        for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
            sources.push(CredentialSource::KeyFile {
                path: home.join(".ssh").join(name),
                passphrase: None,
            });
        }
    }
    sources.push(CredentialSource::Agent);
    sources
}

fn secret_to_credential(secret: &Secret) -> Result<Credential, SourceError> {
    match secret {
        Secret::Password { password } => Ok(Credential::Password(password.clone())),
        Secret::PrivateKey { pem, passphrase } => {
            decode_key(pem.expose(), passphrase.as_ref().map(SecretString::expose))
        }
    }
}

fn decode_key(pem: &str, passphrase: Option<&str>) -> Result<Credential, SourceError> {
    let key = russh::keys::decode_secret_key(pem, passphrase)
        .map_err(|e| SourceError::Decode(e.to_string()))?;
    Ok(Credential::Key(Arc::new(key)))
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), SourceError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(SourceError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), SourceError> {
    Ok(())
}
