//! Minimal `~/.ssh/config` reader
//!
//! Only `Host` blocks and the `HostName`, `User`, `Port` and `IdentityFile`
//! keywords are honoured. `Match` blocks and every other keyword are skipped.
//! As with OpenSSH, the first value found for a keyword wins.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::expand_tilde;

#[derive(Debug, Error)]
pub enum SshConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Settings that apply to one host alias
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHostConfig {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct HostBlock {
    patterns: Vec<String>,
    settings: SshHostConfig,
}

/// Parsed ssh client configuration
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// Parse config text
    ///
    /// # Errors
    /// Returns `SshConfigError::Parse` for a keyword without a value or a bad port.
    pub fn parse(content: &str) -> Result<Self, SshConfigError> {
        // options before the first Host line apply to every host
        let mut blocks = vec![HostBlock {
            patterns: vec!["*".to_string()],
            settings: SshHostConfig::default(),
        }];
        let mut in_match = false;

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (keyword, value) = split_option(trimmed).ok_or_else(|| SshConfigError::Parse {
                line,
                reason: format!("missing value in '{trimmed}'"),
            })?;

            match keyword.to_ascii_lowercase().as_str() {
                "host" => {
                    in_match = false;
                    blocks.push(HostBlock {
                        patterns: value.split_whitespace().map(str::to_string).collect(),
                        settings: SshHostConfig::default(),
                    });
                }
                "match" => {
                    debug!(line, "skipping Match block");
                    in_match = true;
                }
                _ if in_match => {}
                "hostname" => set_once(&mut last(&mut blocks).hostname, unquote(value)),
                "user" => set_once(&mut last(&mut blocks).user, unquote(value)),
                "port" => {
                    let port = unquote(value).parse().map_err(|_| SshConfigError::Parse {
                        line,
                        reason: format!("invalid port '{value}'"),
                    })?;
                    set_once(&mut last(&mut blocks).port, port);
                }
                "identityfile" => last(&mut blocks)
                    .identity_files
                    .push(expand_tilde(Path::new(&unquote(value)))),
                _ => {}
            }
        }

        Ok(Self { blocks })
    }

    /// Read and parse a config file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, SshConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| SshConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// `~/.ssh/config`, or an empty config when there is none
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be loaded
    pub fn load_default() -> Result<Self, SshConfigError> {
        match dirs::home_dir().map(|home| home.join(".ssh").join("config")) {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Merged settings for `alias`; earlier blocks win
    #[must_use]
    pub fn resolve(&self, alias: &str) -> SshHostConfig {
        let mut merged = SshHostConfig::default();
        for block in self.blocks.iter().filter(|b| matches_any(alias, &b.patterns)) {
            let settings = &block.settings;
            if merged.hostname.is_none() {
                merged.hostname.clone_from(&settings.hostname);
            }
            if merged.user.is_none() {
                merged.user.clone_from(&settings.user);
            }
            if merged.port.is_none() {
                merged.port = settings.port;
            }
            merged
                .identity_files
                .extend(settings.identity_files.iter().cloned());
        }

        if let Some(hostname) = &mut merged.hostname {
            *hostname = hostname.replace("%h", alias);
        }
        merged
    }
}

fn last(blocks: &mut [HostBlock]) -> &mut SshHostConfig {
    // never empty: parse seeds the global block
    let index = blocks.len() - 1;
    &mut blocks[index].settings
}

fn set_once<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// `Keyword value` or `Keyword=value`
fn split_option(line: &str) -> Option<(&str, &str)> {
    let end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (keyword, rest) = line.split_at(end);
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .unwrap_or(rest)
        .trim();
    (!value.is_empty()).then_some((keyword, value))
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// A negated pattern that matches rejects the host outright
fn matches_any(host: &str, patterns: &[String]) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) if wildcard_match(host, negated) => return false,
            Some(_) => {}
            None => matched |= wildcard_match(host, pattern),
        }
    }
    matched
}

/// `*` and `?` globbing, case-insensitive
fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();

    // iterative glob with single-star backtracking
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}
