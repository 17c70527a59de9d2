//! Host list generation
//!
//! Turns `-H` arguments and hosts files into host targets. Supports comma
//! lists and numeric ranges inside brackets:
//!
//! ```text
//! web[01-03].example.com      -> web01, web02, web03
//! db[1,4-5]                   -> db1, db4, db5
//! deploy@app[1-2]:2222        -> deploy@app1:2222, deploy@app2:2222
//! ```

use std::path::Path;

use thiserror::Error;

/// Upper bound on hosts produced by one expression
const MAX_EXPANSION: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    #[error("unclosed '[' in '{0}'")]
    UnclosedBracket(String),

    #[error("invalid range '{range}' in '{expr}'")]
    InvalidRange { expr: String, range: String },

    #[error("'{expr}' expands to more than {limit} hosts")]
    TooLarge { expr: String, limit: usize },

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("empty host in '{0}'")]
    EmptyHost(String),

    #[error("failed to read hosts file {path}: {reason}")]
    File { path: String, reason: String },
}

/// One host as written by the user, before defaults are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub user: Option<String>,
    pub address: String,
    pub port: Option<u16>,
}

impl HostTarget {
    /// Parse `[user@]address[:port]`
    ///
    /// IPv6 addresses must be bracketed to carry a port (`[::1]:2222`).
    pub fn parse(spec: &str) -> Result<Self, HostlistError> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(HostlistError::EmptyHost(spec.to_string())),
            None => (None, spec),
        };

        let (address, port) = if let Some(inner) = rest.strip_prefix('[') {
            let (addr, tail) = inner
                .split_once(']')
                .ok_or_else(|| HostlistError::UnclosedBracket(spec.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(p, spec)?),
                None if tail.is_empty() => None,
                None => return Err(HostlistError::InvalidPort(spec.to_string())),
            };
            (addr, port)
        } else if rest.matches(':').count() == 1 {
            let (addr, p) = rest
                .split_once(':')
                .ok_or_else(|| HostlistError::InvalidPort(spec.to_string()))?;
            (addr, Some(parse_port(p, spec)?))
        } else {
            // bare host, or an unbracketed IPv6 address
            (rest, None)
        };

        if address.is_empty() {
            return Err(HostlistError::EmptyHost(spec.to_string()));
        }

        Ok(Self {
            user,
            address: address.to_string(),
            port,
        })
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16, HostlistError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| HostlistError::InvalidPort(spec.to_string()))
}

/// Expand a comma-separated list of host expressions
///
/// Commas inside brackets belong to the range, not the list.
pub fn expand_list(list: &str) -> Result<Vec<String>, HostlistError> {
    let mut hosts = Vec::new();
    for item in split_top_level(list) {
        let item = item.trim();
        if !item.is_empty() {
            hosts.extend(expand(item)?);
        }
    }
    Ok(hosts)
}

/// Expand the bracket ranges of one host expression
pub fn expand(expr: &str) -> Result<Vec<String>, HostlistError> {
    let mut results = vec![String::new()];
    let mut rest = expr;

    while let Some(open) = rest.find('[') {
        let close = rest[open..]
            .find(']')
            .map(|i| open + i)
            .ok_or_else(|| HostlistError::UnclosedBracket(expr.to_string()))?;

        let literal = &rest[..open];
        let body = &rest[open + 1..close];

        // Bracketed IPv6 literal such as [::1]:22, not a range
        if body.contains(':') {
            let verbatim = &rest[..=close];
            for r in &mut results {
                r.push_str(verbatim);
            }
            rest = &rest[close + 1..];
            continue;
        }

        let values = range_values(body, expr)?;
        let total = results.len().saturating_mul(values.len());
        if total > MAX_EXPANSION {
            return Err(HostlistError::TooLarge {
                expr: expr.to_string(),
                limit: MAX_EXPANSION,
            });
        }

        let mut next = Vec::with_capacity(total);
        for prefix in &results {
            for value in &values {
                next.push(format!("{prefix}{literal}{value}"));
            }
        }
        results = next;
        rest = &rest[close + 1..];
    }

    for r in &mut results {
        r.push_str(rest);
    }
    Ok(results)
}

/// Values of a bracket body like `01-03` or `1,4-5`
fn range_values(body: &str, expr: &str) -> Result<Vec<String>, HostlistError> {
    let invalid = || HostlistError::InvalidRange {
        expr: expr.to_string(),
        range: body.to_string(),
    };

    let mut values = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let width = start.len();
                let pad = width > 1 && start.starts_with('0');
                let start: u64 = start.parse().map_err(|_| invalid())?;
                let end: u64 = end.parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                let count = (end - start)
                    .checked_add(1)
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(usize::MAX);
                if values.len().saturating_add(count) > MAX_EXPANSION {
                    return Err(HostlistError::TooLarge {
                        expr: expr.to_string(),
                        limit: MAX_EXPANSION,
                    });
                }
                for n in start..=end {
                    values.push(if pad {
                        format!("{n:0width$}")
                    } else {
                        n.to_string()
                    });
                }
            }
            None if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) => {
                values.push(part.to_string());
            }
            None => return Err(invalid()),
        }
    }
    Ok(values)
}

fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

/// Read host expressions from a file, one or more per line
///
/// Blank lines and `#` comments are skipped.
pub fn read_hosts_file(path: &Path) -> Result<Vec<String>, HostlistError> {
    let content = std::fs::read_to_string(path).map_err(|e| HostlistError::File {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut hosts = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if !line.is_empty() {
            hosts.extend(expand_list(line)?);
        }
    }
    Ok(hosts)
}
