use std::fmt;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 80;

/// Fixed upstream configured for every bridge. With no `host` the upstream
/// is taken from the `Host` header of each bridge's first request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Resolved upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the upstream for a bridge from its configuration and first request.
    ///
    /// A configured host always wins and the request is not inspected at all.
    pub fn resolve(proxy: &ProxyTarget, request: &[u8]) -> Result<Self> {
        if let Some(ref host) = proxy.host {
            return Ok(Self::new(host.clone(), proxy.port.unwrap_or(DEFAULT_PORT)));
        }

        let value = host_header(request)?;
        parse_authority(value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Whether `request` holds the whole first header block, up to and including
/// the blank line.
pub fn head_complete(request: &[u8]) -> bool {
    request.windows(4).any(|w| w == b"\r\n\r\n")
}

/// CR-terminated lines of the first header block, stopping at the blank line.
/// A trailing fragment without its line terminator is ignored.
fn header_lines(request: &[u8]) -> impl Iterator<Item = &[u8]> {
    let terminated = match request.iter().rposition(|&b| b == b'\n') {
        Some(end) => &request[..end],
        None => &[][..],
    };

    terminated
        .split(|&b| b == b'\n')
        .map_while(|line| line.strip_suffix(b"\r"))
        .take_while(|line| !line.is_empty())
}

fn host_header(request: &[u8]) -> Result<&str> {
    let mut found = None;

    // The request line has no `Host:` prefix, so it is scanned like any other.
    for line in header_lines(request) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (name, value) = (&line[..colon], &line[colon + 1..]);
        if !name.eq_ignore_ascii_case(b"host") {
            continue;
        }
        if found.is_some() {
            return Err(Error::MalformedRequest("duplicate Host header".into()));
        }
        let value = std::str::from_utf8(value)
            .map_err(|_| Error::MalformedRequest("Host header is not valid UTF-8".into()))?;
        found = Some(value.trim_matches(|c| c == ' ' || c == '\t'));
    }

    found.ok_or_else(|| Error::MalformedRequest("no Host header in request".into()))
}

fn parse_authority(value: &str) -> Result<Target> {
    if value.is_empty() {
        return Err(Error::MalformedRequest("empty Host header".into()));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '@' | '?' | '#'))
    {
        return Err(Error::MalformedRequest(format!(
            "invalid Host header '{value}'"
        )));
    }

    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            Error::MalformedRequest(format!("unterminated IPv6 literal in '{value}'"))
        })?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(Error::MalformedRequest(format!(
                        "unexpected data after IPv6 literal in '{value}'"
                    )))
                }
            },
        }
    } else {
        match value.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(Error::MalformedRequest(format!(
                    "ambiguous Host header '{value}': IPv6 literals must be bracketed"
                )))
            }
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.is_empty() {
        return Err(Error::MalformedRequest(format!(
            "missing host in Host header '{value}'"
        )));
    }

    let port = match port {
        Some(port) => parse_port(port).ok_or_else(|| {
            Error::MalformedRequest(format!("invalid port in Host header '{value}'"))
        })?,
        None => DEFAULT_PORT,
    };

    Ok(Target::new(host, port))
}

fn parse_port(raw: &str) -> Option<u16> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().filter(|&port| port != 0)
}
