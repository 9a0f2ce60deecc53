use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Shortest `host:port` remainder worth looking at (e.g. `a.b:1`)
pub const MIN_CANDIDATE_LEN: usize = 5;

/// Protocol a candidate is dialed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protocol hint carried by the raw candidate, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolHint {
    Http,
    Socks5,
    #[default]
    Unknown,
}

impl ProtocolHint {
    /// Map a URL scheme onto a hint; `None` means the scheme is not usable
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "http" | "https" => Some(ProtocolHint::Http),
            "socks" | "socks4" | "socks5" | "socks5h" => Some(ProtocolHint::Socks5),
            _ => None,
        }
    }

    /// Protocols worth racing for this hint
    pub fn candidates(&self) -> &'static [Protocol] {
        match self {
            ProtocolHint::Http => &[Protocol::Http],
            ProtocolHint::Socks5 => &[Protocol::Socks5],
            ProtocolHint::Unknown => &[Protocol::Http, Protocol::Socks5],
        }
    }
}

/// A normalized candidate endpoint
///
/// Fields are private so an `Endpoint` can only exist in its validated form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    hint: ProtocolHint,
}

impl Endpoint {
    /// Build an endpoint from already-split parts
    pub fn new(host: &str, port: u16, hint: ProtocolHint) -> Result<Self> {
        if port == 0 {
            return Err(ScanError::NormalizationRejected("port 0".to_string()));
        }

        let host = host.trim();
        if host.is_empty() {
            return Err(ScanError::NormalizationRejected("empty host".to_string()));
        }

        let host = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) if is_valid_hostname(host) => host.to_lowercase(),
            Err(_) => {
                return Err(ScanError::NormalizationRejected(format!(
                    "invalid host '{}'",
                    host
                )))
            }
        };

        Ok(Self { host, port, hint })
    }

    /// Normalize one raw candidate line
    ///
    /// Rejections come back as [`ScanError::NormalizationRejected`] and are never fatal.
    pub fn parse(raw: &str) -> Result<Self> {
        let line = match raw.find('#') {
            Some(idx) => &raw[..idx],
            None => raw,
        };

        let token = line
            .split_whitespace()
            .next()
            .ok_or_else(|| ScanError::NormalizationRejected("empty line".to_string()))?;

        let (hint, rest) = match token.split_once("://") {
            Some((scheme, rest)) => {
                let hint = ProtocolHint::from_scheme(scheme).ok_or_else(|| {
                    ScanError::NormalizationRejected(format!("unsupported scheme '{}'", scheme))
                })?;
                (hint, rest)
            }
            None => (ProtocolHint::Unknown, token),
        };

        // Drop any path or trailing slash.
        let rest = rest.split('/').next().unwrap_or_default();

        if rest.len() < MIN_CANDIDATE_LEN {
            return Err(ScanError::NormalizationRejected(format!(
                "too short: '{}'",
                rest
            )));
        }

        let (host, port) = split_host_port(rest)?;
        Self::new(host, port, hint)
    }

    /// Same as [`Endpoint::parse`] but reports rejection as "not a candidate"
    pub fn normalize(raw: &str) -> Option<Self> {
        Self::parse(raw).ok()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn hint(&self) -> ProtocolHint {
        self.hint
    }

    /// Host as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Endpoint identity used for deduplication (`host:port`, IPv6 bracketed)
    pub fn identity(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// Proxy URL for the given protocol
    pub fn url(&self, protocol: Protocol) -> String {
        format!("{}://{}", protocol.as_str(), self.identity())
    }

    /// Copy of this endpoint carrying a different hint
    pub fn with_hint(&self, hint: ProtocolHint) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            hint,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identity())
    }
}

/// Format `host:port`, bracketing bare IPv6 hosts
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn split_host_port(rest: &str) -> Result<(&str, u16)> {
    let (host, port_str) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(|| {
            ScanError::NormalizationRejected(format!("unterminated IPv6 literal '{}'", rest))
        })?;
        let port_str = after.strip_prefix(':').ok_or_else(|| {
            ScanError::NormalizationRejected(format!("missing port in '{}'", rest))
        })?;
        (host, port_str)
    } else {
        rest.rsplit_once(':')
            .ok_or_else(|| ScanError::NormalizationRejected(format!("missing port in '{}'", rest)))?
    };

    let port = port_str.parse::<u16>().map_err(|_| {
        ScanError::NormalizationRejected(format!("non-numeric port '{}'", port_str))
    })?;

    Ok((host, port))
}

fn is_valid_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }

    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
