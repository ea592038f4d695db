//! Core value types for `WireGuard` configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, WireGuardError};

/// Port assumed when an endpoint host is given without one.
pub const DEFAULT_ENDPOINT_PORT: u16 = 51820;

/// Maximum length for hostnames (RFC 1035).
const MAX_HOSTNAME_LENGTH: usize = 253;

/// Regex for valid hostnames (RFC 1123).
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*$")
        .unwrap_or_else(|_| unreachable!())
});

/// Where a key comes from.
///
/// Inline text and a file reference are mutually exclusive; the choice is
/// made once, when the source is built from the raw fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource<K> {
    /// Key given directly.
    Inline(K),
    /// Key stored in a file, resolved through a [`KeyStore`](crate::KeyStore).
    File(PathBuf),
    /// No key configured.
    Absent,
}

impl<K> Default for KeySource<K> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<K> KeySource<K> {
    /// Builds a key source from the raw (inline text, file reference) pair.
    ///
    /// Empty strings count as absent. `parse` decodes the inline text.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for `field` if both are set or the
    /// inline text does not decode.
    pub fn from_fields<F>(
        field: &str,
        inline: Option<&str>,
        file: Option<&str>,
        parse: F,
    ) -> Result<Self, ValidationError>
    where
        F: FnOnce(&str) -> Result<K, WireGuardError>,
    {
        let inline = inline.map(str::trim).filter(|s| !s.is_empty());
        let file = file.map(str::trim).filter(|s| !s.is_empty());

        match (inline, file) {
            (Some(_), Some(_)) => Err(ValidationError::new(
                field,
                "either select a key file or enter a key, not both",
            )),
            (Some(text), None) => parse(text)
                .map(Self::Inline)
                .map_err(|e| ValidationError::new(field, e.to_string())),
            (None, Some(path)) => Ok(Self::File(PathBuf::from(path))),
            (None, None) => Ok(Self::Absent),
        }
    }

    /// Returns the inline key, if any.
    #[must_use]
    pub fn inline(&self) -> Option<&K> {
        match self {
            Self::Inline(key) => Some(key),
            _ => None,
        }
    }

    /// Returns the file reference, if any.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            _ => None,
        }
    }

    /// Returns whether no key is configured.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// A `WireGuard` peer endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Endpoint {
    /// Literal socket address.
    Addr(SocketAddr),
    /// Hostname to be resolved before use.
    Host {
        /// DNS name.
        host: String,
        /// UDP port.
        port: u16,
    },
}

impl Endpoint {
    /// Creates an endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self::Addr(address)
    }

    /// Builds an endpoint from separate host and port fields.
    ///
    /// A literal IP host yields [`Endpoint::Addr`]; a missing port defaults
    /// to 51820.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is neither an IP nor a valid hostname.
    pub fn from_parts(host: &str, port: Option<u16>) -> Result<Self, WireGuardError> {
        let host = host.trim();
        let port = port.unwrap_or(DEFAULT_ENDPOINT_PORT);
        let unbracketed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            return Ok(Self::Addr(SocketAddr::new(ip, port)));
        }
        if !is_valid_hostname(host) {
            return Err(WireGuardError::InvalidEndpoint(format!(
                "invalid host: {host}"
            )));
        }
        Ok(Self::Host {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Returns the literal address, if already resolved.
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Addr(addr) => Some(*addr),
            Self::Host { .. } => None,
        }
    }

    /// Returns whether this endpoint needs DNS resolution.
    #[must_use]
    pub fn is_hostname(&self) -> bool {
        matches!(self, Self::Host { .. })
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Addr(addr) => addr.port(),
            Self::Host { port, .. } => *port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Addr(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireGuardError::InvalidEndpoint(format!("missing port: {s}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| WireGuardError::InvalidEndpoint(format!("{s}: {e}")))?;
        Self::from_parts(host, Some(port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Host { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = WireGuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Checks a DNS name against RFC 1123.
#[must_use]
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty() && host.len() <= MAX_HOSTNAME_LENGTH && HOSTNAME_REGEX.is_match(host)
}
