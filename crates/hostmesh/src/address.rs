//! # Host addresses
//!
//! A `HostAddress` is the identity of a peer: the ip it calls from and the port
//! its own service listens on. It is the sole key of the connection registry.

use std::fmt;
use std::str::FromStr;

/// Canonical name for every loopback form seen at the transport boundary.
pub const LOCALHOST: &str = "localhost";

/// Errors produced when parsing a `HostAddress` from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No `:` separating ip and port.
    MissingPort(String),
    /// Either side of the separator was empty.
    Empty(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPort(s) => write!(f, "address '{}' has no port", s),
            Self::Empty(s) => write!(f, "address '{}' has an empty ip or port", s),
        }
    }
}

impl std::error::Error for ParseError {}

/// Immutable `(ip, port)` pair with value equality.
///
/// No normalization happens here; loopback forms are mapped to `localhost`
/// by [`normalize_ip`] before an address is built from a caller's ip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddress {
    ip: String,
    port: String,
}

impl HostAddress {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    /// Shorthand for `localhost:<port>`.
    pub fn localhost(port: impl Into<String>) -> Self {
        Self::new(LOCALHOST, port)
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// `ip:port`.
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Both fields are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.ip.is_empty() && !self.port.is_empty()
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for HostAddress {
    type Err = ParseError;

    /// Splits on the last `:` so bracket-less ipv6 hosts keep their colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::MissingPort(s.to_string()))?;
        if ip.is_empty() || port.is_empty() {
            return Err(ParseError::Empty(s.to_string()));
        }
        Ok(Self::new(ip, port))
    }
}

/// Maps the loopback forms a transport may report to `localhost`.
pub fn normalize_ip(ip: &str) -> String {
    match ip {
        "" | "::1" | "127.0.0.1" | LOCALHOST => LOCALHOST.to_string(),
        other => other.to_string(),
    }
}
