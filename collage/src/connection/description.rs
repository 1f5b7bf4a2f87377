// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Transport descriptions: where and how to reach a peer
//!
//! A [ConnectionDescription] is immutable once a connection is built from
//! it. The string form accepted by [ConnectionDescription::from_string] is
//! `(host|ip)[:port][:type]`; the default host comes from the `EQ_SERVER`
//! environment variable (else `localhost`) and the default port is
//! [DEFAULT_PORT].

use std::fmt::Display;

use crate::errors::ConnectionError;

/// The default port used when a description does not carry one
pub const DEFAULT_PORT: u16 = 4242;

/// Environment variable naming the default peer to connect to
pub const ENV_SERVER: &str = "EQ_SERVER";

/// The supported transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// TCP/IP socket stream
    TcpIp,
    /// In-process pipe pair
    Pipe,
    /// Named pipe (Unix domain socket)
    NamedPipe,
    /// Reliable multicast group over UDP
    Rsp,
    /// InfiniBand verbs (not supported by this build)
    Infiniband,
}

impl Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::TcpIp => "TCPIP",
            Self::Pipe => "PIPE",
            Self::NamedPipe => "NAMEDPIPE",
            Self::Rsp => "RSP",
            Self::Infiniband => "IB",
        };
        write!(f, "{token}")
    }
}

impl ConnectionKind {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "TCPIP" | "TCP" => Some(Self::TcpIp),
            "PIPE" => Some(Self::Pipe),
            "NAMEDPIPE" => Some(Self::NamedPipe),
            "RSP" | "MCIP" => Some(Self::Rsp),
            "IB" => Some(Self::Infiniband),
            _ => None,
        }
    }
}

/// Where and how to reach a peer
///
/// Immutable once a connection has been established from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescription {
    /// The transport protocol
    pub kind: ConnectionKind,
    /// Target host name or address (multicast group for RSP)
    pub hostname: String,
    /// Target port
    pub port: u16,
    /// Outgoing interface address for multicast, empty for the default
    pub interface: String,
    /// Path for named-pipe transports, empty otherwise
    pub filename: String,
    /// Bandwidth hint in KB/s, zero for unknown
    pub bandwidth: u32,
}

impl Default for ConnectionDescription {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::TcpIp,
            hostname: default_host(),
            port: DEFAULT_PORT,
            interface: String::new(),
            filename: String::new(),
            bandwidth: 0,
        }
    }
}

/// The `EQ_SERVER` host, else `localhost`
pub fn default_host() -> String {
    std::env::var(ENV_SERVER).unwrap_or_else(|_| "localhost".to_string())
}

impl ConnectionDescription {
    /// Build a TCP/IP description for an explicit host and port
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse the `(host|ip)[:port][:type]` string form
    ///
    /// Unspecified parts take their defaults; a path followed by
    /// `:NAMEDPIPE` selects the named-pipe transport.
    pub fn from_string(data: &str) -> Result<Self, ConnectionError> {
        if data.is_empty() {
            return Err(ConnectionError::BadDescription(data.to_string()));
        }

        let mut description = Self::default();
        let mut host_seen = false;
        for token in data.split(':') {
            if token.is_empty() {
                return Err(ConnectionError::BadDescription(data.to_string()));
            }
            if !host_seen {
                description.hostname = token.to_string();
                host_seen = true;
            } else if token.chars().all(|c| c.is_ascii_digit()) {
                description.port = token
                    .parse()
                    .map_err(|_| ConnectionError::BadDescription(data.to_string()))?;
            } else if let Some(kind) = ConnectionKind::from_token(token) {
                description.kind = kind;
            } else {
                return Err(ConnectionError::BadDescription(data.to_string()));
            }
        }

        if description.kind == ConnectionKind::NamedPipe {
            description.filename = std::mem::take(&mut description.hostname);
        }
        Ok(description)
    }
}

impl Display for ConnectionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = if self.kind == ConnectionKind::NamedPipe {
            &self.filename
        } else {
            &self.hostname
        };
        write!(f, "{target}:{}", self.port)?;
        if self.kind != ConnectionKind::TcpIp {
            write!(f, ":{}", self.kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_only() {
        let desc = ConnectionDescription::from_string("render1").expect("Failed to parse");
        assert_eq!(desc.hostname, "render1");
        assert_eq!(desc.port, DEFAULT_PORT);
        assert_eq!(desc.kind, ConnectionKind::TcpIp);
    }

    #[test]
    fn parses_host_port_and_kind() {
        let desc = ConnectionDescription::from_string("10.0.0.7:7777:RSP").expect("Failed to parse");
        assert_eq!(desc.hostname, "10.0.0.7");
        assert_eq!(desc.port, 7777);
        assert_eq!(desc.kind, ConnectionKind::Rsp);
    }

    #[test]
    fn parses_named_pipe_path() {
        let desc =
            ConnectionDescription::from_string("/tmp/collage.sock:NAMEDPIPE").expect("Failed to parse");
        assert_eq!(desc.kind, ConnectionKind::NamedPipe);
        assert_eq!(desc.filename, "/tmp/collage.sock");
        assert!(desc.hostname.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ConnectionDescription::from_string("").is_err());
        assert!(ConnectionDescription::from_string("host:port:wat").is_err());
        assert!(ConnectionDescription::from_string("host::1234").is_err());
    }

    #[test]
    fn display_round_trip() {
        let desc = ConnectionDescription::tcp("render1", 9000);
        let text = desc.to_string();
        let parsed = ConnectionDescription::from_string(&text).expect("Failed to parse");
        assert_eq!(parsed, desc);
    }
}
