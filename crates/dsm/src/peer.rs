// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer identity.

use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Longest host name accepted in membership files and on the wire.
pub const MAX_HOST_LEN: usize = 255;

/// A cluster node, identified by the host and port its request server listens on.
///
/// Equality is structural; two ids naming the same host string and port are
/// the same node everywhere in the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    host: String,
    port: u16,
}

impl PeerId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address, preferring IPv4.
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self),
                )
            })
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("expected host:port, got '{}'", s)))?;
        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(Error::Config(format!("invalid host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port in '{}'", s)))?;
        Ok(Self::new(host, port))
    }
}
