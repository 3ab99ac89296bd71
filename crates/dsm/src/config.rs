// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster membership and node tunables.
//!
//! - [`ClusterConfig`] - static membership: peer list, master, local node
//! - [`NodeConfig`] - timeouts and retry policy for one node
//!
//! # Membership file
//!
//! ```text
//! 3
//! * 10.0.0.1 8000
//! - 10.0.0.2 8000
//! - 10.0.0.3 8000
//! ```
//!
//! The first token is the node count. Each record is a one-character marker
//! (`*` for the master, anything else for a worker), a host and a port.
//!
//! # Example
//!
//! ```
//! use dsm::{ClusterConfig, PeerId};
//!
//! let cluster = ClusterConfig::parse("2\n* 127.0.0.1 7000\n- 127.0.0.1 7001\n")
//!     .unwrap()
//!     .with_local(&PeerId::new("127.0.0.1", 7001))
//!     .unwrap();
//! assert!(!cluster.is_master());
//! ```

use crate::error::{Error, Result};
use crate::peer::{PeerId, MAX_HOST_LEN};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Default outbound connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between close-time drain checks.
pub const DEFAULT_CLOSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default maximum frame size (anti-OOM protection).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Marker for the master record in a membership file.
pub const MASTER_MARKER: char = '*';

/// Static cluster membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    peers: Vec<PeerId>,
    master: usize,
    local: Option<usize>,
}

impl ClusterConfig {
    /// Build membership from an explicit peer list.
    pub fn new(peers: Vec<PeerId>, master: usize) -> Result<Self> {
        if peers.is_empty() {
            return Err(Error::Config("cluster has no nodes".into()));
        }
        if master >= peers.len() {
            return Err(Error::Config(format!(
                "master index {} out of range for {} nodes",
                master,
                peers.len()
            )));
        }
        let mut seen = HashSet::with_capacity(peers.len());
        for peer in &peers {
            if peer.host().is_empty() || peer.host().len() > MAX_HOST_LEN {
                return Err(Error::Config(format!("invalid host for {}", peer)));
            }
            if !seen.insert(peer) {
                return Err(Error::Config(format!("duplicate node {}", peer)));
            }
        }
        Ok(Self {
            peers,
            master,
            local: None,
        })
    }

    /// Parse a membership file body.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();
        let count: usize = tokens
            .next()
            .ok_or_else(|| Error::Config("empty membership file".into()))?
            .parse()
            .map_err(|_| Error::Config("node count is not a number".into()))?;
        if count == 0 {
            return Err(Error::Config("cluster has no nodes".into()));
        }

        let mut peers = Vec::with_capacity(count);
        let mut master = None;
        for i in 0..count {
            let (marker, host, port) = match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(m), Some(h), Some(p)) => (m, h, p),
                _ => {
                    return Err(Error::Config(format!(
                        "expected {} node records, found {}",
                        count, i
                    )))
                }
            };
            let mut chars = marker.chars();
            let is_master = match (chars.next(), chars.next()) {
                (Some(c), None) => c == MASTER_MARKER,
                _ => {
                    return Err(Error::Config(format!(
                        "record {}: marker must be one character, got '{}'",
                        i + 1,
                        marker
                    )))
                }
            };
            let port: u16 = port.parse().map_err(|_| {
                Error::Config(format!("record {}: invalid port '{}'", i + 1, port))
            })?;
            if is_master {
                if master.is_some() {
                    return Err(Error::Config("more than one master".into()));
                }
                master = Some(i);
            }
            peers.push(PeerId::new(host, port));
        }

        let master = master.ok_or_else(|| Error::Config("no master marked".into()))?;
        Self::new(peers, master)
    }

    /// Read and parse a membership file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Select the local node by identity.
    pub fn with_local(mut self, local: &PeerId) -> Result<Self> {
        let idx = self
            .index_of(local)
            .ok_or_else(|| Error::Config(format!("{} is not a cluster member", local)))?;
        self.local = Some(idx);
        Ok(self)
    }

    /// Select the local node by position in the peer list.
    pub fn with_local_index(mut self, idx: usize) -> Result<Self> {
        if idx >= self.peers.len() {
            return Err(Error::Config(format!("local index {} out of range", idx)));
        }
        self.local = Some(idx);
        Ok(self)
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn master_index(&self) -> usize {
        self.master
    }

    pub fn master(&self) -> &PeerId {
        &self.peers[self.master]
    }

    pub fn local_index(&self) -> Option<usize> {
        self.local
    }

    /// Local node identity, if selected.
    pub fn local(&self) -> Option<&PeerId> {
        self.local.map(|i| &self.peers[i])
    }

    /// True when the local node is the master. False when no local node is selected.
    pub fn is_master(&self) -> bool {
        self.local == Some(self.master)
    }

    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p == peer)
    }
}

/// Per-node tunables.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Outbound connect timeout
    pub connect_timeout: Duration,

    /// Time to wait for a reply before the call fails
    pub request_timeout: Duration,

    /// Transport retries per call (reconnect and resend)
    pub max_retries: u32,

    /// Delay before a transport retry
    pub retry_delay: Duration,

    /// Interval between drain checks during close
    pub close_poll_interval: Duration,

    /// Bound on waiting for an in-flight page grant to be installed
    pub apply_wait_timeout: Duration,

    /// Attempts per page fault before the process is aborted
    pub fault_retry_limit: u32,

    /// Maximum frame size accepted from a peer
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            close_poll_interval: DEFAULT_CLOSE_POLL_INTERVAL,
            apply_wait_timeout: Duration::from_secs(5),
            fault_retry_limit: 5,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl NodeConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_close_poll_interval(mut self, interval: Duration) -> Self {
        self.close_poll_interval = interval;
        self
    }

    pub fn with_apply_wait_timeout(mut self, timeout: Duration) -> Self {
        self.apply_wait_timeout = timeout;
        self
    }

    pub fn with_fault_retry_limit(mut self, limit: u32) -> Self {
        self.fault_retry_limit = limit.max(1);
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// How long a node waits for the master to answer a GETPAGE in a cluster
    /// of `nodes`.
    ///
    /// Covers the master's worst case: a local apply wait, then one call per
    /// other node (the owner fetch and every invalidation), each resent up to
    /// `max_retries` times.
    pub fn page_reply_timeout(&self, nodes: usize) -> Duration {
        let others = u32::try_from(nodes.saturating_sub(1).max(1)).unwrap_or(u32::MAX);
        let calls = others.saturating_mul(self.max_retries.saturating_add(1));
        (self.request_timeout + self.retry_delay)
            .saturating_mul(calls)
            .saturating_add(self.request_timeout)
            .saturating_add(self.apply_wait_timeout)
    }
}

/// OS page size, read once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions and is thread-safe.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Number of pages needed to hold `size` bytes.
pub fn pages_for(size: u64, page_size: usize) -> usize {
    size.div_ceil(page_size as u64) as usize
}
