// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer directory: identity to link mapping.
//!
//! Every peer gets two persistent links. The control link carries chunk
//! lifecycle, barrier and termination traffic; the paging link carries
//! page faults and the master's fetch/invalidate calls. Keeping them apart
//! means a node blocked in a barrier never holds up page traffic.

use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::protocol::{Reply, Request};
use crate::transport::{PeerConnection, ReplyWait};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Which of a peer's two links to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Control,
    Paging,
}

/// Calls a request on a peer and waits for the reply.
///
/// The coherence engine reaches other nodes only through this trait.
pub trait PeerCaller: Send + Sync {
    fn call(&self, peer: &PeerId, request: &Request) -> Result<Reply>;
}

struct PeerHandle {
    id: PeerId,
    control: Mutex<PeerConnection>,
    paging: Mutex<PeerConnection>,
}

/// All cluster peers with their links, plus the local and master identities.
pub struct PeerDirectory {
    peers: Vec<PeerHandle>,
    index: HashMap<PeerId, usize>,
    local: usize,
    master: usize,
}

impl PeerDirectory {
    /// Build the directory. Links are opened by [`PeerDirectory::connect_all`]
    /// or on first use.
    pub fn new(cluster: &ClusterConfig, config: &NodeConfig) -> Result<Self> {
        let local = cluster
            .local_index()
            .ok_or_else(|| Error::Config("local node not selected".into()))?;
        let peers: Vec<PeerHandle> = cluster
            .peers()
            .iter()
            .map(|id| PeerHandle {
                id: id.clone(),
                control: Mutex::new(PeerConnection::new(id.clone(), config)),
                paging: Mutex::new(PeerConnection::new(id.clone(), config)),
            })
            .collect();
        let index = peers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Ok(Self {
            peers,
            index,
            local,
            master: cluster.master_index(),
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.peers[self.local].id
    }

    pub fn master_id(&self) -> &PeerId {
        &self.peers[self.master].id
    }

    pub fn is_master(&self) -> bool {
        self.local == self.master
    }

    pub fn index_of(&self, peer: &PeerId) -> Option<usize> {
        self.index.get(peer).copied()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.index.contains_key(peer)
    }

    /// Every peer other than this node.
    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != self.local)
            .map(|(_, p)| &p.id)
    }

    fn handle(&self, peer: &PeerId) -> Result<&PeerHandle> {
        self.index_of(peer)
            .map(|i| &self.peers[i])
            .ok_or_else(|| Error::InvalidState(format!("{} is not a cluster member", peer)))
    }

    /// Open both links to every remote peer.
    ///
    /// Failures are logged and left for the first call to retry.
    pub fn connect_all(&self) {
        for (i, peer) in self.peers.iter().enumerate() {
            if i == self.local {
                continue;
            }
            for (name, link) in [("control", &peer.control), ("paging", &peer.paging)] {
                if let Err(e) = link.lock().connect() {
                    log::warn!("[dsm] {} link to {} not up yet: {}", name, peer.id, e);
                }
            }
        }
    }

    /// Call `request` on `peer` over `link`.
    pub fn call_on(&self, peer: &PeerId, link: Link, request: &Request, wait: ReplyWait) -> Result<Reply> {
        let handle = self.handle(peer)?;
        let conn = match link {
            Link::Control => &handle.control,
            Link::Paging => &handle.paging,
        };
        conn.lock().call_with(request, wait)
    }

    /// Close every link.
    pub fn close_all(&self) {
        for peer in &self.peers {
            peer.control.lock().close();
            peer.paging.lock().close();
        }
    }
}

impl PeerCaller for PeerDirectory {
    fn call(&self, peer: &PeerId, request: &Request) -> Result<Reply> {
        self.call_on(peer, Link::Paging, request, ReplyWait::Default)
    }
}
