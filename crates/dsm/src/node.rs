// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node lifecycle and the application-facing API.
//!
//! A [`Node`] is one cluster member. Starting it installs the fault trap,
//! binds the request server, starts the fault service and opens links to
//! every peer. Chunks allocated through it are mapped locally and kept
//! coherent with the rest of the cluster through the master.
//!
//! # Example
//!
//! ```no_run
//! use dsm::{ClusterConfig, Node, PeerId};
//!
//! let cluster = ClusterConfig::load("cluster.conf")?
//!     .with_local(&PeerId::new("10.0.0.2", 8000))?;
//! let node = Node::builder(cluster).start()?;
//!
//! let chunk = node.alloc(1, 1 << 20)?;
//! chunk.store_u64(0, 42)?;
//! node.barrier()?;
//! node.free(chunk)?;
//! node.close()?;
//! # Ok::<(), dsm::Error>(())
//! ```

use crate::barrier::ClusterBarrier;
use crate::config::{page_size, ClusterConfig, NodeConfig};
use crate::directory::{Link, PeerDirectory};
use crate::dispatch::{Dispatcher, ReplicaTable};
use crate::engine::{CoherenceEngine, PageLocation, INITIAL_GRANT};
use crate::error::{Error, ErrorKind, Result};
use crate::fault::{FaultMailbox, FaultService, MasterLink, PageSource};
use crate::metrics::{MetricsSnapshot, NodeMetrics};
use crate::peer::PeerId;
use crate::protocol::{ChunkId, Reply, Request};
use crate::region::Protection;
use crate::replica::Replica;
use crate::transport::{ReplyWait, RequestServer};
use crate::trap::{self, TrapRegistration};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Builder for [`Node`].
pub struct NodeBuilder {
    cluster: ClusterConfig,
    config: NodeConfig,
    listener: Option<TcpListener>,
}

impl NodeBuilder {
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve on an already-bound listener instead of binding the local port.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn start(self) -> Result<Node> {
        let Self {
            cluster,
            config,
            listener,
        } = self;
        let local = cluster
            .local()
            .cloned()
            .ok_or_else(|| Error::Config("local node not selected".into()))?;

        trap::install()?;

        let directory = Arc::new(PeerDirectory::new(&cluster, &config)?);
        let metrics = Arc::new(NodeMetrics::new());
        let barrier = Arc::new(ClusterBarrier::new(cluster.len()));
        let replicas = Arc::new(ReplicaTable::new());
        let engine = if cluster.is_master() {
            Some(Arc::new(CoherenceEngine::new(
                local.clone(),
                page_size(),
                config.apply_wait_timeout,
                directory.clone(),
                metrics.clone(),
            )))
        } else {
            None
        };

        let listener = match listener {
            Some(listener) => listener,
            None => RequestServer::bind(SocketAddr::from(([0, 0, 0, 0], local.port())))?,
        };
        let dispatcher = Dispatcher::new(
            engine.clone(),
            replicas.clone(),
            barrier.clone(),
            metrics.clone(),
            config.apply_wait_timeout,
        );
        let server = RequestServer::spawn(listener, Arc::new(dispatcher), config.max_frame_size)?;

        let mailbox = Arc::new(FaultMailbox::new());
        let source: Arc<dyn PageSource> = match &engine {
            Some(engine) => engine.clone(),
            None => Arc::new(MasterLink::new(directory.clone(), &config)),
        };
        let faults = FaultService::spawn(
            mailbox.clone(),
            replicas.clone(),
            source,
            metrics.clone(),
            &config,
        )?;

        directory.connect_all();
        log::info!(
            "[dsm] node {} started ({} nodes, master {}{})",
            local,
            cluster.len(),
            cluster.master(),
            if engine.is_some() { ", local" } else { "" }
        );

        Ok(Node {
            cluster,
            config,
            directory,
            engine,
            replicas,
            registrations: Mutex::new(HashMap::new()),
            barrier,
            metrics,
            mailbox,
            server: Mutex::new(Some(server)),
            faults: Mutex::new(Some(faults)),
            closed: AtomicBool::new(false),
        })
    }
}

/// One member of a DSM cluster.
pub struct Node {
    cluster: ClusterConfig,
    config: NodeConfig,
    directory: Arc<PeerDirectory>,
    engine: Option<Arc<CoherenceEngine>>,
    replicas: Arc<ReplicaTable>,
    registrations: Mutex<HashMap<ChunkId, TrapRegistration>>,
    barrier: Arc<ClusterBarrier>,
    metrics: Arc<NodeMetrics>,
    mailbox: Arc<FaultMailbox>,
    server: Mutex<Option<RequestServer>>,
    faults: Mutex<Option<FaultService>>,
    closed: AtomicBool,
}

impl Node {
    pub fn builder(cluster: ClusterConfig) -> NodeBuilder {
        NodeBuilder {
            cluster,
            config: NodeConfig::default(),
            listener: None,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.directory.local_id()
    }

    pub fn master_id(&self) -> &PeerId {
        self.directory.master_id()
    }

    pub fn is_master(&self) -> bool {
        self.engine.is_some()
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn page_size(&self) -> usize {
        page_size()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn control(&self, request: &Request, wait: ReplyWait) -> Result<Reply> {
        self.directory
            .call_on(self.directory.master_id(), Link::Control, request, wait)
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Allocate or join chunk `chunk_id` of `size` bytes.
    ///
    /// The first allocator cluster-wide owns every page. Later allocators
    /// must pass the same size and start with no access; their first touch
    /// of each page faults it in.
    pub fn alloc(&self, chunk_id: ChunkId, size: u64) -> Result<ChunkHandle<'_>> {
        self.ensure_open()?;
        if size == 0 {
            return Err(Error::InvalidState("chunk size must be non-zero".into()));
        }
        if self.replicas.contains_key(&chunk_id) {
            return Err(Error::InvalidState(format!(
                "chunk {} is already allocated on this node",
                chunk_id
            )));
        }

        let replica = match &self.engine {
            Some(engine) => {
                engine.alloc_chunk(chunk_id, size, self.local_id())?;
                let replica = engine
                    .replica(chunk_id)
                    .ok_or(Error::Remote(ErrorKind::NoEntry))?;
                self.replicas.insert(chunk_id, replica.clone());
                replica
            }
            None => self.join_remote(chunk_id, size)?,
        };

        let registration =
            match trap::register(replica.app_ptr(), replica.mapped_len(), chunk_id, &self.mailbox) {
                Ok(registration) => registration,
                Err(e) => {
                    if let Err(undo) = self.leave(chunk_id) {
                        log::warn!("[dsm] rollback of chunk {} failed: {}", chunk_id, undo);
                    }
                    return Err(e);
                }
            };
        self.registrations.lock().insert(chunk_id, registration);

        log::debug!(
            "[dsm] chunk {} mapped at {:p} ({} pages)",
            chunk_id,
            replica.app_ptr(),
            replica.page_count()
        );
        Ok(ChunkHandle {
            chunk_id,
            replica,
            _node: PhantomData,
        })
    }

    fn join_remote(&self, chunk_id: ChunkId, size: u64) -> Result<Arc<Replica>> {
        let replica = Arc::new(Replica::new(chunk_id, size, page_size(), Protection::None)?);
        // Visible to the dispatcher before the master can send fetches for it.
        self.replicas.insert(chunk_id, replica.clone());

        let request = Request::AllocChunk {
            chunk_id,
            size,
            requestor: self.local_id().clone(),
        };
        let joined = match self.control(&request, ReplyWait::Default) {
            Ok(Reply::AllocChunk { is_owner }) => Ok(is_owner),
            Ok(other) => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: other.msg_type(),
            }),
            Err(e) => Err(e),
        };
        match joined {
            Ok(true) => {
                replica.grant_all(INITIAL_GRANT, Protection::Write)?;
                Ok(replica)
            }
            Ok(false) => Ok(replica),
            Err(e) => {
                self.replicas.remove(&chunk_id);
                Err(e)
            }
        }
    }

    /// Leave a chunk. Its mapping goes away once every handle is dropped.
    pub fn free(&self, chunk: ChunkHandle<'_>) -> Result<()> {
        let chunk_id = chunk.chunk_id;
        drop(chunk);
        self.free_chunk(chunk_id)
    }

    fn free_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let registration = self.registrations.lock().remove(&chunk_id);
        if registration.is_none() {
            return Err(Error::InvalidState(format!(
                "chunk {} is not allocated on this node",
                chunk_id
            )));
        }
        drop(registration);
        self.leave(chunk_id)
    }

    /// Tell the master this node no longer participates, then unmap.
    fn leave(&self, chunk_id: ChunkId) -> Result<()> {
        let result = match &self.engine {
            Some(engine) => engine.free_chunk(chunk_id, self.local_id()).map(|_| ()),
            None => {
                let request = Request::FreeChunk {
                    chunk_id,
                    requestor: self.local_id().clone(),
                };
                match self.control(&request, ReplyWait::Default) {
                    Ok(Reply::FreeChunk { .. }) => Ok(()),
                    Ok(other) => Err(Error::UnexpectedReply {
                        expected: request.msg_type(),
                        got: other.msg_type(),
                    }),
                    Err(e) => Err(e),
                }
            }
        };
        // The master pulled back everything it needed while answering.
        self.replicas.remove(&chunk_id);
        result
    }

    /// Chunks currently mapped on this node.
    pub fn chunks(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.registrations.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Local protection of a page, if the chunk is mapped here.
    pub fn page_protection(&self, chunk_id: ChunkId, page: usize) -> Option<Protection> {
        let replica = self.replicas.get(&chunk_id).map(|r| Arc::clone(r.value()))?;
        (page < replica.page_count()).then(|| replica.protection(page))
    }

    /// Owner and accessors of a page, as recorded by the master.
    pub fn locate_page(&self, chunk_id: ChunkId, page: u64) -> Result<PageLocation> {
        self.ensure_open()?;
        if let Some(engine) = &self.engine {
            return engine.locate_page(chunk_id, page);
        }
        let request = Request::LocatePage { chunk_id, page };
        match self.control(&request, ReplyWait::Default)? {
            Reply::LocatePage { owner, accessors } => Ok(PageLocation { owner, accessors }),
            other => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: other.msg_type(),
            }),
        }
    }

    /// Participants of a chunk. Master only.
    pub fn reference_count(&self, chunk_id: ChunkId) -> Option<usize> {
        self.engine.as_ref()?.reference_count(chunk_id)
    }

    // ========================================================================
    // Barrier / liveness
    // ========================================================================

    /// Block until every node in the cluster has called `barrier`.
    pub fn barrier(&self) -> Result<()> {
        self.ensure_open()?;
        if self.engine.is_some() {
            if !self.barrier.wait() {
                return Err(Error::Closed);
            }
        } else {
            match self.control(&Request::Barrier, ReplyWait::Unbounded)? {
                Reply::Barrier => {}
                other => {
                    return Err(Error::UnexpectedReply {
                        expected: Request::Barrier.msg_type(),
                        got: other.msg_type(),
                    })
                }
            }
        }
        self.metrics.inc_barriers();
        log::debug!("[dsm] barrier passed on {}", self.local_id());
        Ok(())
    }

    /// Round trip a NOOP to `peer`.
    pub fn ping(&self, peer: &PeerId) -> Result<Duration> {
        self.ensure_open()?;
        let start = Instant::now();
        match self
            .directory
            .call_on(peer, Link::Control, &Request::Noop, ReplyWait::Default)?
        {
            Reply::Noop => Ok(start.elapsed()),
            other => Err(Error::UnexpectedReply {
                expected: Request::Noop.msg_type(),
                got: other.msg_type(),
            }),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Leave the cluster.
    ///
    /// Frees any chunk still mapped here. The master then keeps serving
    /// until every peer has freed its chunks, polling at
    /// `close_poll_interval`.
    pub fn close(self) -> Result<()> {
        self.ensure_open()?;
        let first_error = self.free_leftovers();

        if let Some(engine) = &self.engine {
            loop {
                let live = engine.chunk_count();
                if live == 0 {
                    break;
                }
                log::info!("[dsm] waiting for {} chunk(s) to be freed", live);
                thread::sleep(self.config.close_poll_interval);
            }
        }

        self.shutdown();
        first_error.map_or(Ok(()), Err)
    }

    /// Free every chunk still mapped here, returning the first failure.
    fn free_leftovers(&self) -> Option<Error> {
        let mut first_error = None;
        for chunk_id in self.chunks() {
            log::warn!("[dsm] chunk {} still allocated at close, freeing", chunk_id);
            if let Err(e) = self.free_chunk(chunk_id) {
                log::warn!("[dsm] free of chunk {} at close failed: {}", chunk_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut faults) = self.faults.lock().take() {
            faults.stop();
        }
        self.barrier.cancel();

        if let Some(mut server) = self.server.lock().take() {
            let terminate = Request::Terminate {
                requestor: self.local_id().clone(),
            };
            let acked = self.directory.call_on(
                self.local_id(),
                Link::Control,
                &terminate,
                ReplyWait::Default,
            );
            if let Err(e) = acked {
                log::debug!("[dsm] self TERMINATE failed ({}), stopping directly", e);
                server.stop();
            }
            server.join();
        }

        self.directory.close_all();
        self.registrations.lock().clear();
        self.replicas.clear();
        log::info!("[dsm] node {} closed", self.local_id());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            // Best effort; the master otherwise keeps this node as a participant.
            let _ = self.free_leftovers();
        }
        self.shutdown();
    }
}

/// A chunk mapped on a node.
///
/// All accessors go through the node's faulting view of the chunk, so every
/// access is coherent with the rest of the cluster.
pub struct ChunkHandle<'n> {
    chunk_id: ChunkId,
    replica: Arc<Replica>,
    _node: PhantomData<&'n Node>,
}

impl ChunkHandle<'_> {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.replica.size() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_count(&self) -> usize {
        self.replica.page_count()
    }

    /// Base address of the chunk in this process.
    ///
    /// Raw accesses through this pointer are coherent too; they stay valid
    /// until the handle is freed.
    pub fn as_ptr(&self) -> *mut u8 {
        self.replica.app_ptr()
    }

    fn check(&self, offset: usize, len: usize, align: usize) -> Result<()> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.len());
        if !in_bounds {
            return Err(Error::InvalidState(format!(
                "access {}+{} outside chunk {} of {} bytes",
                offset,
                len,
                self.chunk_id,
                self.len()
            )));
        }
        if offset % align != 0 {
            return Err(Error::InvalidState(format!(
                "offset {} is not {}-byte aligned",
                offset, align
            )));
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len(), 1)?;
        // SAFETY: the range is inside the mapping; faults are resolved by the trap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len(), 1)?;
        // SAFETY: the range is inside the mapping; faults are resolved by the trap.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len()) };
        Ok(())
    }

    pub fn load_u64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8, 8)?;
        // SAFETY: in bounds and 8-byte aligned (the mapping is page aligned).
        Ok(unsafe { std::ptr::read_volatile(self.as_ptr().add(offset).cast::<u64>()) })
    }

    pub fn store_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.check(offset, 8, 8)?;
        // SAFETY: in bounds and 8-byte aligned (the mapping is page aligned).
        unsafe { std::ptr::write_volatile(self.as_ptr().add(offset).cast::<u64>(), value) };
        Ok(())
    }
}

impl std::fmt::Debug for ChunkHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("chunk_id", &self.chunk_id)
            .field("len", &self.len())
            .field("pages", &self.page_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo() -> Node {
        let listener = RequestServer::bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let cluster = ClusterConfig::new(vec![PeerId::new("127.0.0.1", port)], 0)
            .expect("valid")
            .with_local_index(0)
            .expect("local");
        Node::builder(cluster)
            .config(NodeConfig::default().with_close_poll_interval(Duration::from_millis(10)))
            .listener(listener)
            .start()
            .expect("start")
    }

    #[test]
    fn test_single_node_owns_everything() {
        let node = solo();
        assert!(node.is_master());
        let ps = node.page_size();

        let chunk = node.alloc(1, 3 * ps as u64).expect("alloc");
        assert_eq!(chunk.page_count(), 3);
        for page in 0..3 {
            assert_eq!(node.page_protection(1, page), Some(Protection::Write));
        }
        chunk.store_u64(ps, 0xDEAD_BEEF).expect("store");
        assert_eq!(chunk.load_u64(ps).expect("load"), 0xDEAD_BEEF);
        assert_eq!(node.metrics().faults_resolved(), 0);

        let loc = node.locate_page(1, 1).expect("locate");
        assert_eq!(&loc.owner, node.local_id());
        node.barrier().expect("barrier of one");
        node.ping(&node.local_id().clone()).expect("ping self");

        node.free(chunk).expect("free");
        assert_eq!(node.reference_count(1), None);
        node.close().expect("close");
    }

    #[test]
    fn test_alloc_validation() {
        let node = solo();
        assert!(matches!(node.alloc(1, 0), Err(Error::InvalidState(_))));
        let chunk = node.alloc(1, 100).expect("alloc");
        assert_eq!(chunk.len(), 100);
        assert!(matches!(node.alloc(1, 100), Err(Error::InvalidState(_))));

        let mut buf = [0u8; 8];
        assert!(chunk.read_bytes(96, &mut buf).is_err());
        assert!(chunk.load_u64(3).is_err());
        chunk.write_bytes(92, b"tail").expect("in bounds");
        chunk.read_bytes(92, &mut buf[..4]).expect("in bounds");
        assert_eq!(&buf[..4], b"tail");
        node.close().expect("close frees leftovers");
    }
}
