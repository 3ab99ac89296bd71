// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Coherence engine: the master's page-ownership table.
//!
//! The engine is the single source of truth for who owns each page and who
//! holds read copies. Every coherence operation is funneled through it, so
//! holding a page's lock for the whole operation serializes that page
//! cluster-wide.
//!
//! # Locking
//!
//! - chunk `state` (RwLock): read by page operations, written by alloc/free,
//!   so a free's pull-back sweep never races a fault on the same chunk
//! - per-page `Mutex<PageMeta>`: held across the fetch/invalidate round trips
//!   of one operation
//!
//! # Versions
//!
//! Each page counts grants. Every GETPAGE bumps the count; the new value is
//! the grant version returned to the requestor and sent along with any
//! fetch or invalidation it triggers, together with the version the target
//! itself was last granted (`after`).
//!
//! # Page states (per peer)
//!
//! ```text
//!   NONE --read--> READ --write (upgrade, no payload)--> WRITE
//!     \________________write (with payload)____________/
//!   READ/WRITE --invalidate or write fetch--> NONE
//!   WRITE --read fetch--> READ
//! ```

use crate::config::pages_for;
use crate::directory::PeerCaller;
use crate::error::{Error, ErrorKind, Result};
use crate::fault::PageSource;
use crate::metrics::NodeMetrics;
use crate::peer::PeerId;
use crate::protocol::{ChunkId, GetPage, Invalidate, PageFlags, Reply, Request};
use crate::region::Protection;
use crate::replica::Replica;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Grant version of the creator's initial ownership of every page.
pub const INITIAL_GRANT: u64 = 1;

/// Result of a GETPAGE on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageGrant {
    pub version: u64,
    /// Page bytes; `None` when the requestor already holds them
    pub data: Option<Vec<u8>>,
}

/// Result of a LOCATEPAGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLocation {
    pub owner: PeerId,
    /// Owner plus readers, sorted
    pub accessors: Vec<PeerId>,
}

#[derive(Debug)]
struct PageMeta {
    owner: PeerId,
    /// Grant that gave the owner its current access
    owner_since: u64,
    /// Payload of that grant, kept until the owner proves it applied it
    pending: Option<Vec<u8>>,
    readers: HashMap<PeerId, u64>,
    version: u64,
}

#[derive(Debug)]
struct ChunkState {
    participants: HashSet<PeerId>,
    destroyed: bool,
}

struct Chunk {
    id: ChunkId,
    size: u64,
    creator: PeerId,
    replica: Arc<Replica>,
    state: RwLock<ChunkState>,
    pages: Box<[Mutex<PageMeta>]>,
}

impl Chunk {
    fn page_index(&self, page: u64) -> Result<usize> {
        usize::try_from(page)
            .ok()
            .filter(|&p| p < self.pages.len())
            .ok_or(Error::Remote(ErrorKind::NoEntry))
    }
}

/// Page-ownership table and protocol handlers. Lives on the master only.
pub struct CoherenceEngine {
    local: PeerId,
    page_size: usize,
    apply_wait: Duration,
    chunks: DashMap<ChunkId, Arc<Chunk>>,
    peers: Arc<dyn PeerCaller>,
    metrics: Arc<NodeMetrics>,
}

impl CoherenceEngine {
    pub fn new(
        local: PeerId,
        page_size: usize,
        apply_wait: Duration,
        peers: Arc<dyn PeerCaller>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            local,
            page_size,
            apply_wait,
            chunks: DashMap::new(),
            peers,
            metrics,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    fn chunk(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>> {
        self.chunks
            .get(&chunk_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or(Error::Remote(ErrorKind::NoEntry))
    }

    // ========================================================================
    // ALLOCCHUNK / FREECHUNK
    // ========================================================================

    /// Create or join a chunk. Returns true if `requestor` owns every page.
    ///
    /// Joining with a different size fails with `BadAlloc` and leaves the
    /// chunk untouched. Repeating an alloc from a current participant is a
    /// no-op that returns the same answer.
    pub fn alloc_chunk(&self, chunk_id: ChunkId, size: u64, requestor: &PeerId) -> Result<bool> {
        if size == 0 {
            return Err(Error::Remote(ErrorKind::BadAlloc));
        }

        loop {
            let chunk = match self.chunks.entry(chunk_id) {
                Entry::Occupied(e) => Arc::clone(e.get()),
                Entry::Vacant(v) => {
                    let chunk = self.create_chunk(chunk_id, size, requestor)?;
                    log::info!(
                        "[dsm] chunk {} created by {} ({} bytes, {} pages)",
                        chunk_id,
                        requestor,
                        size,
                        chunk.pages.len()
                    );
                    v.insert(Arc::new(chunk));
                    return Ok(true);
                }
            };

            let mut state = chunk.state.write();
            if state.destroyed {
                // Destroyed between lookup and lock; start over.
                continue;
            }
            if chunk.size != size {
                log::warn!(
                    "[dsm] chunk {} alloc by {} with {} bytes, existing {} bytes",
                    chunk_id,
                    requestor,
                    size,
                    chunk.size
                );
                return Err(Error::Remote(ErrorKind::BadAlloc));
            }
            if state.participants.insert(requestor.clone()) {
                log::info!(
                    "[dsm] chunk {} joined by {} (refs={})",
                    chunk_id,
                    requestor,
                    state.participants.len()
                );
                return Ok(false);
            }
            return Ok(chunk.creator == *requestor);
        }
    }

    fn create_chunk(&self, chunk_id: ChunkId, size: u64, creator: &PeerId) -> Result<Chunk> {
        let page_count = pages_for(size, self.page_size);
        let replica = Replica::new(chunk_id, size, self.page_size, Protection::None)?;
        if *creator == self.local {
            replica.grant_all(INITIAL_GRANT, Protection::Write)?;
        }
        let pages = (0..page_count)
            .map(|_| {
                Mutex::new(PageMeta {
                    owner: creator.clone(),
                    owner_since: INITIAL_GRANT,
                    pending: None,
                    readers: HashMap::new(),
                    version: INITIAL_GRANT,
                })
            })
            .collect();
        Ok(Chunk {
            id: chunk_id,
            size,
            creator: creator.clone(),
            replica: Arc::new(replica),
            state: RwLock::new(ChunkState {
                participants: HashSet::from([creator.clone()]),
                destroyed: false,
            }),
            pages,
        })
    }

    /// Remove `requestor` from a chunk.
    ///
    /// Pages still owned by a departing remote peer are pulled back to the
    /// master first. Returns true if this was the last participant and the
    /// chunk was destroyed.
    pub fn free_chunk(&self, chunk_id: ChunkId, requestor: &PeerId) -> Result<bool> {
        let chunk = self.chunk(chunk_id)?;
        let mut state = chunk.state.write();
        if state.destroyed || !state.participants.contains(requestor) {
            return Err(Error::Remote(ErrorKind::NoEntry));
        }

        let remote = *requestor != self.local;
        let mut pulled = 0usize;
        for (idx, page) in chunk.pages.iter().enumerate() {
            let mut meta = page.lock();
            if let Some(since) = meta.readers.remove(requestor) {
                if !remote {
                    // Untracked from now on; a later rejoin must fault it in.
                    chunk
                        .replica
                        .invalidate(idx as u64, since, meta.version, self.apply_wait)?;
                }
            }
            if remote && meta.owner == *requestor {
                meta.version += 1;
                let version = meta.version;
                let bytes =
                    self.fetch(&chunk, idx as u64, requestor, meta.owner_since, version, false)?;
                chunk
                    .replica
                    .install(idx as u64, version, Some(&bytes), Protection::Read)?;
                meta.readers.remove(&self.local);
                meta.owner = self.local.clone();
                meta.owner_since = version;
                meta.pending = None;
                pulled += 1;
            }
        }

        state.participants.remove(requestor);
        let remaining = state.participants.len();
        log::info!(
            "[dsm] chunk {} freed by {} (refs={}, pages pulled back={})",
            chunk_id,
            requestor,
            remaining,
            pulled
        );

        if remaining == 0 {
            state.destroyed = true;
            self.chunks.remove(&chunk_id);
            log::info!("[dsm] chunk {} destroyed", chunk.id);
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // GETPAGE / LOCATEPAGE
    // ========================================================================

    /// Grant `requestor` access to a page.
    ///
    /// `applied` is the last grant the requestor installed for the page. A
    /// requestor whose copy is already current (the owner, or a reader, that
    /// applied its grant) gets no payload. WRITE invalidates every other
    /// reader first, then takes the bytes from the owner (which drops to
    /// NONE), so a failure leaves the owner's copy in place. READ takes the
    /// bytes from the owner (which drops to READ) and records the reader.
    pub fn get_page(
        &self,
        chunk_id: ChunkId,
        page: u64,
        flags: PageFlags,
        requestor: &PeerId,
        applied: u64,
    ) -> Result<PageGrant> {
        if !flags.has_access() {
            return Err(Error::Remote(ErrorKind::BadOperation));
        }
        let chunk = self.chunk(chunk_id)?;
        let idx = chunk.page_index(page)?;
        let state = chunk.state.read();
        if state.destroyed {
            return Err(Error::Remote(ErrorKind::NoEntry));
        }
        if !state.participants.contains(requestor) {
            log::warn!("[dsm] GETPAGE from non-participant {} on chunk {}", requestor, chunk_id);
            return Err(Error::Remote(ErrorKind::BadOperation));
        }

        let mut meta = chunk.pages[idx].lock();
        meta.version += 1;
        let version = meta.version;
        let write = flags.is_write();
        let is_owner = meta.owner == *requestor;
        let held_since = if is_owner {
            Some(meta.owner_since)
        } else {
            meta.readers.get(requestor).copied()
        };
        let current = held_since.is_some_and(|since| applied >= since);
        let owner = meta.owner.clone();

        if write {
            self.invalidate_readers(&chunk, page, &mut meta, requestor, version)?;
        }

        let data = if current {
            if write && !is_owner {
                self.invalidate_holder(&chunk, page, &owner, meta.owner_since, version)?;
            }
            None
        } else if is_owner {
            log::warn!(
                "[dsm] {} never applied grant v{} of chunk {} page {}, granting again",
                requestor,
                meta.owner_since,
                chunk_id,
                page
            );
            meta.pending.clone()
        } else {
            Some(self.fetch(&chunk, page, &owner, meta.owner_since, version, write)?)
        };

        if write || is_owner {
            if write && !is_owner {
                meta.owner = requestor.clone();
            }
            meta.owner_since = version;
            meta.pending = data.clone();
            meta.readers.remove(requestor);
        } else {
            if !current {
                // The owner served, so it holds the grant it was last given.
                meta.pending = None;
            }
            meta.readers.insert(requestor.clone(), version);
        }

        log::debug!(
            "[dsm] GETPAGE chunk {} page {} {:?} -> {} (v{}, payload={})",
            chunk_id,
            page,
            flags,
            requestor,
            version,
            data.is_some()
        );
        Ok(PageGrant { version, data })
    }

    /// Current owner and accessors of a page.
    pub fn locate_page(&self, chunk_id: ChunkId, page: u64) -> Result<PageLocation> {
        let chunk = self.chunk(chunk_id)?;
        let idx = chunk.page_index(page)?;
        let state = chunk.state.read();
        if state.destroyed {
            return Err(Error::Remote(ErrorKind::NoEntry));
        }
        let meta = chunk.pages[idx].lock();
        let mut accessors: Vec<PeerId> = meta.readers.keys().cloned().collect();
        accessors.push(meta.owner.clone());
        accessors.sort();
        accessors.dedup();
        Ok(PageLocation {
            owner: meta.owner.clone(),
            accessors,
        })
    }

    // ========================================================================
    // Peer round trips
    // ========================================================================

    /// Take a page's bytes from `owner`. A write fetch drops the owner to
    /// NONE; a read fetch leaves it READ.
    fn fetch(
        &self,
        chunk: &Chunk,
        page: u64,
        owner: &PeerId,
        after: u64,
        version: u64,
        write: bool,
    ) -> Result<Vec<u8>> {
        if *owner == self.local {
            let keep = if write { Protection::None } else { Protection::Read };
            return chunk.replica.serve(page, after, version, keep, self.apply_wait);
        }

        let request = Request::GetPage(GetPage {
            chunk_id: chunk.id,
            page,
            flags: if write { PageFlags::WRITE } else { PageFlags::READ },
            requestor: self.local.clone(),
            version,
            after,
        });
        match self.peers.call(owner, &request) {
            Ok(Reply::GetPage {
                data: Some(bytes), ..
            }) => {
                self.metrics.add_page_fetched(bytes.len());
                Ok(bytes)
            }
            Ok(Reply::GetPage { data: None, .. }) => Err(Error::Remote(ErrorKind::NoPage)),
            Ok(other) => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: other.msg_type(),
            }),
            Err(e) if e.is_transport() => {
                log::warn!(
                    "[dsm] fetch chunk {} page {} from {} failed: {}",
                    chunk.id,
                    page,
                    owner,
                    e
                );
                Err(Error::Remote(ErrorKind::NoPage))
            }
            Err(e) => Err(e),
        }
    }

    /// Invalidate every reader other than `requestor`.
    ///
    /// Readers that acknowledged are dropped from the page; on failure the
    /// rest stay recorded and the first error is returned.
    fn invalidate_readers(
        &self,
        chunk: &Chunk,
        page: u64,
        meta: &mut PageMeta,
        requestor: &PeerId,
        version: u64,
    ) -> Result<()> {
        let readers: Vec<(PeerId, u64)> = meta
            .readers
            .iter()
            .filter(|(peer, _)| *peer != requestor)
            .map(|(peer, since)| (peer.clone(), *since))
            .collect();
        let mut failure = None;
        for (reader, since) in readers {
            match self.invalidate_holder(chunk, page, &reader, since, version) {
                Ok(()) => {
                    meta.readers.remove(&reader);
                }
                Err(e) => {
                    log::warn!(
                        "[dsm] invalidate chunk {} page {} on {} failed: {}",
                        chunk.id,
                        page,
                        reader,
                        e
                    );
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn invalidate_holder(
        &self,
        chunk: &Chunk,
        page: u64,
        holder: &PeerId,
        after: u64,
        version: u64,
    ) -> Result<()> {
        self.metrics.inc_invalidations_sent();
        if *holder == self.local {
            return chunk.replica.invalidate(page, after, version, self.apply_wait);
        }
        let request = Request::InvalidatePage(Invalidate {
            chunk_id: chunk.id,
            page,
            flags: PageFlags::WRITE,
            version,
            after,
        });
        match self.peers.call(holder, &request)? {
            Reply::InvalidatePage { .. } => Ok(()),
            other => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: other.msg_type(),
            }),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Live chunk count.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of peers currently participating in a chunk.
    pub fn reference_count(&self, chunk_id: ChunkId) -> Option<usize> {
        let chunk = self.chunks.get(&chunk_id).map(|c| Arc::clone(c.value()))?;
        let state = chunk.state.read();
        (!state.destroyed).then(|| state.participants.len())
    }

    /// Sorted participants of a chunk.
    pub fn participants(&self, chunk_id: ChunkId) -> Option<Vec<PeerId>> {
        let chunk = self.chunks.get(&chunk_id).map(|c| Arc::clone(c.value()))?;
        let state = chunk.state.read();
        let mut peers: Vec<PeerId> = state.participants.iter().cloned().collect();
        peers.sort();
        Some(peers)
    }

    /// The master's backing replica of a chunk.
    pub fn replica(&self, chunk_id: ChunkId) -> Option<Arc<Replica>> {
        self.chunks
            .get(&chunk_id)
            .map(|c| Arc::clone(&c.value().replica))
    }
}

impl PageSource for CoherenceEngine {
    fn get_page(
        &self,
        chunk_id: ChunkId,
        page: u64,
        flags: PageFlags,
        applied: u64,
    ) -> Result<PageGrant> {
        CoherenceEngine::get_page(self, chunk_id, page, flags, &self.local, applied)
    }
}
