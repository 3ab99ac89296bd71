// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routes inbound requests to the engine, the barrier and local replicas.
//!
//! | Request        | Master                  | Other nodes                  |
//! |----------------|-------------------------|------------------------------|
//! | ALLOCCHUNK     | engine                  | BadOperation                 |
//! | FREECHUNK      | engine                  | BadOperation                 |
//! | GETPAGE        | engine (fault)          | serve local copy (fetch)     |
//! | LOCATEPAGE     | engine                  | BadOperation                 |
//! | INVALIDATEPAGE | BadOperation            | drop local access            |
//! | BARRIER        | count and block         | ack                          |
//! | NOOP           | ack                     | ack                          |

use crate::barrier::ClusterBarrier;
use crate::engine::CoherenceEngine;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::NodeMetrics;
use crate::protocol::{ChunkId, GetPage, Invalidate, Reply, Request};
use crate::region::Protection;
use crate::replica::Replica;
use crate::transport::RequestHandler;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A node's mapped replicas by chunk.
pub type ReplicaTable = DashMap<ChunkId, Arc<Replica>>;

/// Answer a master fetch from the local copy.
pub fn serve_fetch(replicas: &ReplicaTable, req: &GetPage, wait: Duration) -> Result<Reply> {
    let replica = replicas
        .get(&req.chunk_id)
        .map(|r| Arc::clone(r.value()))
        .ok_or(Error::Remote(ErrorKind::NoEntry))?;
    let keep = if req.flags.is_write() {
        Protection::None
    } else {
        Protection::Read
    };
    let data = replica.serve(req.page, req.after, req.version, keep, wait)?;
    Ok(Reply::GetPage {
        version: req.version,
        data: Some(data),
    })
}

/// Drop local access to a page. Unknown chunks are acknowledged: there is
/// nothing left to invalidate.
pub fn serve_invalidate(replicas: &ReplicaTable, req: &Invalidate, wait: Duration) -> Result<Reply> {
    let replica = replicas.get(&req.chunk_id).map(|r| Arc::clone(r.value()));
    if let Some(replica) = replica {
        replica.invalidate(req.page, req.after, req.version, wait)?;
    }
    Ok(Reply::InvalidatePage {
        chunk_id: req.chunk_id,
        page: req.page,
    })
}

/// The node's [`RequestHandler`].
pub struct Dispatcher {
    engine: Option<Arc<CoherenceEngine>>,
    replicas: Arc<ReplicaTable>,
    barrier: Arc<ClusterBarrier>,
    metrics: Arc<NodeMetrics>,
    apply_wait: Duration,
}

impl Dispatcher {
    /// `engine` is set on the master only.
    pub fn new(
        engine: Option<Arc<CoherenceEngine>>,
        replicas: Arc<ReplicaTable>,
        barrier: Arc<ClusterBarrier>,
        metrics: Arc<NodeMetrics>,
        apply_wait: Duration,
    ) -> Self {
        Self {
            engine,
            replicas,
            barrier,
            metrics,
            apply_wait,
        }
    }

    fn dispatch(&self, request: Request) -> Result<Reply> {
        match (&self.engine, request) {
            (_, Request::Noop) => Ok(Reply::Noop),
            (_, Request::Terminate { .. }) => Ok(Reply::Terminate),

            (Some(engine), Request::AllocChunk { chunk_id, size, requestor }) => {
                let is_owner = engine.alloc_chunk(chunk_id, size, &requestor)?;
                Ok(Reply::AllocChunk { is_owner })
            }
            (Some(engine), Request::FreeChunk { chunk_id, requestor }) => {
                engine.free_chunk(chunk_id, &requestor)?;
                Ok(Reply::FreeChunk { chunk_id })
            }
            (Some(engine), Request::GetPage(req)) => {
                let grant =
                    engine.get_page(req.chunk_id, req.page, req.flags, &req.requestor, req.after)?;
                Ok(Reply::GetPage {
                    version: grant.version,
                    data: grant.data,
                })
            }
            (Some(engine), Request::LocatePage { chunk_id, page }) => {
                let location = engine.locate_page(chunk_id, page)?;
                Ok(Reply::LocatePage {
                    owner: location.owner,
                    accessors: location.accessors,
                })
            }
            (Some(_), Request::Barrier) => {
                if !self.barrier.arrive() {
                    return Err(Error::Closed);
                }
                Ok(Reply::Barrier)
            }

            (None, Request::GetPage(req)) => serve_fetch(&self.replicas, &req, self.apply_wait),
            (None, Request::InvalidatePage(req)) => {
                self.metrics.inc_invalidations_received();
                serve_invalidate(&self.replicas, &req, self.apply_wait)
            }
            (None, Request::Barrier) => Ok(Reply::Barrier),

            (_, request) => {
                log::warn!(
                    "[dsm] {} not valid on this node ({})",
                    request.msg_type(),
                    if self.engine.is_some() { "master" } else { "worker" }
                );
                Err(Error::Remote(ErrorKind::BadOperation))
            }
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&self, request: Request) -> Reply {
        self.metrics.inc_requests_served();
        let kind = request.msg_type();
        match self.dispatch(request) {
            Ok(reply) => reply,
            Err(e) => {
                self.metrics.inc_request_errors();
                log::debug!("[dsm] {} failed: {}", kind, e);
                Reply::Error(e.kind())
            }
        }
    }
}
