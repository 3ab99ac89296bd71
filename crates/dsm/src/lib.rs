// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DSM - page-based distributed shared memory
//!
//! A cluster of nodes shares chunks of memory at page granularity. Each node
//! maps its own replica of a chunk; plain loads and stores on it stay
//! coherent cluster-wide because page access is managed with `mprotect` and
//! missing or read-only pages are faulted in from the current owner.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dsm::{ClusterConfig, Node, PeerId, Result};
//!
//! fn main() -> Result<()> {
//!     let cluster = ClusterConfig::load("cluster.conf")?
//!         .with_local(&PeerId::new("10.0.0.1", 8000))?;
//!     let node = Node::builder(cluster).start()?;
//!
//!     let chunk = node.alloc(7, 4096)?;
//!     chunk.store_u64(0, 1)?;
//!     node.barrier()?;
//!
//!     node.free(chunk)?;
//!     node.close()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |  Application: ChunkHandle loads/stores, Node::alloc/free/barrier  |
//! +-------------------------------------------------------------------+
//! |  Fault trap (SIGSEGV) -> FaultMailbox -> fault service thread     |
//! +-------------------------------------------------------------------+
//! |  Coherence engine (master only): owner/readers per page           |
//! +-------------------------------------------------------------------+
//! |  Protocol + transport: framed TCP request/reply, one server/node  |
//! +-------------------------------------------------------------------+
//! |  Replica: shared-memory pages with a sys view and an app view     |
//! +-------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | One cluster member; allocates chunks and runs the barrier |
//! | [`ChunkHandle`] | A mapped chunk; all access is coherent |
//! | [`ClusterConfig`] | Static membership: peers, master, local node |
//! | [`NodeConfig`] | Timeouts and retry policy |
//! | [`CoherenceEngine`] | The master's page-ownership table |
//!
//! ## Coherence model
//!
//! Single writer, multiple readers per page. A page is owned by exactly one
//! node at a time; readers hold read-only copies until the next write, which
//! invalidates them. All coherence decisions are made by the master.

pub mod barrier;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fault;
mod futex;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod region;
pub mod replica;
pub mod transport;
pub mod trap;

pub use config::{page_size, ClusterConfig, NodeConfig};
pub use engine::{CoherenceEngine, PageGrant, PageLocation};
pub use error::{Error, ErrorKind, Result};
pub use metrics::{MetricsSnapshot, NodeMetrics};
pub use node::{ChunkHandle, Node, NodeBuilder};
pub use peer::PeerId;
pub use protocol::{ChunkId, MsgType, PageFlags, Reply, Request};
pub use region::Protection;
pub use transport::RequestServer;
