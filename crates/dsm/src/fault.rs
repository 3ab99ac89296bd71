// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fault resolution.
//!
//! The signal handler cannot take locks, allocate or do network I/O, so it
//! only posts the fault to a [`FaultMailbox`] and sleeps on a futex. The
//! node's fault service thread picks the fault up, asks the master for the
//! page, installs it and wakes the faulting thread, which then retries the
//! access.
//!
//! ```text
//!   app thread (in handler)          dsm-fault thread
//!   ----------------------           ----------------
//!   gate 0->1
//!   fields, state=POSTED  ------->   take()
//!   futex_wait(state)                classify, GETPAGE, install
//!                         <-------   state=DONE|FAILED
//!   state=IDLE, gate=0
//! ```

use crate::config::NodeConfig;
use crate::directory::{Link, PeerDirectory};
use crate::dispatch::ReplicaTable;
use crate::engine::PageGrant;
use crate::error::{Error, Result};
use crate::futex::{futex_wait, futex_wake_all, futex_wake_one};
use crate::metrics::NodeMetrics;
use crate::protocol::{ChunkId, GetPage, PageFlags, Reply, Request};
use crate::region::Protection;
use crate::replica::Replica;
use crate::transport::ReplyWait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE: u32 = 0;
const POSTED: u32 = 1;
const DONE: u32 = 2;
const FAILED: u32 = 3;

/// How long the service sleeps before re-checking its running flag.
const SERVICE_POLL: Duration = Duration::from_millis(100);

/// What the faulting instruction was doing, when the platform tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultAccess {
    Unknown = 0,
    Read = 1,
    Write = 2,
}

impl FaultAccess {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Read,
            2 => Self::Write,
            _ => Self::Unknown,
        }
    }
}

/// A fault handed from the trap to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFault {
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub access: FaultAccess,
}

/// One-slot handoff between faulting threads and the fault service.
///
/// Only atomics and futex syscalls are used on the posting side.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FaultMailbox {
    gate: AtomicU32,
    state: AtomicU32,
    chunk_id: AtomicU64,
    offset: AtomicU64,
    access: AtomicU32,
}

impl FaultMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a fault and block until it is resolved. Returns false if the
    /// service gave up on it.
    pub fn post_and_wait(&self, chunk_id: ChunkId, offset: u64, access: FaultAccess) -> bool {
        while self
            .gate
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            futex_wait(&self.gate, 1, None);
        }

        self.chunk_id.store(chunk_id, Ordering::Relaxed);
        self.offset.store(offset, Ordering::Relaxed);
        self.access.store(access as u32, Ordering::Relaxed);
        self.state.store(POSTED, Ordering::Release);
        futex_wake_all(&self.state);

        let outcome = loop {
            let state = self.state.load(Ordering::Acquire);
            if state == DONE || state == FAILED {
                break state;
            }
            futex_wait(&self.state, state, None);
        };

        self.state.store(IDLE, Ordering::Release);
        self.gate.store(0, Ordering::Release);
        futex_wake_one(&self.gate);
        outcome == DONE
    }

    /// Wait up to `timeout` for a posted fault.
    pub fn take(&self, timeout: Duration) -> Option<PendingFault> {
        let state = self.state.load(Ordering::Acquire);
        if state != POSTED {
            futex_wait(&self.state, state, Some(timeout));
            if self.state.load(Ordering::Acquire) != POSTED {
                return None;
            }
        }
        Some(PendingFault {
            chunk_id: self.chunk_id.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            access: FaultAccess::from_u32(self.access.load(Ordering::Relaxed)),
        })
    }

    /// Release the posted fault.
    pub fn complete(&self, resolved: bool) {
        let state = if resolved { DONE } else { FAILED };
        self.state.store(state, Ordering::Release);
        futex_wake_all(&self.state);
    }
}

/// Where fault grants come from: the local engine on the master, a GETPAGE
/// round trip to the master everywhere else.
///
/// `applied` is the last grant this node installed for the page, so the
/// master can tell a lost grant from a current copy.
pub trait PageSource: Send + Sync {
    fn get_page(
        &self,
        chunk_id: ChunkId,
        page: u64,
        flags: PageFlags,
        applied: u64,
    ) -> Result<PageGrant>;
}

/// GETPAGE over the paging link to the master.
pub struct MasterLink {
    directory: Arc<PeerDirectory>,
    reply_timeout: Duration,
}

impl MasterLink {
    pub fn new(directory: Arc<PeerDirectory>, config: &NodeConfig) -> Self {
        let reply_timeout = config.page_reply_timeout(directory.len());
        Self {
            directory,
            reply_timeout,
        }
    }
}

impl PageSource for MasterLink {
    fn get_page(
        &self,
        chunk_id: ChunkId,
        page: u64,
        flags: PageFlags,
        applied: u64,
    ) -> Result<PageGrant> {
        let request = Request::GetPage(GetPage {
            chunk_id,
            page,
            flags,
            requestor: self.directory.local_id().clone(),
            version: 0,
            after: applied,
        });
        let master = self.directory.master_id();
        match self.directory.call_on(
            master,
            Link::Paging,
            &request,
            ReplyWait::Within(self.reply_timeout),
        )?
        {
            Reply::GetPage { version, data } => Ok(PageGrant { version, data }),
            other => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: other.msg_type(),
            }),
        }
    }
}

/// Flags to request for a fault, or `None` if the page already allows the
/// access (another thread resolved it first).
pub fn classify(current: Protection, access: FaultAccess) -> Option<PageFlags> {
    match (current, access) {
        (Protection::Write, _) | (Protection::Read, FaultAccess::Read) => None,
        (Protection::Read, _) => Some(PageFlags::WRITE | PageFlags::NOUPDATE),
        (Protection::None, FaultAccess::Write) => Some(PageFlags::WRITE),
        (Protection::None, _) => Some(PageFlags::READ),
    }
}

struct FaultWorker {
    mailbox: Arc<FaultMailbox>,
    replicas: Arc<ReplicaTable>,
    source: Arc<dyn PageSource>,
    metrics: Arc<NodeMetrics>,
    running: Arc<AtomicBool>,
    retry_limit: u32,
    retry_delay: Duration,
}

impl FaultWorker {
    fn run(self) {
        log::debug!("[dsm] fault service started");
        while self.running.load(Ordering::Acquire) {
            if let Some(fault) = self.mailbox.take(SERVICE_POLL) {
                let resolved = self.resolve(&fault);
                self.mailbox.complete(resolved);
            }
        }
        log::debug!("[dsm] fault service stopped");
    }

    fn resolve(&self, fault: &PendingFault) -> bool {
        let replica = match self.replicas.get(&fault.chunk_id) {
            Some(r) => Arc::clone(r.value()),
            None => {
                log::error!("[dsm] fault on unmapped chunk {}", fault.chunk_id);
                return false;
            }
        };
        let page = fault.offset / replica.page_size() as u64;
        if page as usize >= replica.page_count() {
            log::error!(
                "[dsm] fault at offset {} beyond chunk {}",
                fault.offset,
                fault.chunk_id
            );
            return false;
        }

        let Some(flags) = classify(replica.protection(page as usize), fault.access) else {
            self.metrics.inc_spurious_faults();
            return true;
        };

        for attempt in 1..=self.retry_limit {
            match self.fetch(&replica, page, flags) {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!(
                        "[dsm] fault chunk {} page {} {:?} attempt {}/{}: {}",
                        fault.chunk_id,
                        page,
                        flags,
                        attempt,
                        self.retry_limit,
                        e
                    );
                    if attempt < self.retry_limit {
                        thread::sleep(self.retry_delay * attempt);
                    }
                }
            }
        }
        log::error!(
            "[dsm] giving up on fault chunk {} page {}",
            fault.chunk_id,
            page
        );
        false
    }

    fn fetch(&self, replica: &Replica, page: u64, flags: PageFlags) -> Result<()> {
        let applied = replica.applied_version(page as usize);
        let grant = self.source.get_page(replica.chunk_id(), page, flags, applied)?;
        let prot = if flags.is_write() {
            Protection::Write
        } else {
            Protection::Read
        };
        if let Some(bytes) = &grant.data {
            self.metrics.add_page_fetched(bytes.len());
        }
        if !replica.install(page, grant.version, grant.data.as_deref(), prot)? {
            // Superseded while in flight; the access faults again.
            log::debug!(
                "[dsm] stale grant v{} for chunk {} page {}",
                grant.version,
                replica.chunk_id(),
                page
            );
        }

        if flags.skip_payload() {
            self.metrics.inc_upgrade_faults();
        } else if flags.is_write() {
            self.metrics.inc_write_faults();
        } else {
            self.metrics.inc_read_faults();
        }
        Ok(())
    }
}

/// The node's fault service thread.
pub struct FaultService {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FaultService {
    pub fn spawn(
        mailbox: Arc<FaultMailbox>,
        replicas: Arc<ReplicaTable>,
        source: Arc<dyn PageSource>,
        metrics: Arc<NodeMetrics>,
        config: &NodeConfig,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let worker = FaultWorker {
            mailbox,
            replicas,
            source,
            metrics,
            running: running.clone(),
            retry_limit: config.fault_retry_limit.max(1),
            retry_delay: config.retry_delay,
        };
        let thread = thread::Builder::new()
            .name("dsm-fault".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop and join the service thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[dsm] fault service panicked");
            }
        }
    }
}

impl Drop for FaultService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::page_size;
    use crate::error::ErrorKind;
    use crate::trap;
    use parking_lot::Mutex;

    struct ScriptedSource {
        answers: Mutex<Vec<Result<PageGrant>>>,
        asked: Mutex<Vec<PageFlags>>,
        applied: Mutex<Vec<u64>>,
    }

    impl ScriptedSource {
        fn new(answers: Vec<Result<PageGrant>>) -> Self {
            Self {
                answers: Mutex::new(answers),
                asked: Mutex::new(Vec::new()),
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageSource for ScriptedSource {
        fn get_page(
            &self,
            _chunk_id: ChunkId,
            _page: u64,
            flags: PageFlags,
            applied: u64,
        ) -> Result<PageGrant> {
            self.asked.lock().push(flags);
            self.applied.lock().push(applied);
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                return Err(Error::Remote(ErrorKind::NoPage));
            }
            answers.remove(0)
        }
    }

    fn fast_config() -> NodeConfig {
        NodeConfig::default()
            .with_fault_retry_limit(3)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn setup(
        chunk_id: ChunkId,
        source: Arc<ScriptedSource>,
    ) -> (Arc<FaultMailbox>, Arc<Replica>, FaultService, Arc<NodeMetrics>) {
        let ps = page_size();
        let replica =
            Arc::new(Replica::new(chunk_id, ps as u64, ps, Protection::None).expect("map"));
        let replicas = Arc::new(ReplicaTable::new());
        replicas.insert(chunk_id, replica.clone());
        let mailbox = Arc::new(FaultMailbox::new());
        let metrics = Arc::new(NodeMetrics::new());
        let service = FaultService::spawn(
            mailbox.clone(),
            replicas,
            source,
            metrics.clone(),
            &fast_config(),
        )
        .expect("spawn");
        (mailbox, replica, service, metrics)
    }

    #[test]
    fn test_classify() {
        use FaultAccess::*;
        assert_eq!(classify(Protection::Write, Write), None);
        assert_eq!(classify(Protection::Read, Read), None);
        assert_eq!(
            classify(Protection::Read, Write),
            Some(PageFlags::WRITE | PageFlags::NOUPDATE)
        );
        assert_eq!(
            classify(Protection::Read, Unknown),
            Some(PageFlags::WRITE | PageFlags::NOUPDATE)
        );
        assert_eq!(classify(Protection::None, Write), Some(PageFlags::WRITE));
        assert_eq!(classify(Protection::None, Read), Some(PageFlags::READ));
        assert_eq!(classify(Protection::None, Unknown), Some(PageFlags::READ));
    }

    #[test]
    fn test_posted_fault_is_resolved() {
        let ps = page_size();
        let source = Arc::new(ScriptedSource::new(vec![Ok(PageGrant {
            version: 2,
            data: Some(vec![0x42; ps]),
        })]));
        let (mailbox, replica, mut service, metrics) = setup(11, source.clone());

        assert!(mailbox.post_and_wait(11, 10, FaultAccess::Read));
        assert_eq!(replica.protection(0), Protection::Read);
        assert_eq!(replica.read_page(0), vec![0x42; ps]);
        assert_eq!(*source.asked.lock(), vec![PageFlags::READ]);

        // Already readable: nothing to ask for.
        assert!(mailbox.post_and_wait(11, 10, FaultAccess::Read));
        assert_eq!(source.asked.lock().len(), 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.read_faults, 1);
        assert_eq!(snap.spurious_faults, 1);
        assert_eq!(snap.bytes_fetched, ps as u64);
        service.stop();
        assert!(!service.is_running());
    }

    #[test]
    fn test_retries_then_fails() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (mailbox, replica, _service, _metrics) = setup(12, source.clone());

        assert!(!mailbox.post_and_wait(12, 0, FaultAccess::Write));
        assert_eq!(source.asked.lock().len(), 3);
        assert_eq!(replica.protection(0), Protection::None);

        assert!(!mailbox.post_and_wait(99, 0, FaultAccess::Write));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(Error::Timeout),
            Ok(PageGrant {
                version: 3,
                data: Some(vec![1; page_size()]),
            }),
        ]));
        let (mailbox, replica, _service, metrics) = setup(13, source);
        assert!(mailbox.post_and_wait(13, 0, FaultAccess::Write));
        assert_eq!(replica.protection(0), Protection::Write);
        assert_eq!(metrics.snapshot().write_faults, 1);
    }

    #[test]
    fn test_access_through_trap() {
        let ps = page_size();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(PageGrant {
                version: 2,
                data: Some(vec![0x77; ps]),
            }),
            Ok(PageGrant {
                version: 3,
                data: None,
            }),
        ]));
        let (mailbox, replica, _service, _metrics) = setup(14, source.clone());
        trap::install().expect("trap");
        let _registration =
            trap::register(replica.app_ptr(), replica.mapped_len(), 14, &mailbox).expect("register");

        let base = replica.app_ptr();
        // SAFETY: base points at a mapped page; the trap resolves access.
        let value = unsafe { std::ptr::read_volatile(base.add(5)) };
        assert_eq!(value, 0x77);
        // SAFETY: as above; the write faults once more for the upgrade.
        unsafe { std::ptr::write_volatile(base.add(5), 0x78) };
        assert_eq!(replica.protection(0), Protection::Write);
        assert_eq!(replica.read_page(0)[5], 0x78);

        let asked = source.asked.lock().clone();
        assert_eq!(asked[0], PageFlags::READ);
        assert_eq!(asked[1], PageFlags::WRITE | PageFlags::NOUPDATE);
        assert_eq!(*source.applied.lock(), vec![0, 2]);
    }
}
