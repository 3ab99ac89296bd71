// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A node's local copy of one chunk.
//!
//! Every page carries a cached [`Protection`] and the version of the last
//! master grant applied to it. Grants are versioned by the master; a grant
//! is installed only if it is newer than what the page already applied, and
//! a peer asked to serve or invalidate a page first waits until it has
//! applied the grant the master based that request on.

use crate::config::pages_for;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::ChunkId;
use crate::region::{PageRegion, Protection};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

struct PageSlot {
    prot: AtomicU8,
    applied: Mutex<u64>,
    cond: Condvar,
}

/// Local replica of a chunk.
pub struct Replica {
    chunk_id: ChunkId,
    size: u64,
    region: PageRegion,
    pages: Box<[PageSlot]>,
}

impl Replica {
    /// Map a replica of `size` bytes with every page at `initial`.
    pub fn new(chunk_id: ChunkId, size: u64, page_size: usize, initial: Protection) -> Result<Self> {
        let page_count = pages_for(size, page_size);
        let region = PageRegion::create(page_count, page_size, initial)?;
        let pages = (0..page_count)
            .map(|_| PageSlot {
                prot: AtomicU8::new(initial as u8),
                applied: Mutex::new(0),
                cond: Condvar::new(),
            })
            .collect();
        Ok(Self {
            chunk_id,
            size,
            region,
            pages,
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    /// Mapped length: whole pages, so at least `size`.
    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }

    /// Base of the faulting app view.
    pub fn app_ptr(&self) -> *mut u8 {
        self.region.app_ptr()
    }

    /// Cached local protection of a page.
    pub fn protection(&self, page: usize) -> Protection {
        Protection::from_u8(self.slot(page).prot.load(Ordering::Acquire))
    }

    /// Version of the last grant applied to a page.
    pub fn applied_version(&self, page: usize) -> u64 {
        *self.slot(page).applied.lock()
    }

    /// Copy a page out without touching its protection.
    pub fn read_page(&self, page: usize) -> Vec<u8> {
        self.region.read_page(page)
    }

    fn slot(&self, page: usize) -> &PageSlot {
        &self.pages[page]
    }

    fn set_protection(&self, page: usize, prot: Protection) -> Result<()> {
        let slot = self.slot(page);
        if Protection::from_u8(slot.prot.load(Ordering::Acquire)) != prot {
            self.region.protect(page, prot)?;
            slot.prot.store(prot as u8, Ordering::Release);
        }
        Ok(())
    }

    fn check_page(&self, page: u64) -> Result<usize> {
        usize::try_from(page)
            .ok()
            .filter(|&p| p < self.pages.len())
            .ok_or(Error::Remote(ErrorKind::NoEntry))
    }

    /// Apply a grant: copy `data` (if any) and set the page to `prot`.
    ///
    /// Returns false and changes nothing when the page already applied a
    /// grant at least as new.
    pub fn install(&self, page: u64, version: u64, data: Option<&[u8]>, prot: Protection) -> Result<bool> {
        let page = self.check_page(page)?;
        let slot = self.slot(page);
        let mut applied = slot.applied.lock();
        if version <= *applied {
            return Ok(false);
        }
        if let Some(bytes) = data {
            // Readers in the app view must not see a half-copied page.
            self.set_protection(page, Protection::None)?;
            self.region.write_page(page, bytes);
        }
        self.set_protection(page, prot)?;
        *applied = version;
        slot.cond.notify_all();
        Ok(true)
    }

    /// Apply an initial grant to every page.
    pub fn grant_all(&self, version: u64, prot: Protection) -> Result<()> {
        for page in 0..self.pages.len() {
            self.install(page as u64, version, None, prot)?;
        }
        Ok(())
    }

    fn wait_applied<'a>(
        &self,
        slot: &'a PageSlot,
        after: u64,
        timeout: Duration,
    ) -> Result<parking_lot::MutexGuard<'a, u64>> {
        let deadline = Instant::now() + timeout;
        let mut applied = slot.applied.lock();
        while *applied < after {
            if slot.cond.wait_until(&mut applied, deadline).timed_out() && *applied < after {
                return Err(Error::Timeout);
            }
        }
        Ok(applied)
    }

    /// Hand the page to the master: downgrade to `keep`, then copy it out.
    ///
    /// Waits up to `timeout` for grant `after` to be applied first.
    pub fn serve(
        &self,
        page: u64,
        after: u64,
        version: u64,
        keep: Protection,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let page = self.check_page(page)?;
        let slot = self.slot(page);
        let mut applied = self.wait_applied(slot, after, timeout)?;
        if self.protection(page) > keep {
            self.set_protection(page, keep)?;
        }
        let bytes = self.region.read_page(page);
        *applied = (*applied).max(version);
        slot.cond.notify_all();
        Ok(bytes)
    }

    /// Drop local access to a page.
    pub fn invalidate(&self, page: u64, after: u64, version: u64, timeout: Duration) -> Result<()> {
        let page = self.check_page(page)?;
        let slot = self.slot(page);
        let mut applied = self.wait_applied(slot, after, timeout)?;
        self.set_protection(page, Protection::None)?;
        *applied = (*applied).max(version);
        slot.cond.notify_all();
        Ok(())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("chunk_id", &self.chunk_id)
            .field("size", &self.size)
            .field("pages", &self.pages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::page_size;
    use std::sync::Arc;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_partial_page_rounds_up() {
        let ps = page_size();
        let replica = Replica::new(1, 2 * ps as u64 + 1, ps, Protection::None).expect("map");
        assert_eq!(replica.page_count(), 3);
        assert_eq!(replica.mapped_len(), 3 * ps);
        assert_eq!(replica.size(), 2 * ps as u64 + 1);
    }

    #[test]
    fn test_install_rejects_stale_grants() {
        let ps = page_size();
        let replica = Replica::new(1, ps as u64, ps, Protection::None).expect("map");
        let page = vec![0x5A; ps];

        assert!(replica.install(0, 2, Some(&page), Protection::Read).expect("install"));
        assert_eq!(replica.protection(0), Protection::Read);
        assert_eq!(replica.read_page(0), page);

        assert!(!replica.install(0, 1, None, Protection::Write).expect("stale"));
        assert_eq!(replica.protection(0), Protection::Read);
        assert_eq!(replica.applied_version(0), 2);
    }

    #[test]
    fn test_serve_downgrades_before_copy() {
        let ps = page_size();
        let replica = Replica::new(1, ps as u64, ps, Protection::None).expect("map");
        replica.grant_all(1, Protection::Write).expect("grant");
        assert_eq!(replica.protection(0), Protection::Write);

        let bytes = replica.serve(0, 1, 5, Protection::Read, WAIT).expect("serve");
        assert_eq!(bytes.len(), ps);
        assert_eq!(replica.protection(0), Protection::Read);
        assert_eq!(replica.applied_version(0), 5);

        replica.serve(0, 1, 6, Protection::None, WAIT).expect("serve");
        assert_eq!(replica.protection(0), Protection::None);
    }

    #[test]
    fn test_serve_waits_for_inflight_grant() {
        let ps = page_size();
        let replica = Arc::new(Replica::new(1, ps as u64, ps, Protection::None).expect("map"));

        let server = {
            let replica = replica.clone();
            thread::spawn(move || replica.serve(0, 3, 4, Protection::None, WAIT))
        };
        thread::sleep(Duration::from_millis(20));
        let page = vec![7u8; ps];
        replica.install(0, 3, Some(&page), Protection::Write).expect("install");

        let served = server.join().expect("thread").expect("served");
        assert_eq!(served, page);
        assert_eq!(replica.protection(0), Protection::None);
    }

    #[test]
    fn test_invalidate_times_out_without_grant() {
        let ps = page_size();
        let replica = Replica::new(1, ps as u64, ps, Protection::None).expect("map");
        let err = replica
            .invalidate(0, 1, 2, Duration::from_millis(20))
            .expect_err("grant never arrives");
        assert!(matches!(err, Error::Timeout));

        replica.invalidate(0, 0, 2, WAIT).expect("nothing to wait for");
        assert_eq!(replica.applied_version(0), 2);
        assert!(!replica.install(0, 2, None, Protection::Read).expect("stale"));
    }

    #[test]
    fn test_out_of_range_page() {
        let ps = page_size();
        let replica = Replica::new(1, ps as u64, ps, Protection::None).expect("map");
        assert!(matches!(
            replica.invalidate(1, 0, 1, WAIT),
            Err(Error::Remote(ErrorKind::NoEntry))
        ));
    }
}
