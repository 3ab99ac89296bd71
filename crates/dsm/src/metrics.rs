// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node statistics.
///
/// All counters use relaxed ordering; they are observational only.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    upgrade_faults: AtomicU64,
    spurious_faults: AtomicU64,
    pages_fetched: AtomicU64,
    bytes_fetched: AtomicU64,
    invalidations_sent: AtomicU64,
    invalidations_received: AtomicU64,
    requests_served: AtomicU64,
    request_errors: AtomicU64,
    barriers: AtomicU64,
}

/// Point-in-time copy of [`NodeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub read_faults: u64,
    pub write_faults: u64,
    pub upgrade_faults: u64,
    pub spurious_faults: u64,
    pub pages_fetched: u64,
    pub bytes_fetched: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
    pub requests_served: u64,
    pub request_errors: u64,
    pub barriers: u64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_read_faults(&self) {
        self.read_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_write_faults(&self) {
        self.write_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_upgrade_faults(&self) {
        self.upgrade_faults.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_spurious_faults(&self) {
        self.spurious_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a page payload received from another node.
    #[inline]
    pub fn add_page_fetched(&self, bytes: usize) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_invalidations_sent(&self) {
        self.invalidations_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_invalidations_received(&self) {
        self.invalidations_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_requests_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_request_errors(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_barriers(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_faults: self.read_faults.load(Ordering::Relaxed),
            write_faults: self.write_faults.load(Ordering::Relaxed),
            upgrade_faults: self.upgrade_faults.load(Ordering::Relaxed),
            spurious_faults: self.spurious_faults.load(Ordering::Relaxed),
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            invalidations_sent: self.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: self.invalidations_received.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.read_faults,
            &self.write_faults,
            &self.upgrade_faults,
            &self.spurious_faults,
            &self.pages_fetched,
            &self.bytes_fetched,
            &self.invalidations_sent,
            &self.invalidations_received,
            &self.requests_served,
            &self.request_errors,
            &self.barriers,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Faults that required a round trip to the master.
    pub fn faults_resolved(&self) -> u64 {
        self.read_faults + self.write_faults + self.upgrade_faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let m = NodeMetrics::new();
        m.inc_read_faults();
        m.inc_upgrade_faults();
        m.add_page_fetched(4096);
        m.add_page_fetched(4096);
        m.inc_barriers();

        let s = m.snapshot();
        assert_eq!(s.read_faults, 1);
        assert_eq!(s.faults_resolved(), 2);
        assert_eq!(s.pages_fetched, 2);
        assert_eq!(s.bytes_fetched, 8192);
        assert_eq!(s.barriers, 1);

        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
