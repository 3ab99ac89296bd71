// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cluster barrier, counted on the master.
//!
//! The count starts at 1 for the master's own arrival. Each remote BARRIER
//! request adds one and blocks its connection worker until the round is
//! released, so the remote caller's reply doubles as its release signal.
//! The master's [`ClusterBarrier::wait`] blocks until all parties arrived,
//! then resets the count and starts a new generation.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct BarrierState {
    count: usize,
    generation: u64,
    cancelled: bool,
}

/// Counter-and-wait rendezvous for `parties` nodes.
#[derive(Debug)]
pub struct ClusterBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl ClusterBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                count: 1,
                generation: 0,
                cancelled: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Current round number.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Arrivals counted in the current round, including the master.
    pub fn arrived(&self) -> usize {
        self.state.lock().count
    }

    /// Count a remote arrival and block until its round is released.
    ///
    /// Returns false if the barrier was cancelled.
    pub fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        let generation = state.generation;
        state.count += 1;
        self.cond.notify_all();
        while state.generation == generation && !state.cancelled {
            self.cond.wait(&mut state);
        }
        state.generation != generation
    }

    /// Master side: wait for every party, then release the round.
    ///
    /// Returns false if the barrier was cancelled.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.count < self.parties && !state.cancelled {
            self.cond.wait(&mut state);
        }
        if state.cancelled {
            return false;
        }
        state.count = 1;
        state.generation += 1;
        self.cond.notify_all();
        true
    }

    /// Release every waiter for good. Used on shutdown.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_party_never_blocks() {
        let barrier = ClusterBarrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
        assert_eq!(barrier.generation(), 2);
    }

    #[test]
    fn test_master_waits_for_all_and_resets() {
        let barrier = Arc::new(ClusterBarrier::new(3));
        let released = Arc::new(AtomicUsize::new(0));

        for round in 1..=2u64 {
            let remotes: Vec<_> = (0..2)
                .map(|_| {
                    let barrier = barrier.clone();
                    let released = released.clone();
                    thread::spawn(move || {
                        assert!(barrier.arrive());
                        released.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(20));
            assert!(barrier.wait());
            for r in remotes {
                r.join().expect("remote");
            }
            assert_eq!(barrier.generation(), round);
            assert_eq!(barrier.arrived(), 1);
        }
        assert_eq!(released.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_remote_blocks_until_master_arrives() {
        let barrier = Arc::new(ClusterBarrier::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        let remote = {
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                barrier.arrive();
                done.store(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.arrived(), 2);

        assert!(barrier.wait());
        remote.join().expect("remote");
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_releases_waiters() {
        let barrier = Arc::new(ClusterBarrier::new(3));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.arrive())
        };
        thread::sleep(Duration::from_millis(20));
        barrier.cancel();
        assert!(!waiter.join().expect("waiter"));
        assert!(!barrier.wait());
    }
}
