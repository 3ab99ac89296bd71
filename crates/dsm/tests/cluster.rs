// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::cast_sign_loss)] // Test data conversions
#![allow(clippy::cast_lossless)] // Test simplicity
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure
#![allow(clippy::items_after_statements)] // Test helpers
#![allow(clippy::too_many_lines)] // Example/test code
#![allow(clippy::similar_names)] // Test variable naming
#![allow(clippy::needless_pass_by_value)] // Test functions

//! Multi-node clusters in one process over loopback TCP.
//!
//! Every node gets a pre-bound ephemeral listener, so tests can run in
//! parallel. Node 0 is always the master.

use dsm::{
    ClusterConfig, Error, ErrorKind, Node, NodeConfig, PeerId, Protection, RequestServer,
};
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpListener;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

fn fast_config() -> NodeConfig {
    NodeConfig::default()
        .with_close_poll_interval(Duration::from_millis(20))
        .with_retry_delay(Duration::from_millis(10))
}

fn bind_loopback(n: usize) -> Vec<TcpListener> {
    (0..n)
        .map(|_| RequestServer::bind("127.0.0.1:0".parse().expect("addr")).expect("bind"))
        .collect()
}

fn start_nodes(cluster: ClusterConfig, listeners: Vec<TcpListener>) -> Vec<Node> {
    listeners
        .into_iter()
        .enumerate()
        .map(|(i, listener)| {
            Node::builder(cluster.clone().with_local_index(i).expect("local"))
                .config(fast_config())
                .listener(listener)
                .start()
                .expect("start node")
        })
        .collect()
}

fn start_cluster(n: usize) -> Vec<Node> {
    let listeners = bind_loopback(n);
    let peers = listeners
        .iter()
        .map(|l| PeerId::new("127.0.0.1", l.local_addr().expect("addr").port()))
        .collect();
    let cluster = ClusterConfig::new(peers, 0).expect("membership");
    start_nodes(cluster, listeners)
}

fn close_all(nodes: Vec<Node>) {
    thread::scope(|s| {
        for node in nodes {
            s.spawn(move || node.close().expect("close"));
        }
    });
}

#[test]
fn test_read_share_then_write_transfers_ownership() {
    let nodes = start_cluster(2);
    let (a, b) = (&nodes[0], &nodes[1]);
    let ps = a.page_size();

    let chunk_a = a.alloc(1, 2 * ps as u64).expect("alloc on master");
    assert_eq!(a.page_protection(1, 0), Some(Protection::Write));
    assert_eq!(a.page_protection(1, 1), Some(Protection::Write));
    let pattern: Vec<u8> = (0..ps).map(|_| fastrand::u8(..)).collect();
    chunk_a.write_bytes(0, &pattern).expect("master writes");

    let chunk_b = b.alloc(1, 2 * ps as u64).expect("join");
    assert_eq!(a.reference_count(1), Some(2));
    assert_eq!(b.page_protection(1, 0), Some(Protection::None));

    let mut seen = vec![0u8; ps];
    chunk_b.read_bytes(0, &mut seen).expect("read");
    assert_eq!(seen, pattern);
    assert_eq!(b.page_protection(1, 0), Some(Protection::Read));
    assert_eq!(a.page_protection(1, 0), Some(Protection::Read));
    let loc = b.locate_page(1, 0).expect("locate");
    assert_eq!(&loc.owner, a.local_id());
    assert!(loc.accessors.contains(b.local_id()));

    chunk_b.store_u64(0, 0xFEED).expect("write");
    assert_eq!(b.page_protection(1, 0), Some(Protection::Write));
    assert_eq!(a.page_protection(1, 0), Some(Protection::None));
    let loc = a.locate_page(1, 0).expect("locate");
    assert_eq!(&loc.owner, b.local_id());
    assert_eq!(loc.accessors, vec![b.local_id().clone()]);
    // Page 1 is untouched by b.
    assert_eq!(a.page_protection(1, 1), Some(Protection::Write));

    assert_eq!(chunk_a.load_u64(0).expect("master reads back"), 0xFEED);
    assert_eq!(b.page_protection(1, 0), Some(Protection::Read));
    assert!(b.metrics().faults_resolved() >= 2);
    assert!(a.metrics().invalidations_sent >= 1);

    b.free(chunk_b).expect("free b");
    a.free(chunk_a).expect("free a");
    assert_eq!(a.reference_count(1), None);
    close_all(nodes);
}

#[test]
fn test_barrier_makes_every_write_visible() {
    const N: usize = 3;
    let nodes = start_cluster(N);

    thread::scope(|s| {
        for (idx, node) in nodes.iter().enumerate() {
            s.spawn(move || {
                let chunk = node.alloc(2, 4096).expect("alloc");
                node.barrier().expect("joined");
                for round in 1..=2u64 {
                    chunk
                        .store_u64(idx * 8, round * 100 + idx as u64)
                        .expect("store");
                    node.barrier().expect("written");
                    for peer in 0..N {
                        assert_eq!(
                            chunk.load_u64(peer * 8).expect("load"),
                            round * 100 + peer as u64,
                            "node {} round {} slot {}",
                            idx,
                            round,
                            peer
                        );
                    }
                    node.barrier().expect("checked");
                }
                node.free(chunk).expect("free");
            });
        }
    });

    assert_eq!(nodes[0].metrics().barriers, 5);
    close_all(nodes);
}

#[test]
fn test_free_pulls_back_pages_and_last_free_destroys() {
    let nodes = start_cluster(3);
    let (master, w1, w2) = (&nodes[0], &nodes[1], &nodes[2]);
    let ps = master.page_size() as u64;

    let c1 = w1.alloc(5, 2 * ps).expect("create on worker");
    c1.write_bytes(0, b"written on w1").expect("write");
    c1.write_bytes(ps as usize, b"second page").expect("write");
    let cm = master.alloc(5, 2 * ps).expect("join master");
    let c2 = w2.alloc(5, 2 * ps).expect("join w2");
    assert_eq!(master.reference_count(5), Some(3));

    w1.free(c1).expect("free w1");
    assert_eq!(master.reference_count(5), Some(2));
    assert_eq!(&master.locate_page(5, 0).expect("locate").owner, master.local_id());
    assert_eq!(master.page_protection(5, 0), Some(Protection::Read));

    let mut buf = [0u8; 13];
    cm.read_bytes(0, &mut buf).expect("master read");
    assert_eq!(&buf, b"written on w1");
    let mut buf = [0u8; 11];
    c2.read_bytes(ps as usize, &mut buf).expect("w2 read");
    assert_eq!(&buf, b"second page");

    w2.free(c2).expect("free w2");
    assert_eq!(master.reference_count(5), Some(1));
    master.free(cm).expect("free master");
    assert_eq!(master.reference_count(5), None);
    assert!(matches!(
        w2.locate_page(5, 0),
        Err(Error::Remote(ErrorKind::NoEntry))
    ));
    close_all(nodes);
}

#[test]
fn test_size_mismatch_is_rejected() {
    let nodes = start_cluster(2);
    let ps = nodes[0].page_size() as u64;

    let owner = nodes[0].alloc(9, 3 * ps).expect("create");
    let err = nodes[1].alloc(9, 3 * ps - 1).expect_err("size differs");
    assert!(matches!(err, Error::Remote(ErrorKind::BadAlloc)));
    assert_eq!(nodes[0].reference_count(9), Some(1));
    assert!(nodes[1].chunks().is_empty());

    let joined = nodes[1].alloc(9, 3 * ps).expect("matching size");
    assert_eq!(nodes[0].reference_count(9), Some(2));

    nodes[1].free(joined).expect("free");
    nodes[0].free(owner).expect("free");
    close_all(nodes);
}

#[test]
fn test_partial_last_page() {
    let nodes = start_cluster(2);
    let ps = nodes[0].page_size();

    let a = nodes[0].alloc(3, ps as u64 + 1).expect("alloc");
    let b = nodes[1].alloc(3, ps as u64 + 1).expect("join");
    assert_eq!(a.page_count(), 2);
    assert_eq!(b.len(), ps + 1);

    b.write_bytes(ps, &[0xAB]).expect("last byte");
    assert!(b.write_bytes(ps + 1, &[0]).is_err());
    let mut last = [0u8; 1];
    a.read_bytes(ps, &mut last).expect("read");
    assert_eq!(last[0], 0xAB);

    nodes[1].free(b).expect("free");
    nodes[0].free(a).expect("free");
    close_all(nodes);
}

#[test]
fn test_single_writer_under_random_access() {
    const N: usize = 3;
    const PAGES: usize = 4;
    const OPS: usize = 40;
    let nodes = start_cluster(N);
    let ps = nodes[0].page_size();
    let expected: Mutex<HashMap<(usize, usize), u64>> = Mutex::new(HashMap::new());

    thread::scope(|s| {
        for (idx, node) in nodes.iter().enumerate() {
            let expected = &expected;
            let nodes = &nodes;
            s.spawn(move || {
                let chunk = node.alloc(4, (PAGES * ps) as u64).expect("alloc");
                node.barrier().expect("joined");

                let mut rng = fastrand::Rng::with_seed(idx as u64 + 1);
                let mut last = HashMap::new();
                for seq in 1..=OPS as u64 {
                    let page = rng.usize(..PAGES);
                    let slot = page * ps + idx * 8;
                    if rng.bool() {
                        chunk.store_u64(slot, seq).expect("store");
                        last.insert(page, seq);
                    } else {
                        let seen = chunk.load_u64(slot).expect("load");
                        assert_eq!(seen, last.get(&page).copied().unwrap_or(0));
                    }
                }
                expected
                    .lock()
                    .expect("lock")
                    .extend(last.into_iter().map(|(page, seq)| ((page, idx), seq)));
                node.barrier().expect("quiesced");

                if idx == 0 {
                    for page in 0..PAGES {
                        let prots: Vec<Protection> = nodes
                            .iter()
                            .map(|n| n.page_protection(4, page).expect("mapped"))
                            .collect();
                        let writers = prots.iter().filter(|p| **p == Protection::Write).count();
                        let readers = prots.iter().filter(|p| **p == Protection::Read).count();
                        assert!(writers <= 1, "page {}: {:?}", page, prots);
                        assert!(writers == 0 || readers == 0, "page {}: {:?}", page, prots);
                    }
                }
                node.barrier().expect("checked");

                let expected = expected.lock().expect("lock").clone();
                for page in 0..PAGES {
                    for writer in 0..N {
                        let want = expected.get(&(page, writer)).copied().unwrap_or(0);
                        let got = chunk.load_u64(page * ps + writer * 8).expect("load");
                        assert_eq!(got, want, "page {} slot {}", page, writer);
                    }
                }
                node.barrier().expect("verified");
                node.free(chunk).expect("free");
            });
        }
    });

    close_all(nodes);
}

#[test]
fn test_membership_file_and_ping() {
    let listeners = bind_loopback(2);
    let ports: Vec<u16> = listeners
        .iter()
        .map(|l| l.local_addr().expect("addr").port())
        .collect();

    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        "2\n* 127.0.0.1 {}\n- 127.0.0.1 {}\n",
        ports[0], ports[1]
    )
    .expect("write membership");
    let cluster = ClusterConfig::load(file.path()).expect("load");
    assert_eq!(cluster.master(), &PeerId::new("127.0.0.1", ports[0]));

    let nodes = start_nodes(cluster, listeners);
    assert!(nodes[0].is_master());
    assert!(!nodes[1].is_master());
    assert_eq!(nodes[1].master_id(), nodes[0].local_id());

    nodes[1].ping(nodes[0].local_id()).expect("worker pings master");
    nodes[0].ping(nodes[1].local_id()).expect("master pings worker");
    close_all(nodes);
}

#[test]
fn test_close_frees_leftover_chunks() {
    let nodes = start_cluster(2);
    let ps = nodes[0].page_size() as u64;
    // Dropping a handle does not free the chunk; close must.
    drop(nodes[0].alloc(8, ps).expect("alloc"));
    drop(nodes[1].alloc(8, ps).expect("join"));
    assert_eq!(nodes[0].reference_count(8), Some(2));
    close_all(nodes);
}

#[test]
fn test_dropped_worker_leaves_its_chunks() {
    let mut nodes = start_cluster(2);
    let worker = nodes.pop().expect("worker");
    let master = &nodes[0];
    let ps = master.page_size() as u64;

    let cw = worker.alloc(9, ps).expect("create on worker");
    cw.write_bytes(0, b"left behind").expect("write");
    drop(cw);
    let cm = master.alloc(9, ps).expect("join master");
    assert_eq!(master.reference_count(9), Some(2));

    // No close: dropping the node must still hand its pages back.
    drop(worker);
    assert_eq!(master.reference_count(9), Some(1));
    assert_eq!(&master.locate_page(9, 0).expect("locate").owner, master.local_id());
    let mut buf = [0u8; 11];
    cm.read_bytes(0, &mut buf).expect("master read");
    assert_eq!(&buf, b"left behind");

    master.free(cm).expect("free master");
    assert_eq!(master.reference_count(9), None);
    close_all(nodes);
}
