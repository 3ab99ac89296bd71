// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! dsm-node - run one DSM cluster node
//!
//! Every node of the cluster runs the same subcommand with the same
//! membership file and its own `--host`/`--port`.

use clap::{Parser, Subcommand};
use colored::*;
use dsm::{ChunkHandle, ClusterConfig, Node, NodeConfig, PeerId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Run a DSM cluster node
#[derive(Parser, Debug)]
#[command(name = "dsm-node")]
#[command(version = "0.1.0")]
#[command(about = "Run a DSM cluster node and its demo workloads")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Membership file
    #[arg(short, long, default_value = "cluster.conf", global = true)]
    config: PathBuf,

    /// This node's host, as listed in the membership file
    #[arg(long, default_value = "127.0.0.1", global = true)]
    host: String,

    /// This node's port, as listed in the membership file
    #[arg(short, long, default_value = "8000", global = true)]
    port: u16,

    /// Seconds between drain checks on close
    #[arg(long, default_value = "2", global = true)]
    close_poll: u64,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Parse the membership file and print it
    Check,
    /// Two nodes take turns incrementing a shared counter
    Pingpong {
        /// Increments per node
        #[arg(short, long, default_value = "100")]
        rounds: u64,
    },
    /// Row-partitioned matrix multiplication across all nodes
    Matmul {
        /// Matrix dimension (n x n)
        #[arg(short, long, default_value = "64")]
        n: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = ClusterConfig::load(&args.config)?;
    let local = PeerId::new(args.host.clone(), args.port);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match &args.mode {
        Mode::Check => {
            print_cluster(&cluster, &local);
            Ok(())
        }
        Mode::Pingpong { rounds } => {
            let node = start(args, cluster.with_local(&local)?)?;
            run_pingpong(&node, *rounds, &running)?;
            node.close()?;
            Ok(())
        }
        Mode::Matmul { n } => {
            let node = start(args, cluster.with_local(&local)?)?;
            run_matmul(&node, *n, &running)?;
            node.close()?;
            Ok(())
        }
    }
}

fn start(args: &Args, cluster: ClusterConfig) -> dsm::Result<Node> {
    let config =
        NodeConfig::default().with_close_poll_interval(Duration::from_secs(args.close_poll));
    let node = Node::builder(cluster).config(config).start()?;
    eprintln!(
        "{} node {} up ({})",
        ">>>".green().bold(),
        node.local_id(),
        if node.is_master() { "master" } else { "worker" }
    );
    Ok(node)
}

fn print_cluster(cluster: &ClusterConfig, local: &PeerId) {
    println!("{}", "Cluster membership".bold());
    for (idx, peer) in cluster.peers().iter().enumerate() {
        let role = if idx == cluster.master_index() {
            "master".yellow()
        } else {
            "worker".normal()
        };
        let marker = if peer == local { " <- this node".green() } else { "".normal() };
        println!("  [{}] {:<24} {}{}", idx, peer.to_string(), role, marker);
    }
    println!("  page size: {} bytes", dsm::page_size());
    if cluster.index_of(local).is_none() {
        println!("  {} {} is not a member", "warning:".yellow().bold(), local);
    }
}

// ============================================================================
// pingpong
// ============================================================================

const PINGPONG_CHUNK: u64 = 100;

fn run_pingpong(node: &Node, rounds: u64, running: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = node.cluster();
    if cluster.len() != 2 {
        return Err(format!("pingpong needs exactly 2 nodes, found {}", cluster.len()).into());
    }
    let turn = cluster.local_index().unwrap_or(0) as u64;

    let chunk = node.alloc(PINGPONG_CHUNK, 8)?;
    node.barrier()?;

    let start = Instant::now();
    let target = rounds * 2;
    loop {
        let counter = chunk.load_u64(0)?;
        if counter >= target {
            break;
        }
        if !running.load(Ordering::SeqCst) {
            return Err(format!("interrupted at {} of {}", counter, target).into());
        }
        if counter % 2 == turn {
            chunk.store_u64(0, counter + 1)?;
        } else {
            thread::yield_now();
        }
    }
    let elapsed = start.elapsed();
    node.barrier()?;

    let m = node.metrics();
    println!(
        "{} {} increments in {:.2?} ({:.1} us/round trip)",
        "pingpong".green().bold(),
        target,
        elapsed,
        elapsed.as_secs_f64() * 1e6 / rounds.max(1) as f64
    );
    println!(
        "  faults: read={} write={} upgrade={} spurious={}, pages fetched={}",
        m.read_faults, m.write_faults, m.upgrade_faults, m.spurious_faults, m.pages_fetched
    );
    node.free(chunk)?;
    Ok(())
}

// ============================================================================
// matmul
// ============================================================================

const MATRIX_A: u64 = 200;
const MATRIX_B: u64 = 201;
const MATRIX_C: u64 = 202;

struct Matrix<'n> {
    chunk: ChunkHandle<'n>,
    cols: usize,
}

impl<'n> Matrix<'n> {
    fn alloc(node: &'n Node, id: u64, rows: usize, cols: usize) -> dsm::Result<Self> {
        let chunk = node.alloc(id, (rows * cols * 8) as u64)?;
        Ok(Self { chunk, cols })
    }

    fn get(&self, i: usize, j: usize) -> dsm::Result<f64> {
        Ok(f64::from_bits(self.chunk.load_u64((i * self.cols + j) * 8)?))
    }

    fn set(&self, i: usize, j: usize, v: f64) -> dsm::Result<()> {
        self.chunk.store_u64((i * self.cols + j) * 8, v.to_bits())
    }
}

fn input(i: usize, j: usize, salt: usize) -> f64 {
    ((i * 7 + j * 3 + salt) % 10) as f64
}

fn run_matmul(node: &Node, n: usize, running: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = node.cluster();
    let nodes = cluster.len();
    let me = cluster.local_index().unwrap_or(0);

    let a = Matrix::alloc(node, MATRIX_A, n, n)?;
    let b = Matrix::alloc(node, MATRIX_B, n, n)?;
    let c = Matrix::alloc(node, MATRIX_C, n, n)?;

    if node.is_master() {
        for i in 0..n {
            for j in 0..n {
                a.set(i, j, input(i, j, 1))?;
                b.set(i, j, input(i, j, 2))?;
            }
        }
    }
    node.barrier()?;

    let start = Instant::now();
    let part = n.div_ceil(nodes);
    let rows = (me * part)..((me + 1) * part).min(n);
    for i in rows.clone() {
        if !running.load(Ordering::SeqCst) {
            return Err("interrupted".into());
        }
        for j in 0..n {
            let mut sum = 0.0;
            for k in 0..n {
                sum += a.get(i, k)? * b.get(k, j)?;
            }
            c.set(i, j, sum)?;
        }
    }
    let elapsed = start.elapsed();
    log::info!("rows {:?} done in {:.2?}", rows, elapsed);
    node.barrier()?;

    if node.is_master() {
        let mut wrong = 0usize;
        for i in 0..n {
            for j in 0..n {
                let expect: f64 = (0..n).map(|k| input(i, k, 1) * input(k, j, 2)).sum();
                if c.get(i, j)? != expect {
                    wrong += 1;
                }
            }
        }
        if wrong > 0 {
            return Err(format!("{} of {} cells of C are wrong", wrong, n * n).into());
        }
        println!(
            "{} {}x{} product verified across {} nodes",
            "matmul".green().bold(),
            n,
            n,
            nodes
        );
    }
    let m = node.metrics();
    println!(
        "  local rows {:?} in {:.2?}; faults={} pages fetched={} ({} bytes)",
        rows,
        elapsed,
        m.faults_resolved(),
        m.pages_fetched,
        m.bytes_fetched
    );
    node.barrier()?;

    for matrix in [a, b, c] {
        node.free(matrix.chunk)?;
    }
    Ok(())
}
