// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background request server.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------+
//! |  accept thread (dsm-server)                           |
//! |  - mio Poll: listener + Waker                         |
//! |  - spawns one blocking worker per inbound connection  |
//! +-------------------------------------------------------+
//!          |                     |
//!          v                     v
//! +------------------+  +------------------+
//! | dsm-conn-1       |  | dsm-conn-2       |   read frame -> handler -> reply
//! +------------------+  +------------------+
//! ```
//!
//! Each connection is served strictly request/reply: a reply is written
//! before the next request is read. A connection worker may block inside the
//! handler (barrier rendezvous) without stalling other peers.
//!
//! TERMINATE is answered by the server itself and stops it.

use super::frame::FrameCodec;
use crate::error::Result;
use crate::protocol::{Reply, Request};
use mio::net::TcpListener as MioListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const MAX_EVENTS: usize = 64;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Handles one decoded request and produces its reply.
///
/// Handlers run on connection worker threads and may be called concurrently.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Reply;
}

impl<F> RequestHandler for F
where
    F: Fn(Request) -> Reply + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Reply {
        self(request)
    }
}

/// Handle to the running server thread.
pub struct RequestServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread_handle: Option<JoinHandle<()>>,
}

struct Worker {
    stream: TcpStream,
    handle: JoinHandle<()>,
}

struct AcceptLoop {
    poll: Poll,
    listener: MioListener,
    handler: Arc<dyn RequestHandler>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    max_frame_size: usize,
    workers: Vec<Worker>,
    next_conn: u64,
}

impl RequestServer {
    /// Bind a listening socket for `addr`.
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(socket.into())
    }

    /// Start serving `listener` on a background thread.
    pub fn spawn(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        max_frame_size: usize,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let mut listener = MioListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));

        let accept_loop = AcceptLoop {
            poll,
            listener,
            handler,
            running: running.clone(),
            waker: waker.clone(),
            max_frame_size,
            workers: Vec::new(),
            next_conn: 1,
        };

        let thread_handle = thread::Builder::new()
            .name("dsm-server".to_string())
            .spawn(move || accept_loop.run())?;

        log::info!("[dsm] request server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            running,
            waker,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Ask the server to stop. Returns immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.waker.wake();
    }

    /// Wait for the server and all connection workers to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("[dsm] request server thread panicked");
            }
        }
    }
}

impl Drop for RequestServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl AcceptLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("[dsm] server poll error: {}", e);
                }
                continue;
            }

            // WAKER_TOKEN only interrupts the poll so `running` is re-checked.
            if events.iter().any(|e| e.token() == LISTENER_TOKEN) {
                self.handle_accept();
            }
            self.reap();
        }

        // Unblock workers waiting on their peers, then wait for them.
        for worker in &self.workers {
            let _ = worker.stream.shutdown(Shutdown::Both);
        }
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                log::error!("[dsm] connection worker panicked");
            }
        }
        log::debug!("[dsm] request server stopped");
    }

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.start_worker(stream, addr) {
                        log::warn!("[dsm] failed to start worker for {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[dsm] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn start_worker(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) -> io::Result<()> {
        // SAFETY: the fd comes straight from a mio stream we own, and ownership
        // moves into the std stream without being duplicated.
        let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let conn_id = self.next_conn;
        self.next_conn += 1;

        let ctx = WorkerContext {
            stream: stream.try_clone()?,
            handler: self.handler.clone(),
            running: self.running.clone(),
            waker: self.waker.clone(),
            codec: FrameCodec::new(self.max_frame_size),
            addr,
        };
        let handle = thread::Builder::new()
            .name(format!("dsm-conn-{}", conn_id))
            .spawn(move || ctx.run())?;

        log::debug!("[dsm] accepted connection {} from {}", conn_id, addr);
        self.workers.push(Worker { stream, handle });
        Ok(())
    }

    /// Join workers whose peer went away.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].handle.is_finished() {
                let worker = self.workers.swap_remove(i);
                let _ = worker.handle.join();
            } else {
                i += 1;
            }
        }
    }
}

struct WorkerContext {
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    codec: FrameCodec,
    addr: SocketAddr,
}

impl WorkerContext {
    fn run(mut self) {
        let mut out = Vec::with_capacity(256);

        loop {
            let request = match self.codec.read_frame(&mut self.stream) {
                Ok(Some(body)) => Request::decode(body),
                Ok(None) => break,
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        log::debug!("[dsm] connection from {} ended: {}", self.addr, e);
                    }
                    break;
                }
            };

            let (reply, terminate) = match request {
                Ok(Request::Terminate { requestor }) => {
                    log::info!("[dsm] TERMINATE from {}", requestor);
                    (Reply::Terminate, true)
                }
                Ok(request) => {
                    log::trace!("[dsm] {} from {}", request.msg_type(), self.addr);
                    (self.handler.handle(request), false)
                }
                Err(e) => {
                    log::warn!("[dsm] undecodable request from {}: {}", self.addr, e);
                    (Reply::Error(e.kind()), false)
                }
            };

            FrameCodec::begin(&mut out);
            reply.encode(&mut out);
            let sent = FrameCodec::finish(&mut out)
                .and_then(|()| FrameCodec::write_frame(&mut self.stream, &out));

            if terminate {
                self.running.store(false, Ordering::Relaxed);
                let _ = self.waker.wake();
                break;
            }
            if let Err(e) = sent {
                log::debug!("[dsm] reply to {} failed: {}", self.addr, e);
                break;
            }
        }
    }
}
