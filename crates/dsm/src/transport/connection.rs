// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking request/reply link to one peer.
//!
//! One request is in flight per link. Transport failures reconnect and resend
//! up to `max_retries` times when it is safe: always if the request never left
//! this node, and after a lost reply only for idempotent requests.

use super::frame::FrameCodec;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::peer::PeerId;
use crate::protocol::{Reply, Request};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

/// How long a call may wait for its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyWait {
    /// Use the configured request timeout
    Default,
    /// Use this timeout instead of the configured one
    Within(Duration),
    /// Block until the peer answers (barrier rendezvous)
    Unbounded,
}

/// Persistent link to a single peer.
pub struct PeerConnection {
    peer: PeerId,
    stream: Option<TcpStream>,
    codec: FrameCodec,
    out: Vec<u8>,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

enum Attempt {
    /// Failed before any byte of the request was written
    NotSent(Error),
    /// Failed after some or all of the request was written
    Sent(Error),
}

/// Write a sealed frame. A failure counts as sent once any byte is out.
fn send_frame<W: Write + ?Sized>(
    writer: &mut W,
    frame: &[u8],
) -> std::result::Result<(), Attempt> {
    let mut written = 0;
    while written < frame.len() {
        let err = match writer.write(&frame[written..]) {
            Ok(0) => io::Error::from(io::ErrorKind::WriteZero),
            Ok(n) => {
                written += n;
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => e,
        };
        return Err(if written == 0 {
            Attempt::NotSent(err.into())
        } else {
            Attempt::Sent(err.into())
        });
    }
    writer.flush().map_err(|e| Attempt::Sent(e.into()))
}

impl PeerConnection {
    /// Create an unconnected link. The socket is opened on first use.
    pub fn new(peer: PeerId, config: &NodeConfig) -> Self {
        Self {
            peer,
            stream: None,
            codec: FrameCodec::new(config.max_frame_size),
            out: Vec::with_capacity(256),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the socket if it is not already open.
    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.peer.resolve()?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&addr.into(), self.connect_timeout)?;
        socket.set_write_timeout(Some(self.request_timeout))?;

        log::debug!("[dsm] connected to {} ({})", self.peer, addr);
        self.stream = Some(socket.into());
        Ok(())
    }

    /// Send a request and wait for the paired reply.
    pub fn call(&mut self, request: &Request) -> Result<Reply> {
        self.call_with(request, ReplyWait::Default)
    }

    /// Send a request and wait for the paired reply with an explicit wait policy.
    ///
    /// An ERROR reply becomes [`Error::Remote`].
    pub fn call_with(&mut self, request: &Request, wait: ReplyWait) -> Result<Reply> {
        FrameCodec::begin(&mut self.out);
        request.encode(&mut self.out);
        FrameCodec::finish(&mut self.out)?;

        let mut attempt = 0;
        let reply = loop {
            match self.attempt(wait) {
                Ok(reply) => break reply,
                Err(Attempt::NotSent(e)) | Err(Attempt::Sent(e))
                    if !e.is_transport() =>
                {
                    return Err(e)
                }
                Err(Attempt::Sent(e)) if !request.is_idempotent() => {
                    log::warn!(
                        "[dsm] {} to {} failed after send: {}",
                        request.msg_type(),
                        self.peer,
                        e
                    );
                    return Err(e);
                }
                Err(Attempt::NotSent(e)) | Err(Attempt::Sent(e)) => {
                    if attempt >= self.max_retries {
                        log::warn!(
                            "[dsm] {} to {} failed after {} retries: {}",
                            request.msg_type(),
                            self.peer,
                            attempt,
                            e
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    log::debug!(
                        "[dsm] {} to {} failed ({}), retry {}/{}",
                        request.msg_type(),
                        self.peer,
                        e,
                        attempt,
                        self.max_retries
                    );
                    thread::sleep(self.retry_delay);
                }
            }
        };

        match reply {
            Reply::Error(kind) => Err(Error::Remote(kind)),
            reply if reply.msg_type() == request.msg_type() => Ok(reply),
            reply => Err(Error::UnexpectedReply {
                expected: request.msg_type(),
                got: reply.msg_type(),
            }),
        }
    }

    fn attempt(&mut self, wait: ReplyWait) -> std::result::Result<Reply, Attempt> {
        if let Err(e) = self.connect() {
            return Err(Attempt::NotSent(e));
        }
        let read_timeout = match wait {
            ReplyWait::Default => Some(self.request_timeout),
            ReplyWait::Within(timeout) => Some(timeout),
            ReplyWait::Unbounded => None,
        };

        let Some(stream) = self.stream.as_mut() else {
            return Err(Attempt::NotSent(Error::Closed));
        };
        if let Err(e) = stream.set_read_timeout(read_timeout) {
            self.drop_stream();
            return Err(Attempt::NotSent(e.into()));
        }
        if let Err(attempt) = send_frame(stream, &self.out) {
            self.drop_stream();
            return Err(attempt);
        }

        let result = match self.codec.read_frame(stream) {
            Ok(Some(body)) => Reply::decode(body).map_err(Error::from),
            Ok(None) => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer closed the connection",
            ))),
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| {
            // A partially read reply leaves the stream unusable.
            self.drop_stream();
            Attempt::Sent(e)
        })
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Close the link. A later call reconnects.
    pub fn close(&mut self) {
        if self.stream.is_some() {
            log::debug!("[dsm] closing link to {}", self.peer);
        }
        self.drop_stream();
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.drop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::TcpListener;

    fn fast_config() -> NodeConfig {
        NodeConfig::default()
            .with_connect_timeout(Duration::from_millis(500))
            .with_request_timeout(Duration::from_millis(500))
            .with_retry_delay(Duration::from_millis(10))
            .with_max_retries(2)
    }

    /// Accept one connection and answer each request with `respond`.
    fn serve_once<F>(listener: TcpListener, mut respond: F) -> thread::JoinHandle<usize>
    where
        F: FnMut(Request) -> Option<Reply> + Send + 'static,
    {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut codec = FrameCodec::new(1 << 20);
            let mut served = 0;
            while let Ok(Some(body)) = codec.read_frame(&mut stream) {
                let request = Request::decode(body).expect("valid request");
                served += 1;
                let Some(reply) = respond(request) else {
                    break;
                };
                let mut out = Vec::new();
                FrameCodec::begin(&mut out);
                reply.encode(&mut out);
                FrameCodec::finish(&mut out).expect("fits");
                FrameCodec::write_frame(&mut stream, &out).expect("write");
            }
            served
        })
    }

    fn local_peer(listener: &TcpListener) -> PeerId {
        PeerId::new("127.0.0.1", listener.local_addr().expect("addr").port())
    }

    #[test]
    fn test_call_pairs_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = local_peer(&listener);
        let server = serve_once(listener, |req| match req {
            Request::Noop => Some(Reply::Noop),
            Request::LocatePage { .. } => Some(Reply::Error(ErrorKind::NoEntry)),
            _ => Some(Reply::Barrier),
        });

        let mut conn = PeerConnection::new(peer, &fast_config());
        assert_eq!(conn.call(&Request::Noop).expect("noop"), Reply::Noop);
        assert!(conn.is_connected());

        let err = conn
            .call(&Request::LocatePage {
                chunk_id: 1,
                page: 0,
            })
            .expect_err("remote error");
        assert!(matches!(err, Error::Remote(ErrorKind::NoEntry)));

        let err = conn
            .call(&Request::FreeChunk {
                chunk_id: 1,
                requestor: PeerId::new("x", 1),
            })
            .expect_err("mismatched reply");
        assert!(matches!(err, Error::UnexpectedReply { .. }));

        conn.close();
        assert_eq!(server.join().expect("server"), 3);
    }

    #[test]
    fn test_connect_refused_is_retried_then_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = local_peer(&listener);
        drop(listener);

        let mut conn = PeerConnection::new(peer, &fast_config());
        let err = conn.call(&Request::Noop).expect_err("nobody listening");
        assert!(err.is_transport());
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_lost_reply_not_resent_for_barrier() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = local_peer(&listener);
        // Hang up without answering.
        let server = serve_once(listener, |_| None);

        let mut conn = PeerConnection::new(peer, &fast_config());
        let err = conn.call(&Request::Barrier).expect_err("no reply");
        assert!(err.is_transport());
        assert_eq!(server.join().expect("server"), 1);
    }

    /// Accepts `accept` bytes, then fails every write.
    struct ShortWriter {
        accept: usize,
        taken: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"));
            }
            let n = buf.len().min(self.accept);
            self.accept -= n;
            self.taken.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_write_counts_as_sent() {
        let frame = FrameCodec::encode(&[7u8; 32]);

        let mut nothing = ShortWriter {
            accept: 0,
            taken: Vec::new(),
        };
        assert!(matches!(
            send_frame(&mut nothing, &frame),
            Err(Attempt::NotSent(_))
        ));

        let mut partial = ShortWriter {
            accept: 3,
            taken: Vec::new(),
        };
        assert!(matches!(send_frame(&mut partial, &frame), Err(Attempt::Sent(_))));
        assert_eq!(partial.taken.len(), 3);

        let mut whole = ShortWriter {
            accept: usize::MAX,
            taken: Vec::new(),
        };
        assert!(send_frame(&mut whole, &frame).is_ok());
        assert_eq!(whole.taken, frame);
    }
}
