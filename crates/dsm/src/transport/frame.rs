// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for DSM messages over TCP.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Message body      |
//! +----------------+-------------------+
//! ```
//!
//! The length covers the body only. Links are strictly request/reply, so
//! frames are read with blocking I/O.

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Length-prefix frame codec.
///
/// Owns the receive buffer so a connection reuses one allocation for every
/// inbound frame.
#[derive(Debug)]
pub struct FrameCodec {
    /// Receive buffer
    buffer: Vec<u8>,

    /// Maximum allowed body size (anti-OOM protection)
    max_size: usize,

    /// Statistics: frames decoded
    frames_decoded: u64,

    /// Statistics: bytes decoded
    bytes_decoded: u64,

    /// Statistics: frames too large (rejected)
    frames_rejected: u64,
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Start a frame in `buf`: clears it and reserves the length header.
    ///
    /// Encode the body after this call, then seal with [`FrameCodec::finish`].
    pub fn begin(buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);
    }

    /// Write the length header of a frame started with [`FrameCodec::begin`].
    pub fn finish(buf: &mut [u8]) -> io::Result<()> {
        let body = buf.len().saturating_sub(FRAME_HEADER_SIZE);
        let len = u32::try_from(body)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        buf[..FRAME_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Encode a body into a new framed buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Write a sealed frame.
    pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
        writer.write_all(frame)?;
        writer.flush()
    }

    /// Read one frame body.
    ///
    /// Returns:
    /// - `Ok(Some(body))` - A complete frame was read
    /// - `Ok(None)` - Peer closed the connection at a frame boundary
    /// - `Err(e)` - I/O error, timeout, or oversized frame
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<&[u8]>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-header",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_size {
            self.frames_rejected += 1;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit {}", len, self.max_size),
            ));
        }

        self.buffer.resize(len, 0);
        reader.read_exact(&mut self.buffer)?;

        self.frames_decoded += 1;
        self.bytes_decoded += len as u64;
        Ok(Some(&self.buffer))
    }
}
