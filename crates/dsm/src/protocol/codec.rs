// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Big-endian field codec.

use crate::error::{Error, ErrorKind};
use crate::peer::{PeerId, MAX_HOST_LEN};
use std::fmt;

/// Errors from decoding a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Type tag is not a known message type
    UnknownType(u32),
    /// Body ended before a field was complete
    Truncated { needed: usize, remaining: usize },
    /// Field value is out of range
    Invalid(&'static str),
    /// Bytes left over after the last field
    TrailingBytes(usize),
}

impl DecodeError {
    /// Error code for the ERROR reply answering an undecodable request.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownType(_) => ErrorKind::NotImplemented,
            _ => ErrorKind::BadOperation,
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(t) => write!(f, "unknown message type {}", t),
            Self::Truncated { needed, remaining } => {
                write!(f, "truncated: need {} bytes, {} remaining", needed, remaining)
            }
            Self::Invalid(what) => write!(f, "invalid {}", what),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes", n),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Appends big-endian fields to a buffer.
pub struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// `u16` length then UTF-8 bytes.
    pub fn put_str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// `u32` length then raw bytes.
    pub fn put_bytes(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    /// Port (`u32`) then host.
    pub fn put_peer(&mut self, peer: &PeerId) {
        self.put_u32(peer.port() as u32);
        self.put_str(peer.host());
    }
}

/// Reads big-endian fields from a message body.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::Invalid("bool")),
        }
    }

    pub fn get_str(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.get_u16()? as usize;
        std::str::from_utf8(self.take(len)?).map_err(|_| DecodeError::Invalid("utf-8 string"))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_peer(&mut self) -> Result<PeerId, DecodeError> {
        let port = self.get_u32()?;
        let port = u16::try_from(port).map_err(|_| DecodeError::Invalid("port"))?;
        let host = self.get_str()?;
        if host.is_empty() || host.len() > MAX_HOST_LEN {
            return Err(DecodeError::Invalid("host"));
        }
        Ok(PeerId::new(host, port))
    }

    /// Fail if any bytes remain.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_are_big_endian() {
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        w.put_u32(0x0102_0304);
        w.put_str("ab");
        assert_eq!(buf, [1, 2, 3, 4, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_truncated_field() {
        let mut r = WireReader::new(&[0, 0, 1]);
        assert_eq!(
            r.get_u32(),
            Err(DecodeError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_peer_port_range_checked() {
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        w.put_u32(70_000);
        w.put_str("host");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.get_peer(), Err(DecodeError::Invalid("port")));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut r = WireReader::new(&[1, 0]);
        assert_eq!(r.get_u8(), Ok(1));
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_unknown_type_maps_to_not_implemented() {
        assert_eq!(DecodeError::UnknownType(42).kind(), ErrorKind::NotImplemented);
        assert_eq!(DecodeError::Invalid("x").kind(), ErrorKind::BadOperation);
    }
}
