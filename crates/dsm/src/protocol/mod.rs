// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DSM wire protocol.
//!
//! The message taxonomy is closed: every frame is one of the nine
//! [`MsgType`]s. Requests and replies are tagged unions encoded big-endian:
//!
//! ```text
//! +--------------+------------------------+-------------------------+
//! | type (u32)   | fixed fields           | variable tail           |
//! +--------------+------------------------+-------------------------+
//!                                          host strings, page bytes
//! ```
//!
//! A reply always carries its request's type, or ERROR.

mod codec;
mod message;

pub use codec::{DecodeError, WireReader, WireWriter};
pub use message::{GetPage, Invalidate, Reply, Request};

use std::fmt;
use std::ops::BitOr;

/// Application-chosen chunk handle, unique within a cluster session.
pub type ChunkId = u64;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Noop = 0,
    AllocChunk = 1,
    FreeChunk = 2,
    GetPage = 3,
    LocatePage = 4,
    InvalidatePage = 5,
    Barrier = 6,
    Terminate = 7,
    Error = 8,
}

impl MsgType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Noop),
            1 => Some(Self::AllocChunk),
            2 => Some(Self::FreeChunk),
            3 => Some(Self::GetPage),
            4 => Some(Self::LocatePage),
            5 => Some(Self::InvalidatePage),
            6 => Some(Self::Barrier),
            7 => Some(Self::Terminate),
            8 => Some(Self::Error),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "NOOP",
            Self::AllocChunk => "ALLOCCHUNK",
            Self::FreeChunk => "FREECHUNK",
            Self::GetPage => "GETPAGE",
            Self::LocatePage => "LOCATEPAGE",
            Self::InvalidatePage => "INVALIDATEPAGE",
            Self::Barrier => "BARRIER",
            Self::Terminate => "TERMINATE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page access flags carried by GETPAGE and INVALIDATEPAGE.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    pub const EMPTY: Self = Self(0);
    /// Exclusive access
    pub const WRITE: Self = Self(0x01);
    /// Shared access
    pub const READ: Self = Self(0x02);
    /// Requestor already holds current bytes; skip the payload
    pub const NOUPDATE: Self = Self(0x04);

    const ALL: u32 = 0x07;

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Parse wire bits, rejecting unknown flags.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn skip_payload(self) -> bool {
        self.contains(Self::NOUPDATE)
    }

    /// True when the flags name an access kind.
    pub const fn has_access(self) -> bool {
        self.is_read() || self.is_write()
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_write() {
            parts.push("WRITE");
        }
        if self.is_read() {
            parts.push("READ");
        }
        if self.skip_payload() {
            parts.push("NOUPDATE");
        }
        if parts.is_empty() {
            f.write_str("EMPTY")
        } else {
            f.write_str(&parts.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_codes() {
        for code in 0..=8 {
            let ty = MsgType::from_code(code).expect("known type");
            assert_eq!(ty.code(), code);
        }
        assert_eq!(MsgType::from_code(9), None);
        assert_eq!(MsgType::InvalidatePage.to_string(), "INVALIDATEPAGE");
    }

    #[test]
    fn test_page_flags() {
        let upgrade = PageFlags::WRITE | PageFlags::NOUPDATE;
        assert_eq!(upgrade.bits(), 0x05);
        assert!(upgrade.is_write());
        assert!(!upgrade.is_read());
        assert!(upgrade.skip_payload());
        assert!(upgrade.has_access());
        assert!(!PageFlags::NOUPDATE.has_access());
        assert_eq!(format!("{:?}", upgrade), "WRITE|NOUPDATE");

        assert_eq!(PageFlags::from_bits(0x02), Some(PageFlags::READ));
        assert_eq!(PageFlags::from_bits(0x08), None);
    }
}
