// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for DSM operations.
//!
//! [`ErrorKind`] is the closed set of error codes carried by ERROR replies.
//! [`Error`] is the local failure type returned by every fallible API; a
//! remote rejection surfaces as [`Error::Remote`].

use crate::protocol::MsgType;
use std::fmt;
use std::io;

/// Result type for DSM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes exchanged on the wire in ERROR replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// Unknown or unhandled message type
    NotImplemented = 0,
    /// Request is malformed or not valid on this node
    BadOperation = 1,
    /// Chunk or page does not exist
    NoEntry = 2,
    /// Handler failed for a local reason
    Internal = 3,
    /// Chunk re-allocated with a mismatched size
    BadAlloc = 4,
    /// Page could not be produced by its owner
    NoPage = 5,
}

impl ErrorKind {
    /// Wire code for this kind.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Parse a wire code.
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::NotImplemented),
            1 => Some(Self::BadOperation),
            2 => Some(Self::NoEntry),
            3 => Some(Self::Internal),
            4 => Some(Self::BadAlloc),
            5 => Some(Self::NoPage),
            _ => None,
        }
    }

    /// Human-readable description.
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotImplemented => "the requested operation has not been implemented",
            Self::BadOperation => "the requested operation is invalid",
            Self::NoEntry => "the entry specified does not exist or is invalid",
            Self::Internal => "there was an internal server error",
            Self::BadAlloc => "chunk size does not match the existing allocation",
            Self::NoPage => "the page could not be located",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors that can occur during DSM operations
#[derive(Debug)]
pub enum Error {
    /// Socket or file I/O failure
    Io(io::Error),

    /// Peer answered with an ERROR reply
    Remote(ErrorKind),

    /// Frame or payload could not be decoded
    Decode(String),

    /// Reply type does not pair with the request
    UnexpectedReply { expected: MsgType, got: MsgType },

    /// Peer did not answer within the request timeout
    Timeout,

    /// Membership or node configuration is invalid
    Config(String),

    /// Operation is not valid in the current node or chunk state
    InvalidState(String),

    /// Mapping or protecting chunk memory failed
    Region(io::Error),

    /// Every fault-trap slot is in use
    TrapTableFull,

    /// Node has been closed
    Closed,
}

impl Error {
    /// Error code to send back when a request handler fails with this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(kind) => *kind,
            Self::Decode(_) | Self::InvalidState(_) => ErrorKind::BadOperation,
            _ => ErrorKind::Internal,
        }
    }

    /// True for failures of the link itself rather than of the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout | Self::Decode(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Remote(kind) => write!(f, "remote error: {}", kind),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::UnexpectedReply { expected, got } => {
                write!(f, "unexpected reply: expected {}, got {}", expected, got)
            }
            Self::Timeout => write!(f, "request timed out"),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::Region(e) => write!(f, "chunk memory error: {}", e),
            Self::TrapTableFull => write!(f, "fault trap table is full"),
            Self::Closed => write!(f, "node is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Region(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::Remote(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_roundtrip() {
        for code in 0..6 {
            let kind = ErrorKind::from_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(6), None);
    }

    #[test]
    fn test_error_maps_to_wire_kind() {
        assert_eq!(Error::Remote(ErrorKind::BadAlloc).kind(), ErrorKind::BadAlloc);
        assert_eq!(Error::Decode("short".into()).kind(), ErrorKind::BadOperation);
        assert_eq!(Error::Timeout.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_io_timeout_becomes_timeout() {
        let err: Error = io::Error::new(io::ErrorKind::WouldBlock, "slow").into();
        assert!(matches!(err, Error::Timeout));
        assert!(err.is_transport());

        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
