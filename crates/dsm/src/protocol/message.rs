// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request and reply messages.

use super::codec::{DecodeError, WireReader, WireWriter};
use super::{ChunkId, MsgType, PageFlags};
use crate::error::ErrorKind;
use crate::peer::PeerId;

/// Smallest encoded peer: port plus an empty-length host prefix.
const MIN_PEER_LEN: usize = 6;

/// GETPAGE request.
///
/// Sent by a node to the master to fault a page in, and by the master to a
/// page's owner to fetch its bytes. On a fetch, `version` is the grant being
/// issued and `after` the grant the target must have applied before it
/// answers. On a request to the master, `version` is zero and `after` is the
/// last grant the requestor applied to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPage {
    pub chunk_id: ChunkId,
    pub page: u64,
    pub flags: PageFlags,
    pub requestor: PeerId,
    pub version: u64,
    pub after: u64,
}

/// INVALIDATEPAGE request, master to a page holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidate {
    pub chunk_id: ChunkId,
    pub page: u64,
    pub flags: PageFlags,
    pub version: u64,
    pub after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Noop,
    AllocChunk {
        chunk_id: ChunkId,
        size: u64,
        requestor: PeerId,
    },
    FreeChunk {
        chunk_id: ChunkId,
        requestor: PeerId,
    },
    GetPage(GetPage),
    LocatePage {
        chunk_id: ChunkId,
        page: u64,
    },
    InvalidatePage(Invalidate),
    Barrier,
    Terminate {
        requestor: PeerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Noop,
    AllocChunk {
        is_owner: bool,
    },
    FreeChunk {
        chunk_id: ChunkId,
    },
    /// Grant version plus the page bytes; `None` when the payload was skipped.
    GetPage {
        version: u64,
        data: Option<Vec<u8>>,
    },
    /// Owner plus every peer currently holding a valid copy.
    LocatePage {
        owner: PeerId,
        accessors: Vec<PeerId>,
    },
    InvalidatePage {
        chunk_id: ChunkId,
        page: u64,
    },
    Barrier,
    Terminate,
    Error(ErrorKind),
}

fn get_type(r: &mut WireReader<'_>) -> Result<MsgType, DecodeError> {
    let code = r.get_u32()?;
    MsgType::from_code(code).ok_or(DecodeError::UnknownType(code))
}

fn get_flags(r: &mut WireReader<'_>) -> Result<PageFlags, DecodeError> {
    PageFlags::from_bits(r.get_u32()?).ok_or(DecodeError::Invalid("page flags"))
}

impl Request {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Noop => MsgType::Noop,
            Self::AllocChunk { .. } => MsgType::AllocChunk,
            Self::FreeChunk { .. } => MsgType::FreeChunk,
            Self::GetPage(_) => MsgType::GetPage,
            Self::LocatePage { .. } => MsgType::LocatePage,
            Self::InvalidatePage(_) => MsgType::InvalidatePage,
            Self::Barrier => MsgType::Barrier,
            Self::Terminate { .. } => MsgType::Terminate,
        }
    }

    /// True when executing the request twice has the same effect as once.
    ///
    /// Only these are resent after a reply is lost.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Noop | Self::AllocChunk { .. } | Self::LocatePage { .. } | Self::InvalidatePage(_)
        )
    }

    /// Append the encoded body to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = WireWriter::new(buf);
        w.put_u32(self.msg_type().code());
        match self {
            Self::Noop | Self::Barrier => {}
            Self::AllocChunk {
                chunk_id,
                size,
                requestor,
            } => {
                w.put_u64(*chunk_id);
                w.put_u64(*size);
                w.put_peer(requestor);
            }
            Self::FreeChunk {
                chunk_id,
                requestor,
            } => {
                w.put_u64(*chunk_id);
                w.put_peer(requestor);
            }
            Self::GetPage(req) => {
                w.put_u64(req.chunk_id);
                w.put_u64(req.page);
                w.put_u32(req.flags.bits());
                w.put_u64(req.version);
                w.put_u64(req.after);
                w.put_peer(&req.requestor);
            }
            Self::LocatePage { chunk_id, page } => {
                w.put_u64(*chunk_id);
                w.put_u64(*page);
            }
            Self::InvalidatePage(req) => {
                w.put_u64(req.chunk_id);
                w.put_u64(req.page);
                w.put_u32(req.flags.bits());
                w.put_u64(req.version);
                w.put_u64(req.after);
            }
            Self::Terminate { requestor } => w.put_peer(requestor),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(body);
        let request = match get_type(&mut r)? {
            MsgType::Noop => Self::Noop,
            MsgType::AllocChunk => Self::AllocChunk {
                chunk_id: r.get_u64()?,
                size: r.get_u64()?,
                requestor: r.get_peer()?,
            },
            MsgType::FreeChunk => Self::FreeChunk {
                chunk_id: r.get_u64()?,
                requestor: r.get_peer()?,
            },
            MsgType::GetPage => Self::GetPage(GetPage {
                chunk_id: r.get_u64()?,
                page: r.get_u64()?,
                flags: get_flags(&mut r)?,
                version: r.get_u64()?,
                after: r.get_u64()?,
                requestor: r.get_peer()?,
            }),
            MsgType::LocatePage => Self::LocatePage {
                chunk_id: r.get_u64()?,
                page: r.get_u64()?,
            },
            MsgType::InvalidatePage => Self::InvalidatePage(Invalidate {
                chunk_id: r.get_u64()?,
                page: r.get_u64()?,
                flags: get_flags(&mut r)?,
                version: r.get_u64()?,
                after: r.get_u64()?,
            }),
            MsgType::Barrier => Self::Barrier,
            MsgType::Terminate => Self::Terminate {
                requestor: r.get_peer()?,
            },
            MsgType::Error => return Err(DecodeError::Invalid("ERROR is reply-only")),
        };
        r.finish()?;
        Ok(request)
    }
}

impl Reply {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Noop => MsgType::Noop,
            Self::AllocChunk { .. } => MsgType::AllocChunk,
            Self::FreeChunk { .. } => MsgType::FreeChunk,
            Self::GetPage { .. } => MsgType::GetPage,
            Self::LocatePage { .. } => MsgType::LocatePage,
            Self::InvalidatePage { .. } => MsgType::InvalidatePage,
            Self::Barrier => MsgType::Barrier,
            Self::Terminate => MsgType::Terminate,
            Self::Error(_) => MsgType::Error,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = WireWriter::new(buf);
        w.put_u32(self.msg_type().code());
        match self {
            Self::Noop | Self::Barrier | Self::Terminate => {}
            Self::AllocChunk { is_owner } => w.put_u8(u8::from(*is_owner)),
            Self::FreeChunk { chunk_id } => w.put_u64(*chunk_id),
            Self::GetPage { version, data } => {
                w.put_u64(*version);
                w.put_bytes(data.as_deref().unwrap_or(&[]));
            }
            Self::LocatePage { owner, accessors } => {
                w.put_peer(owner);
                w.put_u32(accessors.len() as u32);
                for peer in accessors {
                    w.put_peer(peer);
                }
            }
            Self::InvalidatePage { chunk_id, page } => {
                w.put_u64(*chunk_id);
                w.put_u64(*page);
            }
            Self::Error(kind) => w.put_u32(kind.code()),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(body);
        let reply = match get_type(&mut r)? {
            MsgType::Noop => Self::Noop,
            MsgType::AllocChunk => Self::AllocChunk {
                is_owner: r.get_bool()?,
            },
            MsgType::FreeChunk => Self::FreeChunk {
                chunk_id: r.get_u64()?,
            },
            MsgType::GetPage => {
                let version = r.get_u64()?;
                let bytes = r.get_bytes()?;
                Self::GetPage {
                    version,
                    data: (!bytes.is_empty()).then(|| bytes.to_vec()),
                }
            }
            MsgType::LocatePage => {
                let owner = r.get_peer()?;
                let count = r.get_u32()? as usize;
                if count > r.remaining() / MIN_PEER_LEN {
                    return Err(DecodeError::Invalid("accessor count"));
                }
                let mut accessors = Vec::with_capacity(count);
                for _ in 0..count {
                    accessors.push(r.get_peer()?);
                }
                Self::LocatePage { owner, accessors }
            }
            MsgType::InvalidatePage => Self::InvalidatePage {
                chunk_id: r.get_u64()?,
                page: r.get_u64()?,
            },
            MsgType::Barrier => Self::Barrier,
            MsgType::Terminate => Self::Terminate,
            MsgType::Error => Self::Error(
                ErrorKind::from_code(r.get_u32()?).ok_or(DecodeError::Invalid("error kind"))?,
            ),
        };
        r.finish()?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerId {
        PeerId::new("node.local", port)
    }

    fn encoded(request: &Request) -> Vec<u8> {
        let mut buf = Vec::new();
        request.encode(&mut buf);
        buf
    }

    #[test]
    fn test_getpage_layout() {
        let req = Request::GetPage(GetPage {
            chunk_id: 7,
            page: 2,
            flags: PageFlags::WRITE | PageFlags::NOUPDATE,
            requestor: peer(9000),
            version: 11,
            after: 10,
        });
        let buf = encoded(&req);
        assert_eq!(&buf[..4], &3u32.to_be_bytes());
        assert_eq!(&buf[4..12], &7u64.to_be_bytes());
        assert_eq!(&buf[12..20], &2u64.to_be_bytes());
        assert_eq!(&buf[20..24], &5u32.to_be_bytes());
        assert_eq!(Request::decode(&buf), Ok(req));
    }

    #[test]
    fn test_every_request_decodes_to_itself() {
        let requests = [
            Request::Noop,
            Request::AllocChunk {
                chunk_id: u64::MAX,
                size: 3 * 4096 + 1,
                requestor: peer(1),
            },
            Request::FreeChunk {
                chunk_id: 1,
                requestor: peer(2),
            },
            Request::LocatePage {
                chunk_id: 1,
                page: 5,
            },
            Request::InvalidatePage(Invalidate {
                chunk_id: 1,
                page: 0,
                flags: PageFlags::WRITE,
                version: 4,
                after: 3,
            }),
            Request::Barrier,
            Request::Terminate {
                requestor: peer(3),
            },
        ];
        for req in requests {
            assert_eq!(Request::decode(&encoded(&req)).as_ref(), Ok(&req));
        }
    }

    #[test]
    fn test_getpage_reply_payload() {
        let page: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let reply = Reply::GetPage {
            version: 3,
            data: Some(page.clone()),
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(buf.len(), 4 + 8 + 4 + page.len());
        assert_eq!(Reply::decode(&buf), Ok(reply));

        let skipped = Reply::GetPage {
            version: 4,
            data: None,
        };
        buf.clear();
        skipped.encode(&mut buf);
        assert_eq!(Reply::decode(&buf), Ok(skipped));
    }

    #[test]
    fn test_locate_reply_with_accessors() {
        let reply = Reply::LocatePage {
            owner: peer(1),
            accessors: vec![peer(1), peer(2), peer(3)],
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(Reply::decode(&buf), Ok(reply));
    }

    #[test]
    fn test_unknown_type_and_garbage() {
        let mut buf = 99u32.to_be_bytes().to_vec();
        assert_eq!(Request::decode(&buf), Err(DecodeError::UnknownType(99)));

        buf = 1u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0, 1]);
        assert!(matches!(
            Request::decode(&buf),
            Err(DecodeError::Truncated { .. })
        ));

        let mut err = Vec::new();
        Reply::Error(ErrorKind::NoPage).encode(&mut err);
        assert_eq!(Reply::decode(&err), Ok(Reply::Error(ErrorKind::NoPage)));
        assert_eq!(
            Request::decode(&err),
            Err(DecodeError::Invalid("ERROR is reply-only"))
        );
    }

    #[test]
    fn test_oversized_accessor_count_rejected() {
        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf);
        w.put_u32(MsgType::LocatePage.code());
        w.put_peer(&peer(1));
        w.put_u32(u32::MAX);
        assert_eq!(
            Reply::decode(&buf),
            Err(DecodeError::Invalid("accessor count"))
        );
    }

    #[test]
    fn test_idempotence() {
        assert!(Request::Noop.is_idempotent());
        assert!(!Request::Barrier.is_idempotent());
        assert!(!Request::FreeChunk {
            chunk_id: 1,
            requestor: peer(1)
        }
        .is_idempotent());
    }
}
