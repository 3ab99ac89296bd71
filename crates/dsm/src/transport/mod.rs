// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message transport: framing, outbound peer links and the request server.

mod connection;
mod frame;
mod server;

pub use connection::{PeerConnection, ReplyWait};
pub use frame::{FrameCodec, FRAME_HEADER_SIZE};
pub use server::{RequestHandler, RequestServer};
