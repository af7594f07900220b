// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The NSQ TCP wire protocol: frame decoding and command encoding.
//!
//! ```text
//! [ 4-byte size ][ 4-byte frame type ][ size - 4 bytes payload ]
//! ```
//!
//! See [`frame`] for the incoming direction and [`command`] for the outgoing
//! direction. Both sides agree that everything is big-endian.

mod command;
mod frame;

pub use command::Command;
pub use frame::{Frame, FrameDecoder, HEARTBEAT_RESPONSE, MessageFrame, OK_RESPONSE};

/// Magic bytes sent once, immediately after connecting, before anything else.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Default maximum frame size accepted from the broker (anti-OOM).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
