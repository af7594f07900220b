// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental decoding of frames from a streaming TCP socket.
//!
//! A length-prefix `FrameCodec` generalized from a single `[len][payload]`
//! frame to NSQ's `[len][frame_type][payload]` frame and from opaque bytes to
//! the three NSQ frame types.

use std::io::{self, Read};

use crate::error::{Error, ProtocolError};
use crate::message::MessageId;

const HEADER_LEN: usize = 8; // 4-byte size + 4-byte frame type
const MESSAGE_ID_LEN: usize = 16;

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

pub const HEARTBEAT_RESPONSE: &str = "_heartbeat_";
pub const OK_RESPONSE: &str = "OK";
pub const CLOSE_WAIT_RESPONSE: &str = "CLOSE_WAIT";

/// A decoded message frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Vec<u8>,
}

/// A fully decoded NSQ frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A response frame. `"OK"` and `"_heartbeat_"` are handled specially by
    /// the caller; anything else is either a legacy plain-text response or
    /// (when feature negotiation is on) a JSON blob, which callers parse
    /// themselves based on what they just sent.
    Response(Vec<u8>),
    /// An error frame, e.g. `E_BAD_TOPIC the topic name is invalid`.
    Error(Vec<u8>),
    /// A message frame.
    Message(MessageFrame),
}

impl Frame {
    /// True if this is the special `_heartbeat_` response.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(b) if b == HEARTBEAT_RESPONSE.as_bytes())
    }

    /// True if this is the plain `OK` response.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(b) if b == OK_RESPONSE.as_bytes())
    }
}

fn decode_message_payload(payload: &[u8]) -> Result<MessageFrame, Error> {
    if payload.len() < 8 + 2 + MESSAGE_ID_LEN {
        return Err(ProtocolError::Encoding("message frame too short".into()).into());
    }
    let timestamp = i64::from_be_bytes(payload[0..8].try_into().unwrap());
    let attempts = u16::from_be_bytes(payload[8..10].try_into().unwrap());
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(&payload[10..10 + MESSAGE_ID_LEN]);
    let body = payload[10 + MESSAGE_ID_LEN..].to_vec();
    Ok(MessageFrame {
        timestamp,
        attempts,
        id,
        body,
    })
}

fn decode_payload(frame_type: u32, payload: Vec<u8>) -> Result<Frame, Error> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(payload)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(payload)),
        FRAME_TYPE_MESSAGE => Ok(Frame::Message(decode_message_payload(&payload)?)),
        other => Err(ProtocolError::UnknownFrameType(other).into()),
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header { read: usize },
    Payload { frame_type: u32, len: usize, read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Header { read: 0 }
    }
}

/// Incremental NSQ frame decoder over a non-blocking byte source.
///
/// A `ReadingLength` / `ReadingBody` state machine, extended to split the
/// 4-byte frame-type word out of the payload before handing callers a typed
/// [`Frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    state: ReadState,
    header_buf: [u8; HEADER_LEN],
    body_buf: Vec<u8>,
    max_size: u32,
    frames_decoded: u64,
    bytes_decoded: u64,
}

impl FrameDecoder {
    pub fn new(max_size: u32) -> Self {
        Self {
            state: ReadState::default(),
            header_buf: [0u8; HEADER_LEN],
            body_buf: Vec::new(),
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn reset(&mut self) {
        self.state = ReadState::default();
    }

    /// Try to decode one complete frame from `reader`.
    ///
    /// `Ok(None)` means "not enough data yet" (the caller should return to
    /// polling); any I/O error with kind `WouldBlock` is translated into
    /// `Ok(None)` as well so callers never have to special-case it.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Option<Frame>, Error> {
        loop {
            match self.state {
                ReadState::Header { read } => match reader.read(&mut self.header_buf[read..]) {
                    Ok(0) => {
                        if read == 0 {
                            return Err(ProtocolError::UnexpectedEof.into());
                        }
                        return Err(ProtocolError::UnexpectedEof.into());
                    }
                    Ok(n) => {
                        let total = read + n;
                        if total < HEADER_LEN {
                            self.state = ReadState::Header { read: total };
                            continue;
                        }
                        let size = u32::from_be_bytes(self.header_buf[0..4].try_into().unwrap());
                        let frame_type = u32::from_be_bytes(self.header_buf[4..8].try_into().unwrap());
                        let payload_len = size.saturating_sub(4);
                        if payload_len > self.max_size {
                            self.state = ReadState::default();
                            return Err(ProtocolError::FrameTooLarge {
                                size,
                                max: self.max_size,
                            }
                            .into());
                        }
                        self.body_buf = vec![0u8; payload_len as usize];
                        if payload_len == 0 {
                            self.frames_decoded += 1;
                            self.state = ReadState::default();
                            return Ok(Some(decode_payload(frame_type, Vec::new())?));
                        }
                        self.state = ReadState::Payload {
                            frame_type,
                            len: payload_len as usize,
                            read: 0,
                        };
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = ReadState::Header { read };
                        return Ok(None);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
                ReadState::Payload { frame_type, len, read } => {
                    match reader.read(&mut self.body_buf[read..len]) {
                        Ok(0) => return Err(ProtocolError::UnexpectedEof.into()),
                        Ok(n) => {
                            let total = read + n;
                            if total < len {
                                self.state = ReadState::Payload {
                                    frame_type,
                                    len,
                                    read: total,
                                };
                                continue;
                            }
                            self.frames_decoded += 1;
                            self.bytes_decoded += len as u64;
                            let payload = std::mem::take(&mut self.body_buf);
                            self.state = ReadState::default();
                            return Ok(Some(decode_payload(frame_type, payload)?));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Payload { frame_type, len, read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_frame(frame_type: u32, payload: &[u8]) -> Vec<u8> {
        let size = (payload.len() + 4) as u32;
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&frame_type.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decodes_ok_response() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(0, b"OK");
        let mut cur = Cursor::new(frame);
        let decoded = dec.decode(&mut cur).unwrap().unwrap();
        assert!(matches!(decoded, Frame::Response(ref b) if b == b"OK"));
        assert!(decoded.is_ok());
    }

    #[test]
    fn decodes_heartbeat() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(0, HEARTBEAT_RESPONSE.as_bytes());
        let mut cur = Cursor::new(frame);
        let decoded = dec.decode(&mut cur).unwrap().unwrap();
        assert!(decoded.is_heartbeat());
    }

    #[test]
    fn decodes_error_frame() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(1, b"E_BAD_TOPIC invalid topic name");
        let mut cur = Cursor::new(frame);
        match dec.decode(&mut cur).unwrap().unwrap() {
            Frame::Error(b) => assert_eq!(&b, b"E_BAD_TOPIC invalid topic name"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_message_frame() {
        let mut dec = FrameDecoder::new(1024);
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(b"0123456789abcdef");
        payload.extend_from_slice(b"hello");
        let frame = encode_frame(2, &payload);
        let mut cur = Cursor::new(frame);
        match dec.decode(&mut cur).unwrap().unwrap() {
            Frame::Message(m) => {
                assert_eq!(m.timestamp, 1_700_000_000_000_000_000);
                assert_eq!(m.attempts, 1);
                assert_eq!(&m.id, b"0123456789abcdef");
                assert_eq!(m.body, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut dec = FrameDecoder::new(4);
        let frame = encode_frame(0, b"this is definitely too big");
        let mut cur = Cursor::new(frame);
        let err = dec.decode(&mut cur).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(99, b"x");
        let mut cur = Cursor::new(frame);
        let err = dec.decode(&mut cur).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownFrameType(99))));
    }

    #[test]
    fn partial_header_then_body_across_reads() {
        let mut dec = FrameDecoder::new(1024);
        let frame = encode_frame(0, b"OK");
        // Feed byte-by-byte via a reader that yields WouldBlock at the end.
        struct Slow<'a>(&'a [u8], usize);
        impl<'a> Read for Slow<'a> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                buf[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }
        let mut slow = Slow(&frame, 0);
        let mut result = None;
        for _ in 0..frame.len() + 1 {
            if let Some(f) = dec.decode(&mut slow).unwrap() {
                result = Some(f);
                break;
            }
        }
        assert!(matches!(result, Some(Frame::Response(ref b)) if b == b"OK"));
    }

    #[test]
    fn round_trips_various_body_sizes() {
        for size in [0usize, 1, 100, 4096, 65536] {
            let mut dec = FrameDecoder::new(1024 * 1024);
            let body: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let frame = encode_frame(1, &body);
            let mut cur = Cursor::new(frame);
            match dec.decode(&mut cur).unwrap().unwrap() {
                Frame::Error(b) => assert_eq!(b, body),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
