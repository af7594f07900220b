// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Outgoing command encoding.
//!
//! Commands are ASCII lines terminated by `\n`; body-carrying commands
//! append a 32-bit big-endian size followed by the body.

use crate::message::MessageId;

/// A command to be written to an `nsqd` connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Vec<u8>),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, timeout_ms: u32 },
    Touch(MessageId),
    Cls,
    Auth(Vec<u8>),
    Nop,
    Pub { topic: String, body: Vec<u8> },
    Mpub { topic: String, bodies: Vec<Vec<u8>> },
    Dpub { topic: String, delay_ms: u32, body: Vec<u8> },
}

impl Command {
    /// Serialize this command to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Identify(json) => with_body(b"IDENTIFY\n", json),
            Command::Sub { topic, channel } => format!("SUB {topic} {channel}\n").into_bytes(),
            Command::Rdy(count) => format!("RDY {count}\n").into_bytes(),
            Command::Fin(id) => {
                let mut buf = b"FIN ".to_vec();
                buf.extend_from_slice(id);
                buf.push(b'\n');
                buf
            }
            Command::Req { id, timeout_ms } => {
                let mut buf = b"REQ ".to_vec();
                buf.extend_from_slice(id);
                buf.extend_from_slice(format!(" {timeout_ms}\n").as_bytes());
                buf
            }
            Command::Touch(id) => {
                let mut buf = b"TOUCH ".to_vec();
                buf.extend_from_slice(id);
                buf.push(b'\n');
                buf
            }
            Command::Cls => b"CLS\n".to_vec(),
            Command::Auth(secret) => with_body(b"AUTH\n", secret),
            Command::Nop => b"NOP\n".to_vec(),
            Command::Pub { topic, body } => with_body(format!("PUB {topic}\n").as_bytes(), body),
            Command::Mpub { topic, bodies } => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
                for b in bodies {
                    payload.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    payload.extend_from_slice(b);
                }
                with_body(format!("MPUB {topic}\n").as_bytes(), &payload)
            }
            Command::Dpub { topic, delay_ms, body } => {
                with_body(format!("DPUB {topic} {delay_ms}\n").as_bytes(), body)
            }
        }
    }
}

fn with_body(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header.len() + 4 + body.len());
    buf.extend_from_slice(header);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sub() {
        let cmd = Command::Sub {
            topic: "t".into(),
            channel: "c".into(),
        };
        assert_eq!(cmd.encode(), b"SUB t c\n");
    }

    #[test]
    fn encodes_rdy() {
        assert_eq!(Command::Rdy(10).encode(), b"RDY 10\n");
    }

    #[test]
    fn encodes_fin() {
        let id = *b"0123456789abcdef";
        let mut expected = b"FIN ".to_vec();
        expected.extend_from_slice(&id);
        expected.push(b'\n');
        assert_eq!(Command::Fin(id).encode(), expected);
    }

    #[test]
    fn encodes_req_with_timeout() {
        let id = *b"0123456789abcdef";
        let encoded = Command::Req { id, timeout_ms: 5000 }.encode();
        assert!(encoded.ends_with(b" 5000\n"));
        assert!(encoded.starts_with(b"REQ "));
    }

    #[test]
    fn encodes_identify_with_length_prefixed_body() {
        let json = br#"{"client_id":"x"}"#.to_vec();
        let encoded = Command::Identify(json.clone()).encode();
        assert!(encoded.starts_with(b"IDENTIFY\n"));
        let len_offset = b"IDENTIFY\n".len();
        let len = u32::from_be_bytes(encoded[len_offset..len_offset + 4].try_into().unwrap());
        assert_eq!(len as usize, json.len());
        assert_eq!(&encoded[len_offset + 4..], json.as_slice());
    }

    #[test]
    fn encodes_mpub_batch() {
        let bodies = vec![b"a".to_vec(), b"bb".to_vec()];
        let encoded = Command::Mpub {
            topic: "t".into(),
            bodies: bodies.clone(),
        }
        .encode();
        assert!(encoded.starts_with(b"MPUB t\n"));
    }

    #[test]
    fn encodes_nop_and_cls() {
        assert_eq!(Command::Nop.encode(), b"NOP\n");
        assert_eq!(Command::Cls.encode(), b"CLS\n");
    }
}
