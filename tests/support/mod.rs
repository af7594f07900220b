// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A minimal hand-rolled `nsqd` stand-in: just enough of the wire protocol
//! to drive a `Reader`/`Writer` through a handshake and a few frames, over a
//! real loopback `TcpListener` rather than anything mocked.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

pub const RESPONSE: u32 = 0;
pub const ERROR: u32 = 1;
pub const MESSAGE: u32 = 2;

pub fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("local_addr").to_string();
    (listener, addr)
}

pub fn accept(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().expect("accept incoming connection");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

pub fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}

/// Reads one ASCII command line (everything up to and excluding `\n`).
pub fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).expect("read command byte");
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8(buf).expect("command line is ASCII")
}

/// Reads a command line followed by a 4-byte-length-prefixed body, as
/// `IDENTIFY`/`AUTH`/`PUB`/`MPUB`/`DPUB` all send.
pub fn read_line_with_body(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let line = read_line(stream);
    let len = u32::from_be_bytes(read_exact_n(stream, 4).try_into().unwrap());
    let body = read_exact_n(stream, len as usize);
    (line, body)
}

/// Reads lines from `stream`, skipping ones for which `skip` returns true,
/// until one satisfies `skip == false`, and returns it. Used to tolerate a
/// variable number of `RDY` refreshes interleaved with the command under test.
pub fn read_line_skipping(stream: &mut TcpStream, skip: impl Fn(&str) -> bool) -> String {
    loop {
        let line = read_line(stream);
        if !skip(&line) {
            return line;
        }
    }
}

/// Reads whatever bytes are already buffered (or arrive within `idle`),
/// split into complete lines; a trailing partial line (no terminating `\n`
/// within the window) is discarded. Used where the number of `RDY` refreshes
/// leading up to a steady state isn't fixed.
pub fn drain_lines(stream: &mut TcpStream, idle: Duration) -> Vec<String> {
    stream.set_read_timeout(Some(idle)).unwrap();
    let mut lines = Vec::new();
    let mut current = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    lines.push(String::from_utf8(std::mem::take(&mut current)).expect("ASCII command line"));
                } else {
                    current.push(byte[0]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    lines
}

pub fn write_frame(stream: &mut TcpStream, frame_type: u32, payload: &[u8]) {
    let size = (payload.len() + 4) as u32;
    stream.write_all(&size.to_be_bytes()).unwrap();
    stream.write_all(&frame_type.to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

pub fn write_message_frame(stream: &mut TcpStream, id: &[u8; 16], body: &[u8], timestamp: i64, attempts: u16) {
    let mut payload = Vec::with_capacity(8 + 2 + 16 + body.len());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&attempts.to_be_bytes());
    payload.extend_from_slice(id);
    payload.extend_from_slice(body);
    write_frame(stream, MESSAGE, &payload);
}

/// Default `IDENTIFY` response: feature negotiation on, nothing upgraded.
pub fn identify_response_json() -> Vec<u8> {
    br#"{"tls_v1":false,"snappy":false,"deflate":false,"auth_required":false,"max_rdy_count":2500,"max_msg_timeout":900000,"msg_timeout":60000}"#.to_vec()
}

/// Reads the magic bytes and the `IDENTIFY` command, returning the raw JSON
/// body the client sent (so a test can assert on `client_id`/`heartbeat_interval`/etc).
pub fn read_magic_and_identify(stream: &mut TcpStream) -> Vec<u8> {
    let magic = read_exact_n(stream, 4);
    assert_eq!(&magic, b"  V2", "client must send the V2 magic before anything else");
    let (line, body) = read_line_with_body(stream);
    assert_eq!(line, "IDENTIFY");
    body
}

/// Drives a subscriber connection through the full handshake: magic,
/// `IDENTIFY` (responding with no feature upgrades), `SUB` (responding `OK`).
/// Returns the raw `IDENTIFY` body the client sent.
pub fn handshake_subscriber(stream: &mut TcpStream, topic: &str, channel: &str) -> Vec<u8> {
    let identify_body = read_magic_and_identify(stream);
    write_frame(stream, RESPONSE, &identify_response_json());

    let sub_line = read_line(stream);
    assert_eq!(sub_line, format!("SUB {topic} {channel}"));
    write_frame(stream, RESPONSE, b"OK");

    identify_body
}

/// Drives a publish-only connection (`Writer`) through the handshake: magic,
/// `IDENTIFY` (no upgrades). There is no `SUB` on a publish-only connection.
pub fn handshake_publisher(stream: &mut TcpStream) -> Vec<u8> {
    let identify_body = read_magic_and_identify(stream);
    write_frame(stream, RESPONSE, &identify_response_json());
    identify_body
}
