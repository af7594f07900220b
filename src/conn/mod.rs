// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `AsyncConn`: the state machine for a single TCP connection to `nsqd`.
//!
//! One `AsyncConn` owns exactly one socket and walks it through
//! `INIT -> CONNECTING -> NEGOTIATING -> SUBSCRIBED -> CLOSING -> CLOSED`,
//! driven entirely by mio readiness events -- nothing here blocks. The
//! handshake (magic bytes, `IDENTIFY`, optional TLS upgrade, optional
//! compression upgrade, optional `AUTH`) is itself a small sub-state-machine
//! inside `NEGOTIATING`, since each step depends on bytes that may arrive
//! across several readiness events, and the stream-transform stack (TLS,
//! then compression) is built up in that order as each step completes.

pub mod identify;
pub mod pool;

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};

use crate::config::IdentifyConfig;
use crate::conn::identify::NegotiatedFeatures;
use crate::error::{ConnectionError, Error, Result};
use crate::message::Message;
use crate::protocol::{Command, Frame, FrameDecoder, MAGIC_V2};
use crate::reader::ConnCommand;
use crate::transport::ByteStream;
#[cfg(feature = "deflate")]
use crate::transport::DeflateStream;
#[cfg(feature = "snappy")]
use crate::transport::SnappyStream;
#[cfg(feature = "tls")]
use crate::transport::tls::TlsStream;
use crate::{debug, info, warn};

/// Opaque identifier for a connection, stable for its lifetime. Cheap to
/// copy and compare; used to route [`Message`] responses back to the
/// connection that delivered them without the message holding a strong
/// reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    pub(crate) fn new(raw: u64) -> Self {
        ConnId(raw)
    }
}

/// Where an `AsyncConn` is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    /// Magic bytes and `IDENTIFY` queued, waiting for the write to drain.
    SendIdentify,
    /// Waiting for the `IDENTIFY` response frame.
    AwaitIdentifyResponse,
    /// TLS handshake in progress; entered only if `tls_v1` was negotiated.
    TlsHandshake,
    /// Waiting for the `OK` confirming the TLS upgrade. Compression (if also
    /// negotiated) is applied only once this arrives, never before -- each
    /// transform gets its own confirming `OK` rather than sharing one.
    AwaitTlsResponse,
    /// Waiting for the `OK` that follows a compression upgrade (whether or
    /// not it was preceded by a TLS upgrade).
    AwaitUpgradeResponse,
    /// `AUTH` queued; entered only if the broker requires it.
    SendAuth,
    /// Waiting for the `AUTH` response frame.
    AwaitAuthResponse,
}

/// Connection lifecycle state, mirroring the wire handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Negotiating,
    Subscribed,
    Closing,
    Closed,
}

/// Events an `AsyncConn` surfaces to its owner (`Reader` or `Writer`) after
/// processing a readiness notification.
#[derive(Debug)]
pub enum ConnEvent {
    /// The connection finished the full handshake and is ready for use.
    Ready(NegotiatedFeatures),
    /// `AUTH` is required; the owner should call [`AsyncConn::send_auth`].
    AuthRequired,
    /// A message frame was decoded off a subscribed connection.
    Message(Message),
    /// A non-heartbeat, non-message response frame (e.g. the `OK` to `PUB`).
    Response(Vec<u8>),
    /// An `ERROR` frame from the broker.
    Broker { code: String, fatal: bool },
    /// The connection closed, cleanly or otherwise.
    Closed(Option<Error>),
}

/// A single TCP (optionally TLS, optionally compressed) connection to `nsqd`.
pub struct AsyncConn {
    id: ConnId,
    addr: SocketAddr,
    state: ConnState,
    handshake: Option<HandshakeStep>,
    stream: Box<dyn ByteStream>,
    decoder: FrameDecoder,
    write_buf: Vec<u8>,
    write_pos: usize,
    last_recv: Instant,
    heartbeat_interval: Duration,
    is_subscriber: bool,
    topic: String,
    channel: String,
    identify: IdentifyConfig,
    server_host: String,
    negotiated: Option<NegotiatedFeatures>,
    compression_applied: bool,
    commands_tx: crossbeam_channel::Sender<ConnCommand>,
}

impl AsyncConn {
    /// Begin a non-blocking connect. The returned `AsyncConn` is in
    /// `ConnState::Connecting`; drive it with [`on_writable`](Self::on_writable)
    /// once mio reports the socket writable (TCP connect completion).
    pub fn connect(
        id: ConnId,
        addr: SocketAddr,
        topic: &str,
        channel: Option<&str>,
        identify: &IdentifyConfig,
        commands_tx: crossbeam_channel::Sender<ConnCommand>,
    ) -> Result<Self> {
        let raw = MioTcpStream::connect(addr).map_err(ConnectionError::Io)?;
        let _ = raw.set_nodelay(true);

        let identify_json = serde_json::to_vec(identify)?;
        let mut write_buf = Vec::with_capacity(MAGIC_V2.len() + identify_json.len() + 16);
        write_buf.extend_from_slice(MAGIC_V2);
        write_buf.extend_from_slice(&Command::Identify(identify_json).encode());

        Ok(AsyncConn {
            id,
            addr,
            state: ConnState::Connecting,
            handshake: Some(HandshakeStep::SendIdentify),
            stream: Box::new(raw),
            decoder: FrameDecoder::new(crate::protocol::DEFAULT_MAX_FRAME_SIZE),
            write_buf,
            write_pos: 0,
            last_recv: Instant::now(),
            heartbeat_interval: Duration::from_millis(identify.heartbeat_interval.max(0) as u64),
            is_subscriber: channel.is_some(),
            topic: topic.to_string(),
            channel: channel.unwrap_or_default().to_string(),
            identify: identify.clone(),
            server_host: addr.ip().to_string(),
            negotiated: None,
            compression_applied: false,
            commands_tx,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(self.stream.source(), token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(self.stream.source(), token, interests)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(self.stream.source())
    }

    /// Whether the broker has gone quiet for longer than twice the
    /// negotiated heartbeat interval -- the connection should be torn down.
    pub fn heartbeat_timed_out(&self) -> bool {
        self.heartbeat_interval > Duration::ZERO && self.last_recv.elapsed() > self.heartbeat_interval * 2
    }

    /// Queue a command and try to write it immediately -- most of the time
    /// the socket is idle and writable, and mio's edge-triggered `WRITABLE`
    /// only fires again on a readiness *change*, so waiting for the next
    /// event here would stall. A failed flush marks the connection closed;
    /// the caller discovers this via [`state`](Self::state) on its next
    /// pass over the pool rather than through a return value, since `send`
    /// is called from deep inside frame handling where there's no event
    /// list to push onto.
    pub fn send(&mut self, cmd: &Command) {
        self.write_buf.extend_from_slice(&cmd.encode());
        if let Err(e) = self.try_flush() {
            warn!("conn {:?}: write failed, closing: {e}", self.id);
            self.state = ConnState::Closed;
        }
    }

    fn try_flush(&mut self) -> Result<()> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    return Err(ConnectionError::Io(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")).into())
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e).into()),
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Ok(())
    }

    pub fn close_gracefully(&mut self) {
        if self.state != ConnState::Closed {
            self.send(&Command::Cls);
            self.state = ConnState::Closing;
        }
    }

    /// Drive outgoing bytes. Call when mio reports the socket writable.
    pub fn on_writable(&mut self) -> Result<()> {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Negotiating;
        }
        if matches!(self.handshake, Some(HandshakeStep::TlsHandshake)) {
            self.pump_tls()?;
        }

        self.try_flush()?;
        if self.write_pos < self.write_buf.len() {
            return Ok(()); // still blocked; the handshake step advances once the buffer drains
        }

        match self.handshake {
            Some(HandshakeStep::SendIdentify) => self.handshake = Some(HandshakeStep::AwaitIdentifyResponse),
            Some(HandshakeStep::SendAuth) => self.handshake = Some(HandshakeStep::AwaitAuthResponse),
            _ => {}
        }
        Ok(())
    }

    /// Drive incoming bytes, yielding zero or more events. Call when mio
    /// reports the socket readable.
    pub fn on_readable(&mut self) -> Result<Vec<ConnEvent>> {
        let mut events = Vec::new();

        if matches!(self.handshake, Some(HandshakeStep::TlsHandshake)) {
            self.pump_tls()?;
            if matches!(self.handshake, Some(HandshakeStep::TlsHandshake)) {
                return Ok(events); // still handshaking, nothing to decode yet
            }
        }

        loop {
            match self.decoder.decode(&mut self.stream) {
                Ok(Some(frame)) => {
                    self.last_recv = Instant::now();
                    if let Some(event) = self.handle_frame(frame)? {
                        events.push(event);
                    }
                }
                Ok(None) => break,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.state = ConnState::Closed;
                    events.push(ConnEvent::Closed(Some(e)));
                    break;
                }
            }
        }
        Ok(events)
    }

    #[cfg(feature = "tls")]
    fn pump_tls(&mut self) -> Result<()> {
        // The stream was already swapped for a `TlsStream` in
        // `begin_tls_upgrade`; driving it further is just a read/write
        // no-op that advances the embedded rustls state machine. Once the
        // handshake completes we wait for the TLS-confirming `OK` before
        // touching compression -- applying it any earlier would wrap the
        // stream before the server's own TLS-only `OK` has been read,
        // corrupting it.
        let mut scratch = [0u8; 0];
        match self.stream.read(&mut scratch) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(ConnectionError::Io(e).into()),
        }
        if !self.stream.is_handshaking() {
            self.handshake = Some(HandshakeStep::AwaitTlsResponse);
        }
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    fn pump_tls(&mut self) -> Result<()> {
        Err(ConnectionError::TlsHandshakeFailed("tls_v1 negotiated but the `tls` feature is disabled".into()).into())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<ConnEvent>> {
        if frame.is_heartbeat() {
            debug!("conn {:?}: heartbeat, replying NOP", self.id);
            self.send(&Command::Nop);
            return Ok(None);
        }

        match self.handshake {
            Some(HandshakeStep::AwaitIdentifyResponse) => self.handle_identify_response(frame),
            Some(HandshakeStep::AwaitTlsResponse) => match frame {
                Frame::Response(_) => {
                    let negotiated = self.negotiated.clone().expect("negotiated features set before the TLS handshake begins");
                    if negotiated.snappy || negotiated.deflate {
                        self.apply_compression(&negotiated)?;
                        self.compression_applied = true;
                        self.handshake = Some(HandshakeStep::AwaitUpgradeResponse);
                        Ok(None)
                    } else {
                        self.handshake = None;
                        self.after_upgrades()
                    }
                }
                Frame::Error(b) => Err(Error::Broker {
                    code: "E_BAD_BODY".to_string(),
                    message: String::from_utf8_lossy(&b).into_owned(),
                    fatal: true,
                }),
                Frame::Message(_) => Err(ConnectionError::HeartbeatTimeout.into()),
            },
            Some(HandshakeStep::AwaitUpgradeResponse) => match frame {
                Frame::Response(_) => {
                    self.handshake = None;
                    self.after_upgrades()
                }
                Frame::Error(b) => Err(Error::Broker {
                    code: "E_BAD_BODY".to_string(),
                    message: String::from_utf8_lossy(&b).into_owned(),
                    fatal: true,
                }),
                Frame::Message(_) => Err(ConnectionError::HeartbeatTimeout.into()),
            },
            Some(HandshakeStep::AwaitAuthResponse) => match frame {
                Frame::Response(_) => {
                    self.handshake = None;
                    self.finish_negotiation();
                    Ok(self.negotiated.clone().map(ConnEvent::Ready))
                }
                Frame::Error(b) => Err(Error::Broker {
                    code: "E_AUTH_FAILED".to_string(),
                    message: String::from_utf8_lossy(&b).into_owned(),
                    fatal: true,
                }),
                Frame::Message(_) => Err(ConnectionError::HeartbeatTimeout.into()),
            },
            _ => self.handle_steady_state_frame(frame),
        }
    }

    fn handle_identify_response(&mut self, frame: Frame) -> Result<Option<ConnEvent>> {
        let body = match &frame {
            Frame::Response(b) => b,
            Frame::Error(b) => {
                return Err(Error::Broker {
                    code: "E_BAD_BODY".to_string(),
                    message: String::from_utf8_lossy(b).into_owned(),
                    fatal: true,
                })
            }
            Frame::Message(_) => return Err(ConnectionError::HeartbeatTimeout.into()),
        };
        // A pre-feature-negotiation `nsqd` (< 0.2.28) answers IDENTIFY with a
        // plain `OK` instead of a JSON blob: no feature negotiation took
        // place, so every negotiable feature falls back to its default.
        if body.as_slice() == crate::protocol::OK_RESPONSE.as_bytes() {
            self.handshake = None;
            self.negotiated = Some(NegotiatedFeatures::legacy());
            return self.after_upgrades();
        }
        let negotiated: NegotiatedFeatures = serde_json::from_slice(body)?;
        self.negotiated = Some(negotiated.clone());

        if negotiated.tls_v1 {
            self.begin_tls_upgrade()?;
            return Ok(None);
        }
        if negotiated.snappy || negotiated.deflate {
            self.apply_compression(&negotiated)?;
            self.compression_applied = true;
            self.handshake = Some(HandshakeStep::AwaitUpgradeResponse);
            return Ok(None);
        }
        self.handshake = None;
        self.after_upgrades()
    }

    #[cfg(feature = "tls")]
    fn begin_tls_upgrade(&mut self) -> Result<()> {
        let tls_config = self.identify.tls_config.clone().unwrap_or_default();
        let placeholder: Box<dyn ByteStream> = Box::new(NullStream);
        let inner = std::mem::replace(&mut self.stream, placeholder);
        let tls = TlsStream::connect(inner, &self.server_host, &tls_config)?;
        self.stream = Box::new(tls);
        self.handshake = Some(HandshakeStep::TlsHandshake);
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    fn begin_tls_upgrade(&mut self) -> Result<()> {
        Err(ConnectionError::TlsHandshakeFailed("tls_v1 negotiated but the `tls` feature is disabled".into()).into())
    }

    /// Called once the single `OK` that follows every upgrade arrives (or
    /// immediately, if nothing needed upgrading).
    fn after_upgrades(&mut self) -> Result<Option<ConnEvent>> {
        let negotiated = self.negotiated.clone().expect("negotiated features set before upgrades begin");
        if negotiated.auth_required {
            self.handshake = Some(HandshakeStep::SendAuth);
            return Ok(Some(ConnEvent::AuthRequired));
        }
        self.finish_negotiation();
        Ok(Some(ConnEvent::Ready(negotiated)))
    }

    fn apply_compression(&mut self, negotiated: &NegotiatedFeatures) -> Result<()> {
        if negotiated.snappy {
            #[cfg(feature = "snappy")]
            {
                let placeholder: Box<dyn ByteStream> = Box::new(NullStream);
                let inner = std::mem::replace(&mut self.stream, placeholder);
                self.stream = Box::new(SnappyStream::new(inner));
            }
            #[cfg(not(feature = "snappy"))]
            return Err(ConnectionError::CompressionHandshakeFailed("snappy negotiated but the `snappy` feature is disabled".into()).into());
        } else if negotiated.deflate {
            #[cfg(feature = "deflate")]
            {
                let placeholder: Box<dyn ByteStream> = Box::new(NullStream);
                let inner = std::mem::replace(&mut self.stream, placeholder);
                self.stream = Box::new(DeflateStream::new(inner, negotiated.deflate_level.max(0) as u32));
            }
            #[cfg(not(feature = "deflate"))]
            return Err(ConnectionError::CompressionHandshakeFailed("deflate negotiated but the `deflate` feature is disabled".into()).into());
        }
        Ok(())
    }

    fn handle_steady_state_frame(&mut self, frame: Frame) -> Result<Option<ConnEvent>> {
        match frame {
            Frame::Message(mf) => {
                if !self.is_subscriber {
                    warn!("conn {:?}: unexpected MESSAGE frame on a publish-only connection", self.id);
                    return Ok(None);
                }
                let msg = Message::new(mf.id, mf.body, mf.timestamp, mf.attempts, self.id, self.commands_tx.clone());
                Ok(Some(ConnEvent::Message(msg)))
            }
            Frame::Error(b) => {
                let text = String::from_utf8_lossy(&b);
                let recoverable = text.starts_with("E_REQ_FAILED") || text.starts_with("E_FIN_FAILED") || text.starts_with("E_TOUCH_FAILED");
                Ok(Some(ConnEvent::Broker {
                    code: text.split_whitespace().next().unwrap_or("E_UNKNOWN").to_string(),
                    fatal: !recoverable,
                }))
            }
            Frame::Response(b) => Ok(Some(ConnEvent::Response(b))),
        }
    }

    fn finish_negotiation(&mut self) {
        if self.is_subscriber {
            self.send(&Command::Sub {
                topic: self.topic.clone(),
                channel: self.channel.clone(),
            });
        }
        self.state = ConnState::Subscribed;
        info!("conn {:?} ({}) negotiated", self.id, self.addr);
    }

    pub fn send_auth(&mut self, secret: &[u8]) {
        self.send(&Command::Auth(secret.to_vec()));
    }

}

/// Placeholder used only for the instant between taking ownership of
/// `self.stream` to wrap it and putting the wrapped version back; never
/// actually read from or written to.
struct NullStream;

impl Read for NullStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "placeholder stream"))
    }
}

impl Write for NullStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "placeholder stream"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for NullStream {
    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "placeholder stream"))
    }

    fn source(&mut self) -> &mut dyn mio::event::Source {
        panic!("NullStream is never registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentifyConfig;
    use crate::transport::MockStream;

    fn encode_frame(frame_type: u32, payload: &[u8]) -> Vec<u8> {
        let size = (payload.len() + 4) as u32;
        let mut buf = Vec::with_capacity(8 + payload.len());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&frame_type.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Builds an `AsyncConn` already past the socket-connect step (which
    /// `MockStream` can't participate in, being unpollable) and parked at
    /// `AwaitIdentifyResponse` -- exactly where a real connection is the
    /// instant its IDENTIFY write drains.
    fn test_conn(topic: &str, channel: Option<&str>) -> (AsyncConn, MockStream, crossbeam_channel::Receiver<ConnCommand>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stream = MockStream::new();
        let conn = AsyncConn {
            id: ConnId::new(1),
            addr: "127.0.0.1:4150".parse().unwrap(),
            state: ConnState::Negotiating,
            handshake: Some(HandshakeStep::AwaitIdentifyResponse),
            stream: Box::new(stream.clone()),
            decoder: FrameDecoder::new(crate::protocol::DEFAULT_MAX_FRAME_SIZE),
            write_buf: Vec::new(),
            write_pos: 0,
            last_recv: Instant::now(),
            heartbeat_interval: Duration::from_millis(30_000),
            is_subscriber: channel.is_some(),
            topic: topic.to_string(),
            channel: channel.unwrap_or_default().to_string(),
            identify: IdentifyConfig::default(),
            server_host: "127.0.0.1".to_string(),
            negotiated: None,
            compression_applied: false,
            commands_tx: tx,
        };
        (conn, stream, rx)
    }

    #[test]
    fn legacy_ok_response_completes_negotiation_and_subs() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        stream.feed(&encode_frame(0, crate::protocol::OK_RESPONSE.as_bytes()));

        let events = conn.on_readable().unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::Ready(f)] if f.max_rdy_count == 2500));
        assert_eq!(conn.state(), ConnState::Subscribed);
        assert!(stream.written().starts_with(b"SUB topic channel\n"));
    }

    #[test]
    fn json_response_with_no_upgrades_completes_negotiation() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        stream.feed(&encode_frame(0, br#"{"max_rdy_count": 10}"#));

        let events = conn.on_readable().unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::Ready(f)] if f.max_rdy_count == 10));
        assert_eq!(conn.state(), ConnState::Subscribed);
    }

    #[test]
    fn auth_required_surfaces_event_before_ready() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        stream.feed(&encode_frame(0, br#"{"auth_required": true}"#));

        let events = conn.on_readable().unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::AuthRequired]));
        assert_eq!(conn.state(), ConnState::Negotiating);

        conn.send_auth(b"secret");
        let mut expected = b"AUTH\n".to_vec();
        expected.extend_from_slice(&6u32.to_be_bytes());
        expected.extend_from_slice(b"secret");
        assert_eq!(stream.written(), expected);

        stream.feed(&encode_frame(0, b"OK"));
        let events = conn.on_readable().unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::Ready(_)]));
        assert_eq!(conn.state(), ConnState::Subscribed);
    }

    #[test]
    #[cfg(feature = "snappy")]
    fn tls_and_compression_each_wait_for_their_own_ok() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        conn.negotiated = Some(NegotiatedFeatures {
            tls_v1: true,
            snappy: true,
            deflate: false,
            deflate_level: 0,
            auth_required: false,
            max_rdy_count: 2500,
            max_msg_timeout: 0,
            msg_timeout: 0,
        });
        conn.handshake = Some(HandshakeStep::AwaitTlsResponse);

        // The TLS-confirming OK arrives first, still unwrapped by compression.
        stream.feed(&encode_frame(0, b"OK"));
        let events = conn.on_readable().unwrap();
        assert!(events.is_empty());
        assert_eq!(conn.handshake, Some(HandshakeStep::AwaitUpgradeResponse));
        assert!(conn.compression_applied);

        // The compression-confirming OK arrives second, snappy-compressed --
        // reading it before compression was applied would have corrupted it.
        let plain = encode_frame(0, b"OK");
        let compressed = snap::raw::Encoder::new().compress_vec(&plain).unwrap();
        let mut block = (compressed.len() as u32).to_be_bytes().to_vec();
        block.extend_from_slice(&compressed);
        stream.feed(&block);

        let events = conn.on_readable().unwrap();
        assert!(matches!(events.as_slice(), [ConnEvent::Ready(_)]));
        assert_eq!(conn.state(), ConnState::Subscribed);
    }

    #[test]
    fn identify_error_frame_is_fatal() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        stream.feed(&encode_frame(1, b"E_BAD_BODY bad"));

        let err = conn.on_readable().unwrap_err();
        assert!(matches!(err, Error::Broker { fatal: true, .. }));
    }

    #[test]
    fn heartbeat_replies_nop_and_updates_last_recv() {
        let (mut conn, stream, _rx) = test_conn("topic", Some("channel"));
        conn.handshake = None;
        conn.state = ConnState::Subscribed;
        let before = conn.last_recv;
        stream.feed(&encode_frame(0, crate::protocol::HEARTBEAT_RESPONSE.as_bytes()));

        let events = conn.on_readable().unwrap();
        assert!(events.is_empty());
        assert!(stream.written().ends_with(b"NOP\n"));
        assert!(conn.last_recv >= before);
    }

    #[test]
    fn message_frame_on_publish_only_connection_is_dropped() {
        let (mut conn, stream, _rx) = test_conn("topic", None);
        conn.handshake = None;
        conn.state = ConnState::Subscribed;
        let id = [b'a'; 16];
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&id);
        payload.extend_from_slice(b"body");
        stream.feed(&encode_frame(2, &payload));

        let events = conn.on_readable().unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn send_marks_connection_closed_on_write_failure() {
        let (mut conn, _stream, _rx) = test_conn("topic", Some("channel"));
        conn.stream = Box::new(AlwaysErrorStream);
        conn.send(&Command::Nop);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    struct AlwaysErrorStream;

    impl Read for AlwaysErrorStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
        }
    }

    impl Write for AlwaysErrorStream {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "nope"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteStream for AlwaysErrorStream {
        fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:4150".parse().unwrap())
        }

        fn source(&mut self) -> &mut dyn mio::event::Source {
            panic!("AlwaysErrorStream is never registered")
        }
    }
}
