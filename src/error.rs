// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error type.
//!
//! Mirrors the error kinds called out by the NSQ client design: protocol
//! framing errors, message-integrity errors, connection/transport errors,
//! broker-sent error frames, and configuration errors. Configuration errors
//! are the only variant returned synchronously from a constructor; every
//! other variant surfaces through the Reader's event/handler callback path.

use std::fmt;
use std::io;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this crate.
#[derive(Debug)]
pub enum Error {
    /// Malformed wire data: bad frame, oversized size, unexpected frame type.
    Protocol(ProtocolError),
    /// A value that should be a fixed-format identifier wasn't (e.g. message id length).
    Integrity(IntegrityError),
    /// Socket, TLS negotiation, or compression handshake failure.
    Connection(ConnectionError),
    /// The broker sent an `ERROR` frame.
    Broker {
        /// The NSQ error code, e.g. `E_BAD_TOPIC`.
        code: String,
        /// Human-readable description from the frame body.
        message: String,
        /// Whether this error is fatal to the connection (per the NSQ protocol,
        /// codes outside `E_FIN_FAILED`/`E_REQ_FAILED`/`E_TOUCH_FAILED` close it).
        fatal: bool,
    },
    /// Invalid configuration, caught at construction.
    Config(ConfigError),
    /// Underlying I/O error not otherwise classified.
    Io(io::Error),
}

/// Sub-kinds of [`Error::Protocol`].
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame declared a size exceeding the configured maximum.
    FrameTooLarge { size: u32, max: u32 },
    /// Frame type byte was not 0 (response), 1 (error), or 2 (message).
    UnknownFrameType(u32),
    /// Connection closed mid-frame.
    UnexpectedEof,
    /// A command or JSON payload could not be encoded/decoded.
    Encoding(String),
}

/// Sub-kinds of [`Error::Integrity`].
#[derive(Debug)]
pub enum IntegrityError {
    /// Message id was not exactly 16 bytes.
    BadMessageIdLength(usize),
}

/// Sub-kinds of [`Error::Connection`].
#[derive(Debug)]
pub enum ConnectionError {
    /// The server closed the socket or timed out on the heartbeat.
    HeartbeatTimeout,
    /// TLS handshake did not complete as negotiated.
    TlsHandshakeFailed(String),
    /// Compression stream could not be established.
    CompressionHandshakeFailed(String),
    /// Generic socket failure.
    Io(io::Error),
}

/// Sub-kinds of [`Error::Config`].
#[derive(Debug)]
pub enum ConfigError {
    /// `topic` or `channel` failed the `[.a-zA-Z0-9_-]{1,64}(#ephemeral)?` pattern.
    InvalidName { field: &'static str, value: String },
    /// `max_in_flight` was negative.
    NegativeMaxInFlight(i64),
    /// Neither `nsqd_tcp_addresses` nor `lookupd_http_addresses` were configured.
    NoProducerSource,
    /// `auth_secret` was required by a later step but never configured.
    MissingAuthSecret,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Integrity(e) => write!(f, "integrity error: {e}"),
            Error::Connection(e) => write!(f, "connection error: {e}"),
            Error::Broker { code, message, .. } => write!(f, "broker error {code}: {message}"),
            Error::Config(e) => write!(f, "config error: {e}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {size} bytes (max {max})")
            }
            ProtocolError::UnknownFrameType(t) => write!(f, "unknown frame type: {t}"),
            ProtocolError::UnexpectedEof => write!(f, "connection closed mid-frame"),
            ProtocolError::Encoding(msg) => write!(f, "encoding error: {msg}"),
        }
    }
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::BadMessageIdLength(n) => {
                write!(f, "message id must be 16 bytes, got {n}")
            }
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            ConnectionError::TlsHandshakeFailed(msg) => write!(f, "TLS handshake failed: {msg}"),
            ConnectionError::CompressionHandshakeFailed(msg) => {
                write!(f, "compression handshake failed: {msg}")
            }
            ConnectionError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidName { field, value } => {
                write!(f, "invalid {field}: {value:?}")
            }
            ConfigError::NegativeMaxInFlight(v) => write!(f, "max_in_flight must be >= 0, got {v}"),
            ConfigError::NoProducerSource => {
                write!(f, "neither nsqd_tcp_addresses nor lookupd_http_addresses configured")
            }
            ConfigError::MissingAuthSecret => {
                write!(f, "server requires AUTH but no auth_secret was configured")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Connection(ConnectionError::Io(e)) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::Connection(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(ProtocolError::Encoding(e.to_string()))
    }
}
