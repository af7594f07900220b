// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side TLS upgrade for an established `nsqd` TCP connection, via
//! rustls.
//!
//! `nsqd` only ever plays the server role in this handshake (the `tls`
//! negotiation happens as a plain client connecting out), so unlike the
//! transport this was adapted from, there is no server/acceptor half here.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::TlsConfig;
use crate::error::{ConnectionError, Error, Result};

use super::ByteStream;

fn build_client_config(cfg: &TlsConfig) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_pem) = &cfg.root_ca_pem {
        for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
            let cert = cert.map_err(|e| {
                Error::Connection(ConnectionError::TlsHandshakeFailed(format!(
                    "invalid root_ca_pem: {e}"
                )))
            })?;
            let _ = roots.add(cert);
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    let config = match (&cfg.cert_chain_pem, &cfg.private_key_pem) {
        (Some(chain_pem), Some(key_pem)) => {
            let chain: Vec<_> = rustls_pemfile::certs(&mut &chain_pem[..])
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    Error::Connection(ConnectionError::TlsHandshakeFailed(format!(
                        "invalid cert_chain_pem: {e}"
                    )))
                })?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| {
                    Error::Connection(ConnectionError::TlsHandshakeFailed(format!(
                        "invalid private_key_pem: {e}"
                    )))
                })?
                .ok_or_else(|| {
                    Error::Connection(ConnectionError::TlsHandshakeFailed(
                        "no private key found in private_key_pem".into(),
                    ))
                })?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::Connection(ConnectionError::TlsHandshakeFailed(e.to_string())))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(config)
}

/// A TLS-wrapped connection to `nsqd`, established via
/// [`upgrade`](Self::upgrade) once the plain-TCP `IDENTIFY` round trip
/// negotiates `tls_v1: true`.
pub struct TlsStream<S: ByteStream> {
    inner: S,
    conn: ClientConnection,
}

impl<S: ByteStream> TlsStream<S> {
    /// Begin a non-blocking client handshake over `inner`. The handshake
    /// itself is driven by subsequent `read`/`write` calls as the connection
    /// becomes readable/writable; callers should keep pumping the event loop
    /// until [`is_handshaking`](Self::is_handshaking) returns `false`.
    pub fn connect(inner: S, server_name: &str, cfg: &TlsConfig) -> Result<Self> {
        let client_config = build_client_config(cfg)?;
        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            Error::Connection(ConnectionError::TlsHandshakeFailed(format!(
                "invalid server name {server_name:?}: {e}"
            )))
        })?;
        let conn = ClientConnection::new(Arc::new(client_config), name)
            .map_err(|e| Error::Connection(ConnectionError::TlsHandshakeFailed(e.to_string())))?;
        Ok(Self { inner, conn })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Pump the handshake: read any available ciphertext, process it, flush
    /// any outgoing handshake records. Non-blocking; returns `Ok(())` even if
    /// the handshake did not complete this call.
    pub fn drive_handshake(&mut self) -> io::Result<()> {
        if self.conn.wants_read() {
            match self.conn.read_tls(&mut self.inner) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "tls closed")),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.inner) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<S: ByteStream> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.drive_handshake()?;
        match self.conn.reader().read(buf) {
            Ok(0) if self.conn.is_handshaking() => Err(io::Error::new(io::ErrorKind::WouldBlock, "tls handshaking")),
            other => other,
        }
    }
}

impl<S: ByteStream> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.drive_handshake()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drive_handshake()
    }
}

impl<S: ByteStream> ByteStream for TlsStream<S> {
    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.drive_handshake();
        self.inner.shutdown()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn is_tls(&self) -> bool {
        true
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn source(&mut self) -> &mut dyn Source {
        self.inner.source()
    }
}
