// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compression layers negotiated during `IDENTIFY`.
//!
//! `nsqd` only ever negotiates one compressor at a time (Snappy and Deflate
//! are mutually exclusive in the protocol), but both wrap whatever
//! [`ByteStream`] is beneath them -- plain TCP or a TLS stream.
//!
//! Both wrappers pull raw bytes from the inner stream into a scratch buffer
//! and decompress into the caller's buffer, the same incremental,
//! `WouldBlock`-propagating shape as [`crate::protocol::FrameDecoder`] uses
//! for the outer frame layer -- there is no ownership conflict between the
//! read and write halves because neither uses an owning `Read`/`Write`
//! adapter from the underlying compression crate.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use mio::event::Source;

use super::ByteStream;

const SCRATCH_SIZE: usize = 16 * 1024;

/// Deflate (zlib, RFC 1951 raw stream) compressed connection, as negotiated
/// by `IDENTIFY {"deflate": true, "deflate_level": N}`.
pub struct DeflateStream<S: ByteStream> {
    inner: S,
    decompress: Decompress,
    compress: Compress,
    read_raw: Vec<u8>,
}

impl<S: ByteStream> DeflateStream<S> {
    pub fn new(inner: S, level: u32) -> Self {
        Self {
            inner,
            decompress: Decompress::new(false),
            compress: Compress::new(Compression::new(level), false),
            read_raw: Vec::new(),
        }
    }
}

impl<S: ByteStream> Read for DeflateStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.read_raw.is_empty() {
                let before_in = self.decompress.total_in();
                let before_out = self.decompress.total_out();
                self.decompress
                    .decompress(&self.read_raw, buf, FlushDecompress::None)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let consumed = (self.decompress.total_in() - before_in) as usize;
                let produced = (self.decompress.total_out() - before_out) as usize;
                self.read_raw.drain(..consumed);
                if produced > 0 {
                    return Ok(produced);
                }
            }
            let mut scratch = [0u8; SCRATCH_SIZE];
            let n = self.inner.read(&mut scratch)?;
            if n == 0 {
                return Ok(0);
            }
            self.read_raw.extend_from_slice(&scratch[..n]);
        }
    }
}

impl<S: ByteStream> Write for DeflateStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = vec![0u8; buf.len() + buf.len() / 2 + 64];
        let before_out = self.compress.total_out();
        self.compress
            .compress(buf, &mut out, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let produced = (self.compress.total_out() - before_out) as usize;
        self.inner.write_all(&out[..produced])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: ByteStream> ByteStream for DeflateStream<S> {
    fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn source(&mut self) -> &mut dyn Source {
        self.inner.source()
    }
}

/// Snappy-compressed connection, as negotiated by `IDENTIFY {"snappy": true}`.
///
/// Each write is framed as a 4-byte big-endian length prefix followed by one
/// Snappy block, mirroring the length-prefixed shape the rest of the wire
/// protocol already uses; reads reassemble blocks the same way
/// [`crate::protocol::FrameDecoder`] reassembles frames.
pub struct SnappyStream<S: ByteStream> {
    inner: S,
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
    read_raw: Vec<u8>,
    pending_plain: Vec<u8>,
}

impl<S: ByteStream> SnappyStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            read_raw: Vec::new(),
            pending_plain: Vec::new(),
        }
    }

    fn try_take_block(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.read_raw.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.read_raw[..4].try_into().unwrap()) as usize;
        if self.read_raw.len() < 4 + len {
            return Ok(None);
        }
        let block = self.read_raw[4..4 + len].to_vec();
        self.read_raw.drain(..4 + len);
        let plain = self
            .decoder
            .decompress_vec(&block)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(plain))
    }
}

impl<S: ByteStream> Read for SnappyStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending_plain.is_empty() {
                let n = buf.len().min(self.pending_plain.len());
                buf[..n].copy_from_slice(&self.pending_plain[..n]);
                self.pending_plain.drain(..n);
                return Ok(n);
            }
            if let Some(plain) = self.try_take_block()? {
                self.pending_plain = plain;
                continue;
            }
            let mut scratch = [0u8; SCRATCH_SIZE];
            let n = self.inner.read(&mut scratch)?;
            if n == 0 {
                return Ok(0);
            }
            self.read_raw.extend_from_slice(&scratch[..n]);
        }
    }
}

impl<S: ByteStream> Write for SnappyStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let compressed = self.encoder.compress_vec(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.write_all(&(compressed.len() as u32).to_be_bytes())?;
        self.inner.write_all(&compressed)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: ByteStream> ByteStream for SnappyStream<S> {
    fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn source(&mut self) -> &mut dyn Source {
        self.inner.source()
    }
}
