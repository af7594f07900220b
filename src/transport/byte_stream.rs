// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `ByteStream`: the trait every layer of the transform stack implements so
//! the connection state machine never has to match on "is this plain TCP,
//! TLS, or TLS+Snappy".
//!
//! Each wrapper (TLS, Deflate, Snappy) owns the layer beneath it and forwards
//! [`ByteStream::source`] down to the innermost [`mio::net::TcpStream`] --
//! readiness on the raw socket is necessary (though, for TLS, not always
//! sufficient) for the wrapped layer to make progress, so registering the
//! raw fd with `mio::Poll` is correct regardless of how many layers sit on
//! top of it.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;
use mio::net::TcpStream;

/// Abstraction over a (possibly encrypted, possibly compressed) connection
/// to `nsqd`.
pub trait ByteStream: Read + Write + Send {
    /// Half-close the underlying socket.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Peer address, for logging.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Whether this stream is TLS-wrapped (for logging/diagnostics).
    fn is_tls(&self) -> bool {
        false
    }

    /// Whether a TLS handshake is still in progress on this stream. Always
    /// `false` for non-TLS streams; a `TlsStream` overrides this to track
    /// the embedded rustls connection's own handshake state.
    fn is_handshaking(&self) -> bool {
        false
    }

    /// The innermost pollable source, for `mio::Poll::registry().register(...)`.
    fn source(&mut self) -> &mut dyn Source;
}

impl ByteStream for TcpStream {
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn source(&mut self) -> &mut dyn Source {
        self
    }
}

/// A boxed, type-erased transform stack.
pub type BoxedByteStream = Box<dyn ByteStream>;

impl ByteStream for BoxedByteStream {
    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn is_tls(&self) -> bool {
        (**self).is_tls()
    }

    fn is_handshaking(&self) -> bool {
        (**self).is_handshaking()
    }

    fn source(&mut self) -> &mut dyn Source {
        (**self).source()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory `ByteStream` for frame-codec and handshake tests. Clones
    /// share the same underlying buffers, so a test can keep a handle to
    /// feed/inspect a stream already moved into an `AsyncConn`.
    #[derive(Default, Clone)]
    pub struct MockStream {
        read_data: Arc<Mutex<VecDeque<u8>>>,
        write_data: Arc<Mutex<Vec<u8>>>,
    }

    impl MockStream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn feed(&self, data: &[u8]) {
            self.read_data.lock().unwrap().extend(data);
        }

        pub fn written(&self) -> Vec<u8> {
            self.write_data.lock().unwrap().clone()
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.read_data.lock().unwrap();
            if data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "would block"));
            }
            let n = buf.len().min(data.len());
            for (i, byte) in data.drain(..n).enumerate() {
                buf[i] = byte;
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteStream for MockStream {
        fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:4150".parse().unwrap())
        }

        fn source(&mut self) -> &mut dyn Source {
            panic!("MockStream is not pollable")
        }
    }

    #[test]
    fn mock_stream_round_trips() {
        let stream = MockStream::new();
        stream.feed(b"hello");
        let mut s = stream;
        let mut buf = [0u8; 5];
        use std::io::Read as _;
        assert_eq!(s.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        use std::io::Write as _;
        s.write_all(b"world").unwrap();
        assert_eq!(s.written(), b"world");
    }
}
