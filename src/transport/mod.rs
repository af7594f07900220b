// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The stream-transform stack below the wire protocol: a plain TCP socket,
//! optionally wrapped in TLS, optionally wrapped again in a compressor.
//!
//! Everything here implements [`ByteStream`], so the rest of the crate reads
//! and writes bytes without caring which wrappers are active -- exactly the
//! negotiation order `nsqd` performs: TLS first (if any), then compression
//! (if any) on top of the (possibly encrypted) channel.

mod byte_stream;
#[cfg(any(feature = "snappy", feature = "deflate"))]
mod compress;
#[cfg(feature = "tls")]
pub mod tls;

pub use byte_stream::{BoxedByteStream, ByteStream};
#[cfg(test)]
pub use byte_stream::mock::MockStream;
#[cfg(feature = "snappy")]
pub use compress::SnappyStream;
#[cfg(feature = "deflate")]
pub use compress::DeflateStream;
