// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # nsq
//!
//! A Rust client library for [NSQ](https://nsq.io), a realtime distributed
//! messaging platform. Provides a [`Reader`] for consuming messages from a
//! topic/channel pair and a [`Writer`] for publishing to a topic, both
//! speaking the NSQ TCP protocol directly over `mio`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nsq::{Reader, ReaderConfig, HandlerResult};
//!
//! fn main() -> nsq::Result<()> {
//!     let config = ReaderConfig::new("my_topic", "my_channel")
//!         .nsqd_tcp_addresses(["127.0.0.1:4150"]);
//!
//!     let mut reader = Reader::new(config, |msg: &nsq::Message| -> HandlerResult {
//!         println!("got message: {:?}", msg.body());
//!         Ok(())
//!     })?;
//!
//!     reader.run()
//! }
//! ```
//!
//! ## Modules overview
//!
//! - [`reader`] - the consumer side: `Reader`, its `Handler` trait, RDY and
//!   backoff integration.
//! - [`writer`] - the publish side: `Writer`, with `publish`/`publish_multi`/
//!   `publish_deferred`.
//! - [`message`] - `Message`, the handle passed to a `Handler` and the
//!   `finish`/`requeue`/`touch` disposition API.
//! - [`conn`] - the per-connection state machine (`AsyncConn`) driving the
//!   IDENTIFY handshake, TLS/compression upgrades, and steady-state framing.
//! - [`protocol`] - the wire format: frame decoding and command encoding.
//! - [`transport`] - pluggable byte streams (plain TCP, TLS, compressed).
//! - [`discovery`] - `nsqlookupd` polling for dynamic producer discovery.
//! - [`rdy`] - the RDY-count distribution controller.
//! - [`backoff`] - the shared `NORMAL`/`BACKOFF`/`TEST` state machine.
//! - [`config`] - `ReaderConfig`/`WriterConfig`/`IdentifyConfig`/`TlsConfig`.
//! - [`error`] - the crate's `Error`/`Result` types.
//! - [`logging`] - compile-time configurable logging (zero-cost when the
//!   `logging` feature is disabled).

/// Compile-time configurable logging macros (`debug!`, `info!`, `warn!`,
/// `error!`, `trace_fn!`), zero-cost when the `logging` feature is off.
pub mod logging;

/// The crate's `Error` and `Result` types.
pub mod error;

/// `ReaderConfig`, `WriterConfig`, `IdentifyConfig`, `TlsConfig`.
pub mod config;

/// `Message`, the handle passed to a `Handler` and its disposition API.
pub mod message;

/// The wire format: frame decoding (`FrameDecoder`) and command encoding
/// (`Command`).
pub mod protocol;

/// Pluggable byte streams: plain TCP, TLS (`tls` feature), and compression
/// (`snappy`/`deflate` features).
pub mod transport;

/// The per-connection state machine driving the IDENTIFY handshake,
/// TLS/compression upgrades, and steady-state frame handling.
pub mod conn;

/// `nsqlookupd` HTTP polling for dynamic producer discovery.
pub mod discovery;

/// The RDY-count distribution controller shared by every connection a
/// `Reader` owns.
pub mod rdy;

/// The shared `NORMAL`/`BACKOFF`/`TEST` backoff state machine.
pub mod backoff;

/// The consumer side of the client: `Reader`, its `Handler` trait, and the
/// single-threaded event loop tying RDY and backoff together.
pub mod reader;

/// The publish side of the client: `Writer`.
pub mod writer;

pub use config::{IdentifyConfig, ReaderConfig, TlsConfig, WriterConfig};
pub use error::{Error, Result};
pub use message::{Disposition, Message};
pub use reader::{Handler, HandlerError, HandlerResult, Reader, ReaderHandle};
pub use writer::Writer;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
