// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Writer`: the publish side of the client.
//!
//! Unlike [`Reader`](crate::reader::Reader), a `Writer` owns exactly one
//! connection at a time and runs its own dedicated background thread: a
//! thin handle the caller keeps, and a loop that owns the socket and is
//! driven from its own thread. Narrowed down to a single connection with
//! neither an RDY nor a backoff controller, since publishing has no
//! flow-control credit to manage.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};

use crate::config::WriterConfig;
use crate::conn::{AsyncConn, ConnEvent, ConnId, ConnState};
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::Command;
use crate::{debug, info, warn};

const CONN_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const RECONNECT_INITIAL: Duration = Duration::from_millis(100);

enum WriterRequest {
    Command(Command, crossbeam_channel::Sender<Result<()>>),
    Stop,
}

/// The publish side of the client: lazily connects on the first `publish*`
/// call, and keeps exactly one `PUB`/`MPUB`/`DPUB` outstanding on the wire
/// at a time -- the protocol gives no way to correlate a response with a
/// specific request, so a second command can't be sent until the first is
/// answered.
pub struct Writer {
    requests_tx: crossbeam_channel::Sender<WriterRequest>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Writer {
    pub fn new(config: WriterConfig) -> Result<Self> {
        let config = config.build()?;
        let poll = Poll::new().map_err(ConnectionError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ConnectionError::Io)?);
        let (requests_tx, requests_rx) = crossbeam_channel::unbounded();

        let mut worker = WriterWorker {
            config,
            poll,
            conn: None,
            addr_idx: 0,
            requests_rx,
            queue: VecDeque::new(),
            pending: None,
            reconnect_attempt: 0,
            reconnect_at: None,
            stop: false,
        };
        let thread = std::thread::Builder::new()
            .name("nsq-writer".into())
            .spawn(move || worker.run())
            .map_err(ConnectionError::Io)?;

        Ok(Writer {
            requests_tx,
            waker,
            thread: Some(thread),
        })
    }

    /// Publish `body` to `topic`, blocking until `nsqd` acknowledges it.
    pub fn publish(&self, topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Result<()> {
        self.publish_async(topic, body)?.recv().map_err(|_| channel_closed())?
    }

    /// Publish without blocking the caller; the returned receiver yields the
    /// result once `nsqd` responds (or the connection drops first).
    pub fn publish_async(
        &self,
        topic: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<crossbeam_channel::Receiver<Result<()>>> {
        self.submit(Command::Pub {
            topic: topic.into(),
            body: body.into(),
        })
    }

    /// Publish a batch atomically (`MPUB`), blocking until acknowledged.
    pub fn publish_multi(&self, topic: impl Into<String>, bodies: Vec<Vec<u8>>) -> Result<()> {
        self.submit(Command::Mpub {
            topic: topic.into(),
            bodies,
        })?
        .recv()
        .map_err(|_| channel_closed())?
    }

    /// Publish with a server-side delivery delay (`DPUB`), blocking until
    /// acknowledged.
    pub fn publish_deferred(&self, topic: impl Into<String>, delay: Duration, body: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Command::Dpub {
            topic: topic.into(),
            delay_ms: delay.as_millis() as u32,
            body: body.into(),
        })?
        .recv()
        .map_err(|_| channel_closed())?
    }

    fn submit(&self, cmd: Command) -> Result<crossbeam_channel::Receiver<Result<()>>> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.requests_tx
            .send(WriterRequest::Command(cmd, reply_tx))
            .map_err(|_| channel_closed())?;
        let _ = self.waker.wake();
        Ok(reply_rx)
    }

    /// Stop the background thread. Any publish still queued or in flight is
    /// failed with a connection-closed error. Idempotent.
    pub fn close(&mut self) {
        let _ = self.requests_tx.send(WriterRequest::Stop);
        let _ = self.waker.wake();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

fn channel_closed() -> Error {
    Error::Connection(ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "writer background thread is gone",
    )))
}

struct Pending {
    reply: crossbeam_channel::Sender<Result<()>>,
}

struct WriterWorker {
    config: WriterConfig,
    poll: Poll,
    conn: Option<AsyncConn>,
    addr_idx: usize,
    requests_rx: crossbeam_channel::Receiver<WriterRequest>,
    queue: VecDeque<(Command, crossbeam_channel::Sender<Result<()>>)>,
    pending: Option<Pending>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
    stop: bool,
}

impl WriterWorker {
    fn run(&mut self) {
        let mut events = Events::with_capacity(16);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    warn!("writer: poll error: {e}");
                }
            }
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.handle_conn_event(event.is_readable(), event.is_writable());
            }

            self.drain_requests();
            self.maybe_reconnect();
            self.pump_queue();

            if self.stop && self.queue.is_empty() && self.pending.is_none() {
                if let Some(mut conn) = self.conn.take() {
                    conn.close_gracefully();
                    let _ = conn.deregister(self.poll.registry());
                }
                break;
            }
        }
    }

    fn drain_requests(&mut self) {
        while let Ok(req) = self.requests_rx.try_recv() {
            match req {
                WriterRequest::Stop => self.stop = true,
                WriterRequest::Command(cmd, reply) => self.queue.push_back((cmd, reply)),
            }
        }
    }

    fn pump_queue(&mut self) {
        if self.pending.is_some() {
            return;
        }
        let Some(conn) = &mut self.conn else { return };
        if conn.state() != ConnState::Subscribed {
            return; // still connecting/negotiating
        }
        if let Some((cmd, reply)) = self.queue.pop_front() {
            conn.send(&cmd);
            self.pending = Some(Pending { reply });
        }
    }

    fn handle_conn_event(&mut self, readable: bool, writable: bool) {
        let mut closed = false;
        if writable {
            if let Some(conn) = &mut self.conn {
                if let Err(e) = conn.on_writable() {
                    debug!("writer: write error: {e}");
                    closed = true;
                }
            }
        }
        let mut surfaced = Vec::new();
        if !closed && readable {
            if let Some(conn) = &mut self.conn {
                match conn.on_readable() {
                    Ok(events) => surfaced = events,
                    Err(e) => {
                        debug!("writer: read error: {e}");
                        closed = true;
                    }
                }
            }
        }
        for event in surfaced {
            match event {
                ConnEvent::Ready(_) => info!("writer: connection negotiated"),
                ConnEvent::Response(_) => self.resolve_pending(Ok(())),
                ConnEvent::Broker { code, fatal } => {
                    let message = code.clone();
                    self.resolve_pending(Err(Error::Broker { code, message, fatal }));
                    if fatal {
                        closed = true;
                    }
                }
                ConnEvent::Message(_) => {
                    warn!("writer: unexpected MESSAGE frame on a publish-only connection");
                }
                ConnEvent::AuthRequired => match self.config.auth_secret.clone() {
                    Some(secret) => {
                        if let Some(conn) = &mut self.conn {
                            conn.send_auth(&secret);
                        }
                    }
                    None => {
                        warn!("writer: broker requires AUTH but no auth_secret is configured");
                        closed = true;
                    }
                },
                ConnEvent::Closed(err) => {
                    if let Some(e) = err {
                        debug!("writer: connection closed: {e}");
                    }
                    closed = true;
                }
            }
        }
        if closed {
            self.teardown();
        }
    }

    fn resolve_pending(&mut self, result: Result<()>) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(result);
        }
    }

    fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.deregister(self.poll.registry());
        }
        self.resolve_pending(Err(channel_closed()));
        // A disconnect order-invalidates anything still queued -- failing it
        // outright is simpler and safer than silently resending against
        // whatever connection comes next.
        while let Some((_, reply)) = self.queue.pop_front() {
            let _ = reply.send(Err(channel_closed()));
        }
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = (RECONNECT_INITIAL * 2u32.saturating_pow(self.reconnect_attempt)).min(self.config.max_reconnect_delay);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn maybe_reconnect(&mut self) {
        if self.stop || self.conn.is_some() {
            return;
        }
        if !self.reconnect_at.map(|at| Instant::now() >= at).unwrap_or(true) {
            return;
        }
        let Some(addr) = self.next_addr() else { return };
        let (dummy_tx, _dummy_rx) = crossbeam_channel::unbounded();
        match AsyncConn::connect(ConnId::new(0), addr, "", None, &self.config.identify, dummy_tx) {
            Ok(mut conn) => match conn.register(self.poll.registry(), CONN_TOKEN) {
                Ok(()) => {
                    self.conn = Some(conn);
                    self.reconnect_attempt = 0;
                    self.reconnect_at = None;
                }
                Err(e) => {
                    warn!("writer: failed to register connection to {addr}: {e}");
                    self.reconnect_at = Some(Instant::now() + RECONNECT_INITIAL);
                }
            },
            Err(e) => {
                warn!("writer: failed to connect to {addr}: {e}");
                self.reconnect_at = Some(Instant::now() + RECONNECT_INITIAL);
            }
        }
    }

    /// Round-robins across configured addresses on each (re)connect, so a
    /// single down `nsqd` doesn't wedge the Writer onto it forever.
    fn next_addr(&mut self) -> Option<SocketAddr> {
        if self.config.nsqd_tcp_addresses.is_empty() {
            return None;
        }
        let idx = self.addr_idx % self.config.nsqd_tcp_addresses.len();
        let raw = self.config.nsqd_tcp_addresses[idx].clone();
        self.addr_idx = self.addr_idx.wrapping_add(1);
        resolve(&raw).ok()
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    if let Ok(a) = addr.parse::<SocketAddr>() {
        return Ok(a);
    }
    addr.to_socket_addrs()
        .map_err(ConnectionError::Io)?
        .next()
        .ok_or_else(|| {
            Error::Connection(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {addr}"),
            )))
        })
}
