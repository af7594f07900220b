// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Reader`: the consumer side of the client, owning a single-threaded
//! `mio::Poll` event loop that drives every subscribed connection, the RDY
//! controller, and the backoff controller together.
//!
//! One `mio::Poll`, one thread: readable and writable readiness handled per
//! token, commands drained from a channel on a reserved waker token.
//! `Reader::run` collapses the loop onto the caller's own thread rather than
//! spawning a dedicated one, since there is exactly one owner of the
//! subscription state and no reason to hop threads to reach it.

mod handler;

pub use handler::{Handler, HandlerError, HandlerResult};

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};

use crate::backoff::{BackoffAction, BackoffController};
use crate::config::ReaderConfig;
use crate::conn::pool::ConnPool;
use crate::conn::{ConnEvent, ConnId};
use crate::discovery::{DiscoveryEvent, LookupdPoller, LookupdSource, SeenProducers};
use crate::error::{ConnectionError, Error, Result};
use crate::message::{Disposition, Message, MessageId};
use crate::protocol::Command;
use crate::rdy::RdyController;
use crate::{debug, info, warn};

/// Routed back from a [`Message`] (or from another thread holding one) to
/// the Reader's event loop -- the single channel every disposition call goes
/// through, whether it originates synchronously inside the handler or
/// asynchronously from another thread.
#[derive(Debug)]
pub enum ConnCommand {
    /// Finish or requeue a message; the Reader applies the RDY/backoff side
    /// effects before writing `FIN`/`REQ`.
    Respond(ConnId, MessageId, Disposition),
    /// Extend a message's visibility timeout. Not terminal.
    Touch(ConnId, MessageId),
    /// A message exceeded `max_tries`; `FIN` it without consulting the
    /// handler or signalling the backoff controller.
    ForceFinish(ConnId, MessageId),
}

type Preprocess = dyn Fn(&Message) -> Result<()> + Send + Sync;
type Validate = dyn Fn(&Message) -> bool + Send + Sync;
type MaxAttemptsHandler = dyn Fn(&Message) + Send + Sync;

const WAKER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_EVENTS: usize = 128;
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(0);

/// The consumer side of the client: subscribes to a topic/channel across one
/// or more `nsqd` connections (direct or discovered via `nsqlookupd`) and
/// dispatches each message to a [`Handler`].
pub struct Reader<H: Handler> {
    config: ReaderConfig,
    handler: Arc<H>,
    preprocess: Option<Arc<Preprocess>>,
    validate: Option<Arc<Validate>>,
    max_attempts_handler: Option<Arc<MaxAttemptsHandler>>,

    poll: Poll,
    waker: Arc<Waker>,
    pool: ConnPool,
    rdy: RdyController,
    backoff: BackoffController,

    commands_tx: crossbeam_channel::Sender<ConnCommand>,
    commands_rx: crossbeam_channel::Receiver<ConnCommand>,

    discovery_rx: Option<crossbeam_channel::Receiver<DiscoveryEvent>>,
    _discovery_poller: Option<LookupdPoller>,
    seen: SeenProducers,

    closing: bool,
    close_deadline: Option<Instant>,
    stopped: bool,

    close_requested: Arc<AtomicBool>,
    close_deadline_ms: Arc<AtomicU64>,
}

/// A cheaply cloneable handle that can request [`Reader::close`] from a
/// different thread than the one blocked in [`Reader::run`] -- `Reader`
/// itself can't be shared across threads while its event loop is running
/// (the loop needs `&mut self`), so shutdown goes through a waker plus a
/// couple of atomics instead.
#[derive(Clone)]
pub struct ReaderHandle {
    waker: Arc<Waker>,
    close_requested: Arc<AtomicBool>,
    close_deadline_ms: Arc<AtomicU64>,
}

impl ReaderHandle {
    /// Request graceful shutdown: the Reader stops accepting new work and
    /// `CLS`es every connection, draining in-flight messages until either
    /// they all complete or `deadline` elapses.
    pub fn close(&self, deadline: Duration) {
        self.close_deadline_ms.store(deadline.as_millis() as u64, Ordering::SeqCst);
        self.close_requested.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl<H: Handler + 'static> Reader<H> {
    /// Build a Reader against direct `nsqd` addresses and/or `nsqlookupd`
    /// discovery, per `config`. With the `lookupd` feature disabled, a
    /// config naming `lookupd_http_addresses` is rejected -- use
    /// [`Reader::with_lookupd_source`] to supply a custom source instead
    /// (tests do this to avoid a network dependency).
    pub fn new(config: ReaderConfig, handler: H) -> Result<Self> {
        #[cfg(feature = "lookupd")]
        {
            if !config.lookupd_http_addresses.is_empty() {
                let source = crate::discovery::HttpLookupdSource::new()?;
                return Self::with_lookupd_source(config, handler, Box::new(source));
            }
        }
        Self::build(config, handler, None)
    }

    /// Build a Reader with an explicit [`LookupdSource`], bypassing the
    /// built-in HTTP client (used by tests, or to point discovery at
    /// something other than real `nsqlookupd`).
    pub fn with_lookupd_source(config: ReaderConfig, handler: H, source: Box<dyn LookupdSource>) -> Result<Self> {
        Self::build(config, handler, Some(source))
    }

    fn build(config: ReaderConfig, handler: H, source: Option<Box<dyn LookupdSource>>) -> Result<Self> {
        let config = config.build()?;
        let poll = Poll::new().map_err(ConnectionError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ConnectionError::Io)?);
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();

        let (discovery_rx, discovery_poller) = if !config.lookupd_http_addresses.is_empty() {
            let source = source.ok_or(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "lookupd_http_addresses configured but no LookupdSource available (enable the `lookupd` feature or pass one explicitly)",
            )))?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let poller = LookupdPoller::spawn(
                source,
                config.lookupd_http_addresses.clone(),
                config.topic.clone(),
                config.lookupd_poll_interval,
                config.lookupd_poll_jitter,
                tx,
            );
            (Some(rx), Some(poller))
        } else {
            (None, None)
        };

        Ok(Reader {
            rdy: RdyController::new(config.max_in_flight.max(0) as u32, config.low_rdy_idle_timeout),
            backoff: BackoffController::new(config.backoff_enabled, config.max_backoff_duration),
            handler: Arc::new(handler),
            preprocess: None,
            validate: None,
            max_attempts_handler: None,
            poll,
            waker,
            pool: ConnPool::new(),
            commands_tx,
            commands_rx,
            discovery_rx,
            _discovery_poller: discovery_poller,
            seen: SeenProducers::new(),
            closing: false,
            close_deadline: None,
            stopped: false,
            close_requested: Arc::new(AtomicBool::new(false)),
            close_deadline_ms: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// A cloneable handle for requesting shutdown from another thread while
    /// [`run`](Self::run) is blocked on this one.
    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            waker: self.waker.clone(),
            close_requested: self.close_requested.clone(),
            close_deadline_ms: self.close_deadline_ms.clone(),
        }
    }

    /// Run an arbitrary check before the handler sees a message; returning
    /// `Err` auto-`REQ`s the message with backoff, same as a handler failure.
    pub fn set_preprocess<F>(&mut self, f: F)
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(f));
    }

    /// Run a cheap filter before the handler sees a message; returning
    /// `false` auto-`FIN`s the message without invoking the handler at all.
    pub fn set_validate<F>(&mut self, f: F)
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
    }

    /// Called (instead of the handler) when a message's `attempts` exceeds
    /// `max_tries`; the message is `FIN`ed unconditionally right after.
    pub fn set_max_attempts_handler<F>(&mut self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.max_attempts_handler = Some(Arc::new(f));
    }

    /// Change the global in-flight budget at runtime; takes effect on the
    /// next RDY reconciliation pass.
    pub fn set_max_in_flight(&mut self, n: i64) {
        self.rdy.set_max_in_flight(n.max(0) as u32);
        self.config.max_in_flight = n;
    }

    /// Whether any connection's in-flight count is close to its advertised
    /// RDY -- a signal to the caller that the handler is keeping up and more
    /// credit could help, not an error condition.
    pub fn is_starved(&self) -> bool {
        self.rdy.is_starved()
    }

    /// Begin graceful shutdown from the same thread running [`run`](Self::run):
    /// `CLS` every connection and stop accepting new messages, but keep
    /// running until every in-flight message has been disposed of or
    /// `deadline` elapses. Equivalent to `self.handle().close(deadline)`.
    pub fn close(&mut self, deadline: Duration) {
        self.handle().close(deadline);
    }

    fn begin_close(&mut self, deadline: Duration) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.close_deadline = Some(Instant::now() + deadline);
        for (_, conn) in self.pool.iter_mut() {
            conn.close_gracefully();
        }
    }

    /// Run the event loop until [`close`](Self::close) has drained every
    /// in-flight message (or its deadline elapses) and every connection has
    /// gone away.
    pub fn run(&mut self) -> Result<()> {
        self.bootstrap_connections();

        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.stopped {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    return Err(ConnectionError::Io(e).into());
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.handle_conn_event(event.token(), event.is_readable(), event.is_writable());
            }

            if self.close_requested.load(Ordering::SeqCst) && !self.closing {
                let ms = self.close_deadline_ms.load(Ordering::SeqCst);
                self.begin_close(Duration::from_millis(ms));
            }

            self.drain_discovery();
            self.drain_commands();
            self.tick_reconnects();
            self.tick_backoff_and_rdy();
            self.check_heartbeats();
            self.maybe_finish_close();
        }
        Ok(())
    }

    fn bootstrap_connections(&mut self) {
        let addrs: Vec<String> = self.config.nsqd_tcp_addresses.clone();
        for raw in addrs {
            match resolve(&raw) {
                Ok(addr) => {
                    if let Err(e) = self.connect_to(addr) {
                        warn!("initial connect to {raw} failed: {e}");
                        self.pool.note_disconnect(addr);
                    }
                }
                Err(e) => warn!("could not resolve nsqd address {raw}: {e}"),
            }
        }
    }

    fn connect_to(&mut self, addr: SocketAddr) -> Result<()> {
        if self.pool.contains_addr(&addr) {
            return Ok(());
        }
        let id = self.pool.next_id();
        let channel = Some(self.config.channel.as_str());
        let mut conn = crate::conn::AsyncConn::connect(
            id,
            addr,
            &self.config.topic,
            channel,
            &self.config.identify,
            self.commands_tx.clone(),
        )?;
        conn.register(self.poll.registry(), ConnPool::token_for(id))?;
        self.pool.insert(conn);
        self.seen.mark_seen(addr, Instant::now());
        Ok(())
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        let conn_id = ConnId::new(token.0 as u64);
        let mut closed = false;

        if writable {
            if let Some(conn) = self.pool.get_mut(conn_id) {
                if let Err(e) = conn.on_writable() {
                    debug!("conn {:?}: write error: {e}", conn_id);
                    closed = true;
                }
            }
        }

        let mut surfaced = Vec::new();
        if !closed && readable {
            if let Some(conn) = self.pool.get_mut(conn_id) {
                match conn.on_readable() {
                    Ok(events) => surfaced = events,
                    Err(e) => {
                        debug!("conn {:?}: read error: {e}", conn_id);
                        closed = true;
                    }
                }
            }
        }

        for event in surfaced {
            self.handle_conn_specific_event(conn_id, event, &mut closed);
        }

        if closed {
            self.teardown_conn(conn_id);
        }
    }

    fn handle_conn_specific_event(&mut self, conn_id: ConnId, event: ConnEvent, closed: &mut bool) {
        match event {
            ConnEvent::Ready(features) => {
                self.rdy.add_conn(conn_id, features.max_rdy_count.max(1) as u32);
                if let Some(addr) = self.pool.get(conn_id).map(|c| c.addr()) {
                    self.pool.note_connected(&addr);
                }
                info!("conn {:?}: ready (max_rdy_count={})", conn_id, features.max_rdy_count);
            }
            ConnEvent::AuthRequired => match &self.config.auth_secret {
                Some(secret) => {
                    let secret = secret.clone();
                    if let Some(conn) = self.pool.get_mut(conn_id) {
                        conn.send_auth(&secret);
                    }
                }
                None => {
                    warn!("conn {:?}: broker requires AUTH but no auth_secret is configured", conn_id);
                    *closed = true;
                }
            },
            ConnEvent::Message(msg) => self.on_message(conn_id, msg),
            ConnEvent::Response(_) => {}
            ConnEvent::Broker { code, fatal } => {
                warn!("conn {:?}: broker error {code} (fatal={fatal})", conn_id);
                if fatal {
                    *closed = true;
                }
            }
            ConnEvent::Closed(err) => {
                if let Some(e) = err {
                    debug!("conn {:?}: closed: {e}", conn_id);
                }
                *closed = true;
            }
        }
    }

    fn on_message(&mut self, conn_id: ConnId, msg: Message) {
        self.rdy.on_message_received(conn_id);
        if msg.attempts() > self.config.max_tries {
            if let Some(cb) = &self.max_attempts_handler {
                cb(&msg);
            }
            msg.force_finish();
            return;
        }
        self.dispatch_message(msg);
    }

    fn dispatch_message(&self, msg: Message) {
        if let Some(validate) = &self.validate {
            if !validate(&msg) {
                msg.finish();
                return;
            }
        }
        if let Some(preprocess) = &self.preprocess {
            if let Err(e) = preprocess(&msg) {
                warn!("preprocess rejected message {}: {e}", msg.id_str());
                msg.requeue(DEFAULT_REQUEUE_DELAY, true);
                return;
            }
        }

        let result = self.handler.handle(&msg);
        if msg.is_async() {
            if let Err(e) = result {
                warn!("handler error ignored for deferred message {}: {e}", msg.id_str());
            }
            return;
        }
        match result {
            Ok(()) => msg.finish(),
            Err(e) => {
                warn!("handler failed for message {}: {e}", msg.id_str());
                msg.requeue(DEFAULT_REQUEUE_DELAY, true);
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            match cmd {
                ConnCommand::Respond(conn_id, id, disposition) => self.apply_disposition(conn_id, id, disposition),
                ConnCommand::Touch(conn_id, id) => self.send_to(conn_id, Command::Touch(id)),
                ConnCommand::ForceFinish(conn_id, id) => {
                    self.rdy.on_disposition_complete(conn_id);
                    self.refresh_low_water(conn_id);
                    self.send_to(conn_id, Command::Fin(id));
                }
            }
        }
    }

    fn apply_disposition(&mut self, conn_id: ConnId, id: MessageId, disposition: Disposition) {
        match disposition {
            Disposition::Finish => {
                let action = self.backoff.on_success();
                self.apply_backoff_action(action);
                self.rdy.on_disposition_complete(conn_id);
                self.refresh_low_water(conn_id);
                self.send_to(conn_id, Command::Fin(id));
            }
            Disposition::Requeue { delay, backoff } => {
                if backoff {
                    let action = self.backoff.on_failure();
                    self.apply_backoff_action(action);
                }
                self.rdy.on_disposition_complete(conn_id);
                self.refresh_low_water(conn_id);
                self.send_to(conn_id, Command::Req { id, timeout_ms: delay.as_millis() as u32 });
            }
            Disposition::Defer => {}
        }
        self.maybe_finish_close();
    }

    fn refresh_low_water(&mut self, conn_id: ConnId) {
        if let Some((id, rdy)) = self.rdy.refresh_if_low_water(conn_id) {
            self.send_to(id, Command::Rdy(rdy));
        }
    }

    fn apply_backoff_action(&mut self, action: BackoffAction) {
        match action {
            BackoffAction::None => {}
            BackoffAction::EnterBackoff { .. } => {
                for (id, rdy) in self.rdy.enter_backoff() {
                    self.send_to(id, Command::Rdy(rdy));
                }
            }
            BackoffAction::EnterTest => {
                if let Some(probe) = self.rdy.next_probe_candidate() {
                    for (id, rdy) in self.rdy.enter_test(probe) {
                        self.send_to(id, Command::Rdy(rdy));
                    }
                }
            }
            BackoffAction::ResumeNormal => self.rdy.resume_normal(),
        }
    }

    fn send_to(&mut self, conn_id: ConnId, cmd: Command) {
        if let Some(conn) = self.pool.get_mut(conn_id) {
            conn.send(&cmd);
            if conn.state() == crate::conn::ConnState::Closed {
                self.teardown_conn(conn_id);
            }
        }
    }

    fn drain_discovery(&mut self) {
        let Some(rx) = &self.discovery_rx else { return };
        let events: Vec<DiscoveryEvent> = rx.try_iter().collect();
        for event in events {
            for addr in event.producers {
                if self.seen.mark_seen(addr, Instant::now()) {
                    if let Err(e) = self.connect_to(addr) {
                        warn!("discovery: failed to connect to {addr}: {e}");
                        self.seen.forget(&addr);
                    }
                }
            }
        }
    }

    fn tick_reconnects(&mut self) {
        if self.closing || !self.config.lookupd_http_addresses.is_empty() {
            return;
        }
        for addr in self.pool.due_for_reconnect() {
            if let Err(e) = self.connect_to(addr) {
                warn!("reconnect to {addr} failed: {e}");
                self.pool.note_disconnect(addr);
            }
        }
    }

    fn tick_backoff_and_rdy(&mut self) {
        let now = Instant::now();
        let action = self.backoff.tick(now);
        self.apply_backoff_action(action);
        for (id, rdy) in self.rdy.reconcile(now) {
            self.send_to(id, Command::Rdy(rdy));
        }
    }

    fn check_heartbeats(&mut self) {
        let timed_out: Vec<ConnId> = self
            .pool
            .iter_mut()
            .filter(|(_, c)| c.heartbeat_timed_out())
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            warn!("conn {:?}: heartbeat timeout", id);
            self.teardown_conn(id);
        }
    }

    fn teardown_conn(&mut self, conn_id: ConnId) {
        let Some(mut conn) = self.pool.remove(conn_id) else { return };
        let _ = conn.deregister(self.poll.registry());
        let addr = conn.addr();
        self.rdy.remove_conn(conn_id);
        self.seen.forget(&addr);
        if self.config.lookupd_http_addresses.is_empty() && !self.closing {
            let delay = self.pool.note_disconnect(addr);
            debug!("conn {:?} ({addr}) closed, reconnect in {delay:?}", conn_id);
        }
        self.maybe_finish_close();
    }

    fn maybe_finish_close(&mut self) {
        if !self.closing {
            return;
        }
        let drained = self.rdy.total_in_flight() == 0 && self.pool.is_empty();
        let expired = self.close_deadline.map(|d| Instant::now() >= d).unwrap_or(false);
        if drained || expired {
            if expired && !drained {
                warn!("close deadline reached with messages still in flight; stopping anyway");
            }
            self.stopped = true;
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    if let Ok(a) = addr.parse::<SocketAddr>() {
        return Ok(a);
    }
    addr.to_socket_addrs()
        .map_err(ConnectionError::Io)?
        .next()
        .ok_or_else(|| Error::Connection(ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {addr}")))))
}
