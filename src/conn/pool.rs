// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `Reader`/`Writer` event loop's connection registry.
//!
//! Unlike the proxy registry this is adapted from, there is exactly one
//! thread driving the `mio::Poll` loop that owns every [`AsyncConn`], so a
//! plain `HashMap` keyed by [`ConnId`] replaces what would otherwise need a
//! concurrent map -- nothing here is ever touched from two threads at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::Token;

use super::{AsyncConn, ConnId};

/// Bounds for the direct-mode (no lookupd) reconnect backoff, kept distinct
/// from the RDY backoff controller -- a connection flapping and a consumer
/// being asked to slow down are unrelated conditions.
const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Registry of live connections plus, for each configured direct address,
/// the reconnect backoff state to use the next time that address drops.
#[derive(Default)]
pub struct ConnPool {
    conns: HashMap<ConnId, AsyncConn>,
    by_addr: HashMap<SocketAddr, ConnId>,
    reconnect: HashMap<SocketAddr, ReconnectState>,
    next_id: u64,
}

struct ReconnectState {
    attempt: u32,
    retry_at: Instant,
}

impl ConnPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next [`ConnId`]. The same value is used, cast to
    /// `usize`, as the connection's mio [`Token`].
    pub fn next_id(&mut self) -> ConnId {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn token_for(id: ConnId) -> Token {
        Token(id.0 as usize)
    }

    pub fn insert(&mut self, conn: AsyncConn) {
        let id = conn.id();
        let addr = conn.addr();
        self.by_addr.insert(addr, id);
        self.conns.insert(id, conn);
    }

    pub fn get(&self, id: ConnId) -> Option<&AsyncConn> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut AsyncConn> {
        self.conns.get_mut(&id)
    }

    pub fn id_for_addr(&self, addr: &SocketAddr) -> Option<ConnId> {
        self.by_addr.get(addr).copied()
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    /// Remove a connection, e.g. once it has been deregistered and closed.
    /// Does not touch reconnect state -- callers in direct mode schedule a
    /// reconnect via [`ConnPool::note_disconnect`] separately.
    pub fn remove(&mut self, id: ConnId) -> Option<AsyncConn> {
        let conn = self.conns.remove(&id)?;
        self.by_addr.remove(&conn.addr());
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnId, &mut AsyncConn)> {
        self.conns.iter_mut()
    }

    pub fn addrs(&self) -> impl Iterator<Item = &SocketAddr> {
        self.by_addr.keys()
    }

    /// Record that `addr` just dropped and compute when to retry it,
    /// doubling the previous delay up to [`RECONNECT_MAX`].
    pub fn note_disconnect(&mut self, addr: SocketAddr) -> Duration {
        let state = self.reconnect.entry(addr).or_insert(ReconnectState {
            attempt: 0,
            retry_at: Instant::now(),
        });
        let delay = (RECONNECT_INITIAL * 2u32.saturating_pow(state.attempt)).min(RECONNECT_MAX);
        state.attempt = state.attempt.saturating_add(1);
        state.retry_at = Instant::now() + delay;
        delay
    }

    /// Clear reconnect backoff for `addr` once it connects successfully.
    pub fn note_connected(&mut self, addr: &SocketAddr) {
        self.reconnect.remove(addr);
    }

    /// Direct-mode addresses whose backoff has elapsed and are due a
    /// reconnect attempt.
    pub fn due_for_reconnect(&self) -> Vec<SocketAddr> {
        let now = Instant::now();
        self.reconnect
            .iter()
            .filter(|(addr, state)| state.retry_at <= now && !self.by_addr.contains_key(addr))
            .map(|(addr, _)| *addr)
            .collect()
    }
}
