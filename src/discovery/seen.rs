// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracking which `nsqd` producers have already been dialed.
//!
//! Adapted from the gossip anti-loop seen-table this crate's discovery
//! module used for `(origin_id, announce_id)` dedup: the shape (a map with
//! a cleanup sweep) fits, but the key is a producer address and there is no
//! TTL expiry -- per the discovery design, a producer that drops out of
//! lookupd's response is left alone until its connection independently
//! fails, not evicted on a timer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// The set of producer addresses the Reader has already opened a connection
/// for (or is in the process of opening), so repeated lookupd polls don't
/// re-dial an address that's already live.
#[derive(Default)]
pub struct SeenProducers {
    last_seen: HashMap<SocketAddr, Instant>,
}

impl SeenProducers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `addr` was just reported by discovery (or connected
    /// directly). Returns `true` if this is the first time it's been seen.
    pub fn mark_seen(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let is_new = !self.last_seen.contains_key(&addr);
        self.last_seen.insert(addr, now);
        is_new
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.last_seen.contains_key(addr)
    }

    /// Drop `addr` once its connection has actually gone away -- only then
    /// is it eligible to be treated as "newly seen" again.
    pub fn forget(&mut self, addr: &SocketAddr) {
        self.last_seen.remove(addr);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_new() {
        let mut seen = SeenProducers::new();
        let addr: SocketAddr = "127.0.0.1:4150".parse().unwrap();
        assert!(seen.mark_seen(addr, Instant::now()));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn repeated_sighting_is_not_new() {
        let mut seen = SeenProducers::new();
        let addr: SocketAddr = "127.0.0.1:4150".parse().unwrap();
        seen.mark_seen(addr, Instant::now());
        assert!(!seen.mark_seen(addr, Instant::now()));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn forget_makes_it_new_again() {
        let mut seen = SeenProducers::new();
        let addr: SocketAddr = "127.0.0.1:4150".parse().unwrap();
        seen.mark_seen(addr, Instant::now());
        seen.forget(&addr);
        assert!(seen.is_empty());
        assert!(seen.mark_seen(addr, Instant::now()));
    }
}
