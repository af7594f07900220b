// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The RDY controller: allocation and redistribution of in-flight credit
//! across connections, structured as a priority-share budget allocator --
//! here the "budget" being shared is message credit rather than bytes/sec,
//! and connections are unweighted peers rather than priority classes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::conn::ConnId;
use crate::info;

/// Per-connection bookkeeping the RDY controller needs to compute and
/// refresh allocations.
#[derive(Debug, Clone)]
struct ConnState {
    rdy_count: u32,
    last_sent_rdy: u32,
    in_flight: u32,
    max_rdy: u32,
    last_message_at: Option<Instant>,
    /// Whether this connection is in the "active" subset during `M < N`
    /// rotation. Irrelevant (and left `true`) when `M >= N`.
    holds_slot: bool,
}

impl ConnState {
    fn new(max_rdy: u32) -> Self {
        ConnState {
            rdy_count: 0,
            last_sent_rdy: 0,
            in_flight: 0,
            max_rdy: max_rdy.max(1),
            last_message_at: None,
            holds_slot: false,
        }
    }
}

/// Governs the global `max_in_flight` budget across every subscribed
/// connection a [`crate::reader::Reader`] owns.
///
/// Call [`RdyController::reconcile`] after any topology change (connection
/// added/removed, `max_in_flight` changed, message received, disposition
/// completed) or periodically (to drive `M < N` rotation) -- it returns the
/// `RDY` commands that need to go out, in the order they should be sent.
pub struct RdyController {
    max_in_flight: u32,
    low_rdy_idle_timeout: Duration,
    conns: HashMap<ConnId, ConnState>,
    /// Rotation order for both the `M < N` active-subset pick and the P0-ish
    /// remainder distribution when `M >= N`.
    order: Vec<ConnId>,
    last_redistribute: Instant,
    /// While backoff holds the budget at 0 or 1, steady-state allocation is
    /// suspended; only [`RdyController::enter_backoff`]/[`enter_test`](Self::enter_test)/
    /// [`resume_normal`](Self::resume_normal) touch RDY.
    backoff_active: bool,
}

impl RdyController {
    pub fn new(max_in_flight: u32, low_rdy_idle_timeout: Duration) -> Self {
        RdyController {
            max_in_flight,
            low_rdy_idle_timeout,
            conns: HashMap::new(),
            order: Vec::new(),
            last_redistribute: Instant::now(),
            backoff_active: false,
        }
    }

    pub fn set_max_in_flight(&mut self, m: u32) {
        self.max_in_flight = m;
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    /// A newly ready connection joins the pool with no credit until the
    /// next reconcile.
    pub fn add_conn(&mut self, id: ConnId, max_rdy: u32) {
        self.conns.insert(id, ConnState::new(max_rdy));
        self.order.push(id);
    }

    /// Drop a connection, releasing its credit back to the shared pool
    /// (invariant 5: termination releases RDY credit).
    pub fn remove_conn(&mut self, id: ConnId) {
        self.conns.remove(&id);
        self.order.retain(|&c| c != id);
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns.contains_key(&id)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// A message arrived on `id`: decrement its local credit and record
    /// freshness for `M < N` rotation preference.
    pub fn on_message_received(&mut self, id: ConnId) {
        if let Some(state) = self.conns.get_mut(&id) {
            state.rdy_count = state.rdy_count.saturating_sub(1);
            state.in_flight += 1;
            state.last_message_at = Some(Instant::now());
        }
    }

    /// A FIN/REQ was sent for a message on `id`: the slot is free again.
    pub fn on_disposition_complete(&mut self, id: ConnId) {
        if let Some(state) = self.conns.get_mut(&id) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// `true` if any connection's in-flight count is within 15% of its last
    /// advertised RDY -- the caller should not keep batching dispatch.
    pub fn is_starved(&self) -> bool {
        self.conns
            .values()
            .any(|s| s.last_sent_rdy > 0 && s.in_flight as f32 / s.last_sent_rdy as f32 >= 0.85)
    }

    /// Total in-flight messages across every connection, used by
    /// `Reader::close` to know when it is safe to tear sockets down.
    pub fn total_in_flight(&self) -> u32 {
        self.conns.values().map(|s| s.in_flight).sum()
    }

    /// Pick the next connection to probe when entering `TEST`, reusing the
    /// same rotation pointer the `M < N` redistribution and surplus
    /// remainder distribution already maintain.
    /// Rotates so repeated calls (across successive backoff cycles) cycle
    /// through every connection rather than favoring whichever sorts first.
    pub fn next_probe_candidate(&mut self) -> Option<ConnId> {
        let id = *self.order.first()?;
        self.order.rotate_left(1);
        Some(id)
    }

    /// Force every connection's RDY to 0 (entering `BACKOFF`).
    pub fn enter_backoff(&mut self) -> Vec<(ConnId, u32)> {
        self.backoff_active = true;
        let mut commands = Vec::new();
        for (&id, state) in self.conns.iter_mut() {
            if state.last_sent_rdy != 0 {
                state.last_sent_rdy = 0;
                state.rdy_count = 0;
                commands.push((id, 0));
            }
        }
        commands
    }

    /// Probe recovery: exactly one connection gets RDY=1, everyone else RDY=0
    /// (entering `TEST`). `probe` is chosen by the caller (the backoff
    /// controller), per the open question in the design notes.
    pub fn enter_test(&mut self, probe: ConnId) -> Vec<(ConnId, u32)> {
        self.backoff_active = true;
        let mut commands = Vec::new();
        for (&id, state) in self.conns.iter_mut() {
            let target = if id == probe { 1 } else { 0 };
            if state.last_sent_rdy != target {
                state.last_sent_rdy = target;
                state.rdy_count = target;
                commands.push((id, target));
            }
        }
        commands
    }

    /// Leave backoff; the next [`reconcile`](Self::reconcile) call performs a
    /// full steady-state reallocation.
    pub fn resume_normal(&mut self) {
        self.backoff_active = false;
    }

    /// Recompute desired RDY per connection and return the commands needed
    /// to reach it. A no-op (returns an empty `Vec`) while backoff owns the
    /// budget -- use [`enter_backoff`](Self::enter_backoff)/[`enter_test`](Self::enter_test) instead.
    pub fn reconcile(&mut self, now: Instant) -> Vec<(ConnId, u32)> {
        if self.backoff_active {
            return Vec::new();
        }
        let n = self.conns.len();
        if n == 0 {
            return Vec::new();
        }
        if self.max_in_flight as usize >= n {
            self.reconcile_surplus()
        } else {
            self.reconcile_scarce(now)
        }
    }

    /// `M >= N`: every connection gets `max(1, floor(M/N))`, capped at its
    /// `R_max`; any remainder is handed to a rotating subset so the sum
    /// stays `<= M` and no connection is favored forever.
    fn reconcile_surplus(&mut self) -> Vec<(ConnId, u32)> {
        let n = self.conns.len() as u32;
        if self.max_in_flight == 0 {
            return self.zero_all();
        }
        let base = (self.max_in_flight / n).max(1);
        let mut remainder = self.max_in_flight.saturating_sub(base * n);

        let mut commands = Vec::new();
        for &id in &self.order.clone() {
            let Some(state) = self.conns.get_mut(&id) else { continue };
            let mut target = base;
            if remainder > 0 {
                target += 1;
                remainder -= 1;
            }
            target = target.min(state.max_rdy);
            state.holds_slot = true;
            if state.last_sent_rdy != target {
                state.last_sent_rdy = target;
                state.rdy_count = target;
                commands.push((id, target));
            }
        }
        // rotate so the next reconcile favors a different subset for the remainder
        self.order.rotate_left(1);
        commands
    }

    /// `M < N`: only `M` connections hold RDY=1 at a time. Redistributes at
    /// most once per `low_rdy_idle_timeout`, preferring connections that
    /// haven't received a message recently.
    fn reconcile_scarce(&mut self, now: Instant) -> Vec<(ConnId, u32)> {
        if self.max_in_flight == 0 {
            return self.zero_all();
        }
        if now.duration_since(self.last_redistribute) < self.low_rdy_idle_timeout
            && self.conns.values().any(|s| s.holds_slot)
        {
            return Vec::new();
        }
        self.last_redistribute = now;

        let mut candidates: Vec<ConnId> = self.order.clone();
        candidates.sort_by_key(|id| {
            self.conns
                .get(id)
                .and_then(|s| s.last_message_at)
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX)
        });
        candidates.reverse(); // longest-idle (or never-received) first

        let chosen: std::collections::HashSet<ConnId> =
            candidates.into_iter().take(self.max_in_flight as usize).collect();

        let mut commands = Vec::new();
        // RDY=0 on the outgoing set first, then RDY=1 on the chosen set, so
        // the sum of outstanding RDY never exceeds `max_in_flight` mid-update.
        for &id in &self.order {
            let Some(state) = self.conns.get_mut(&id) else { continue };
            if !chosen.contains(&id) && state.holds_slot {
                state.holds_slot = false;
                if state.last_sent_rdy != 0 {
                    state.last_sent_rdy = 0;
                    state.rdy_count = 0;
                    commands.push((id, 0));
                }
            }
        }
        for &id in &self.order {
            let Some(state) = self.conns.get_mut(&id) else { continue };
            if chosen.contains(&id) {
                state.holds_slot = true;
                if state.last_sent_rdy != 1 {
                    state.last_sent_rdy = 1;
                    state.rdy_count = 1;
                    commands.push((id, 1));
                }
            }
        }
        commands
    }

    fn zero_all(&mut self) -> Vec<(ConnId, u32)> {
        let mut commands = Vec::new();
        for (&id, state) in self.conns.iter_mut() {
            state.holds_slot = false;
            if state.last_sent_rdy != 0 {
                state.last_sent_rdy = 0;
                state.rdy_count = 0;
                commands.push((id, 0));
            }
        }
        commands
    }

    /// Returns the refresh command for `id` if it has crossed the low-water
    /// mark, without touching any other connection's allocation.
    pub fn refresh_if_low_water(&mut self, id: ConnId) -> Option<(ConnId, u32)> {
        let state = self.conns.get_mut(&id)?;
        if state.last_sent_rdy > 0 && state.rdy_count as f32 <= 0.25 * state.last_sent_rdy as f32 {
            info!("conn {:?}: low-water RDY refresh to {}", id, state.last_sent_rdy);
            state.rdy_count = state.last_sent_rdy;
            Some((id, state.last_sent_rdy))
        } else {
            None
        }
    }
}
