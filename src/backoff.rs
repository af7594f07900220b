// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The backoff controller: a global `{NORMAL, BACKOFF, TEST}` state machine
//! triggered by message outcomes -- the signal here is handler
//! success/failure rather than a congestion measurement, and there is no
//! EWMA: every failure or success is a direct level transition.

use std::time::{Duration, Instant};

use crate::info;

/// Where the backoff controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    /// Regular RDY allocation; the RDY controller owns the budget.
    Normal,
    /// Every connection's RDY is 0; waiting for the backoff timer.
    Backoff,
    /// One probe connection holds RDY=1; waiting for its outcome.
    Test,
}

/// What the caller should do in response to a [`BackoffController`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Nothing changed (disabled, or already at level 0 on success).
    None,
    /// Enter `BACKOFF`: zero every connection's RDY and arm a timer of this duration.
    EnterBackoff { timer: Duration },
    /// The backoff timer fired: enter `TEST`, the caller should choose a probe connection.
    EnterTest,
    /// Resume steady-state `RDY` allocation.
    ResumeNormal,
}

const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Global exponential backoff state machine (§4.5). `backoff_enabled=false`
/// disables it entirely -- `level` never leaves 0 and every call is a no-op
/// returning [`BackoffAction::None`].
pub struct BackoffController {
    enabled: bool,
    phase: BackoffPhase,
    level: u32,
    max_level: u32,
    max_duration: Duration,
    timer_deadline: Option<Instant>,
}

impl BackoffController {
    pub fn new(enabled: bool, max_duration: Duration) -> Self {
        // A level cap keeps `base * 2^(level-1)` from overflowing before the
        // `min(max_duration, ...)` clamp ever applies.
        let max_level = 30;
        BackoffController {
            enabled,
            phase: BackoffPhase::Normal,
            level: 0,
            max_level,
            max_duration,
            timer_deadline: None,
        }
    }

    pub fn phase(&self) -> BackoffPhase {
        self.phase
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A message finished successfully (`FIN`, or `REQ` with `backoff=false`).
    pub fn on_success(&mut self) -> BackoffAction {
        if !self.enabled {
            return BackoffAction::None;
        }
        match self.phase {
            BackoffPhase::Test => {
                self.level = self.level.saturating_sub(1);
                if self.level == 0 {
                    self.phase = BackoffPhase::Normal;
                    self.timer_deadline = None;
                    info!("backoff: resumed to NORMAL");
                    BackoffAction::ResumeNormal
                } else {
                    self.phase = BackoffPhase::Backoff;
                    let timer = self.compute_timer();
                    self.timer_deadline = Some(Instant::now() + timer);
                    info!("backoff: TEST succeeded, still backing off at level {}", self.level);
                    BackoffAction::EnterBackoff { timer }
                }
            }
            BackoffPhase::Normal | BackoffPhase::Backoff => BackoffAction::None,
        }
    }

    /// A message failed (`REQ` with `backoff=true`, handler exception, or a
    /// falsy synchronous return).
    pub fn on_failure(&mut self) -> BackoffAction {
        if !self.enabled {
            return BackoffAction::None;
        }
        self.level = (self.level + 1).min(self.max_level);
        self.phase = BackoffPhase::Backoff;
        let timer = self.compute_timer();
        self.timer_deadline = Some(Instant::now() + timer);
        info!("backoff: failure at level {}, backing off for {:?}", self.level, timer);
        BackoffAction::EnterBackoff { timer }
    }

    /// Call periodically (or on a dedicated timer) while in `BACKOFF`; fires
    /// the transition to `TEST` once the armed timer has elapsed.
    pub fn tick(&mut self, now: Instant) -> BackoffAction {
        if self.phase != BackoffPhase::Backoff {
            return BackoffAction::None;
        }
        match self.timer_deadline {
            Some(deadline) if now >= deadline => {
                self.phase = BackoffPhase::Test;
                self.timer_deadline = None;
                BackoffAction::EnterTest
            }
            _ => BackoffAction::None,
        }
    }

    /// `t_b = min(backoff_max, base * 2^(level-1)) * jitter`, `jitter` uniform
    /// in `[0.8, 1.2]` per the design notes' open-question resolution.
    fn compute_timer(&self) -> Duration {
        let exponent = self.level.saturating_sub(1).min(30);
        let unjittered = BASE_BACKOFF.saturating_mul(1u32 << exponent).min(self.max_duration);
        let jitter = 0.8 + fastrand::f32() * 0.4;
        unjittered.mul_f32(jitter)
    }
}
