//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `failure_threshold`, or the
//!   window's error rate exceeds `error_rate_threshold` with at least
//!   `min_sample_size` samples
//! - `Open` → `Half-Open`:   the cooldown has elapsed
//! - `Half-Open` → `Closed`: a trial call succeeds
//! - `Half-Open` → `Open`:   a trial call fails; the cooldown restarts (and grows
//!   under [`CooldownBackoff::Exponential`])
//!
//! The breaker is a plain state machine with no interior locking; the router
//! keeps one per provider behind that provider's lock. Every time-dependent
//! operation has an `*_at(now)` form so callers and tests control the clock.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::policy::CooldownBackoff;
use crate::provider::{OutcomeKind, ProviderId};
use crate::window::RollingStats;

/// Transitions kept per breaker for diagnosis.
pub const HISTORY_LEN: usize = 10;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until the cooldown elapses.
    Open,
    /// A limited number of trial requests test provider health.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of consecutive failures before opening.
    pub failure_threshold: u32,
    /// Window error rate above which the breaker opens.
    pub error_rate_threshold: f64,
    /// Minimum window samples before the error rate can trip the breaker.
    pub min_sample_size: usize,
    /// Base time to stay open before the first half-open trial.
    pub open_cooldown: Duration,
    pub cooldown_backoff: CooldownBackoff,
    /// Trial calls admitted while half-open.
    pub half_open_trial_quota: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_rate_threshold: 0.5,
            min_sample_size: 10,
            open_cooldown: Duration::from_secs(30),
            cooldown_backoff: CooldownBackoff::Fixed,
            half_open_trial_quota: 3,
        }
    }
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: call freely.
    Admitted,
    /// Half-open: this call uses one trial slot.
    Trial,
    /// Open, or half-open with the trial quota in use.
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self != Self::Rejected
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ConsecutiveFailures,
    ErrorRate,
    CooldownElapsed,
    TrialSucceeded,
    TrialFailed,
    Forced,
    Reset,
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    /// Wall-clock time (Unix ms).
    pub at_ms: i64,
}

/// Lifetime call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTotals {
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

/// Read-only copy of a breaker's bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerView {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
    /// Consecutive failed half-open trials since the last close.
    pub failed_trials: u32,
    /// Time left before the next trial is allowed, while open.
    pub cooldown_remaining_ms: Option<u64>,
    pub totals: BreakerTotals,
    pub history: Vec<Transition>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { cooldown: Duration },
    HalfOpen { admitted: u32 },
}

impl Phase {
    fn state(self) -> CircuitState {
        match self {
            Self::Closed => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Per-provider breaker state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    config: BreakerConfig,
    phase: Phase,
    entered_at: Instant,
    consecutive_failures: u32,
    failed_trials: u32,
    totals: BreakerTotals,
    history: VecDeque<Transition>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(provider: impl Into<ProviderId>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            phase: Phase::Closed,
            entered_at: crate::clock::now(),
            consecutive_failures: 0,
            failed_trials: 0,
            totals: BreakerTotals::default(),
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Stored state; an elapsed cooldown is only applied by [`Self::poll_at`].
    pub fn state(&self) -> CircuitState {
        self.phase.state()
    }

    /// State as of `now`: an open breaker whose cooldown has elapsed reads as half-open.
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.phase {
            Phase::Open { cooldown } if now.saturating_duration_since(self.entered_at) >= cooldown => {
                CircuitState::HalfOpen
            }
            phase => phase.state(),
        }
    }

    /// Whether [`Self::admit_at`] would let a call through at `now`, without
    /// moving state or using a trial slot.
    pub fn would_admit_at(&self, now: Instant) -> bool {
        match self.phase {
            Phase::Closed => true,
            Phase::HalfOpen { admitted } => admitted < self.config.half_open_trial_quota,
            Phase::Open { .. } => {
                self.state_at(now) == CircuitState::HalfOpen && self.config.half_open_trial_quota > 0
            }
        }
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Trial slots currently in use while half-open.
    pub fn half_open_trials(&self) -> u32 {
        match self.phase {
            Phase::HalfOpen { admitted } => admitted,
            _ => 0,
        }
    }

    pub fn totals(&self) -> BreakerTotals {
        self.totals
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Apply an elapsed cooldown (Open → Half-Open).
    pub fn poll_at(&mut self, now: Instant) -> Option<Transition> {
        match self.phase {
            Phase::Open { .. } if self.state_at(now) == CircuitState::HalfOpen => Some(self.transition(
                Phase::HalfOpen { admitted: 0 },
                TransitionReason::CooldownElapsed,
                now,
            )),
            _ => None,
        }
    }

    /// Returns `true` if the circuit lets a call through right now.
    pub fn allow(&mut self) -> bool {
        self.allow_at(crate::clock::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.admit_at(now).is_allowed()
    }

    /// Decide on one call. The only side effects are half-open trial
    /// bookkeeping, the rejection counter, and an Open → Half-Open move when
    /// the cooldown has elapsed.
    pub fn admit_at(&mut self, now: Instant) -> Admission {
        self.poll_at(now);
        match &mut self.phase {
            Phase::Closed => Admission::Admitted,
            Phase::HalfOpen { admitted } if *admitted < self.config.half_open_trial_quota => {
                *admitted += 1;
                Admission::Trial
            }
            Phase::HalfOpen { .. } | Phase::Open { .. } => {
                self.totals.total_rejections += 1;
                Admission::Rejected
            }
        }
    }

    /// Give back a trial slot whose call was abandoned before it finished.
    pub fn release_trial(&mut self) {
        if let Phase::HalfOpen { admitted } = &mut self.phase {
            *admitted = admitted.saturating_sub(1);
        }
    }

    /// Feed a call outcome; `stats` is the provider window after recording it.
    pub fn on_result(&mut self, kind: OutcomeKind, stats: RollingStats) -> Option<Transition> {
        self.on_result_at(kind, stats, crate::clock::now())
    }

    pub fn on_result_at(
        &mut self,
        kind: OutcomeKind,
        stats: RollingStats,
        now: Instant,
    ) -> Option<Transition> {
        self.totals.total_calls += 1;
        if kind.is_success() {
            self.totals.total_successes += 1;
        } else {
            self.totals.total_failures += 1;
        }

        match self.phase {
            Phase::Closed if kind.is_success() => {
                self.consecutive_failures = 0;
                None
            }
            Phase::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    Some(self.open(TransitionReason::ConsecutiveFailures, now))
                } else if self.error_rate_tripped(stats) {
                    Some(self.open(TransitionReason::ErrorRate, now))
                } else {
                    None
                }
            }
            // Late result of a call admitted before the breaker opened.
            Phase::Open { .. } => None,
            Phase::HalfOpen { .. } if kind.is_success() => {
                Some(self.close(TransitionReason::TrialSucceeded, now))
            }
            Phase::HalfOpen { .. } => {
                self.failed_trials += 1;
                self.consecutive_failures += 1;
                Some(self.open(TransitionReason::TrialFailed, now))
            }
        }
    }

    /// Manually open the breaker (operator intervention).
    pub fn force_open(&mut self, now: Instant) -> Option<Transition> {
        match self.phase {
            Phase::Open { .. } => None,
            _ => Some(self.open(TransitionReason::Forced, now)),
        }
    }

    /// Manually close the breaker and clear failure counters.
    pub fn force_close(&mut self, now: Instant) -> Option<Transition> {
        match self.phase {
            Phase::Closed => None,
            _ => Some(self.close(TransitionReason::Forced, now)),
        }
    }

    /// Return to the initial state, dropping totals and history.
    pub fn reset(&mut self, now: Instant) -> Option<Transition> {
        self.totals = BreakerTotals::default();
        self.history.clear();
        match self.phase {
            Phase::Closed => {
                self.consecutive_failures = 0;
                self.failed_trials = 0;
                None
            }
            _ => Some(self.close(TransitionReason::Reset, now)),
        }
    }

    pub fn view_at(&self, now: Instant) -> BreakerView {
        let cooldown_remaining_ms = match self.phase {
            Phase::Open { cooldown } => Some(
                cooldown
                    .saturating_sub(now.saturating_duration_since(self.entered_at))
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerView {
            state: self.state_at(now),
            consecutive_failures: self.consecutive_failures,
            half_open_trials: self.half_open_trials(),
            failed_trials: self.failed_trials,
            cooldown_remaining_ms,
            totals: self.totals,
            history: self.history.iter().cloned().collect(),
        }
    }

    fn error_rate_tripped(&self, stats: RollingStats) -> bool {
        stats.count >= self.config.min_sample_size.max(1)
            && stats
                .error_rate
                .is_some_and(|rate| rate > self.config.error_rate_threshold)
    }

    fn open(&mut self, reason: TransitionReason, now: Instant) -> Transition {
        let cooldown = self
            .config
            .cooldown_backoff
            .cooldown_for(self.config.open_cooldown, self.failed_trials);
        self.transition(Phase::Open { cooldown }, reason, now)
    }

    fn close(&mut self, reason: TransitionReason, now: Instant) -> Transition {
        self.consecutive_failures = 0;
        self.failed_trials = 0;
        self.transition(Phase::Closed, reason, now)
    }

    fn transition(&mut self, to: Phase, reason: TransitionReason, now: Instant) -> Transition {
        let from = self.phase.state();
        self.phase = to;
        self.entered_at = now;

        let transition = Transition {
            from,
            to: to.state(),
            reason,
            at_ms: chrono::Utc::now().timestamp_millis(),
        };
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        match to {
            Phase::Open { cooldown } => tracing::warn!(
                provider = %self.provider,
                %from,
                ?reason,
                failures = self.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "Circuit breaker → open"
            ),
            Phase::HalfOpen { .. } => {
                tracing::info!(provider = %self.provider, %from, "Circuit breaker → half-open")
            }
            Phase::Closed => {
                tracing::info!(provider = %self.provider, %from, ?reason, "Circuit breaker → closed")
            }
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "p",
            BreakerConfig {
                failure_threshold: threshold,
                open_cooldown: Duration::from_secs(60),
                half_open_trial_quota: 1,
                ..BreakerConfig::default()
            },
        )
    }

    fn no_stats() -> RollingStats {
        RollingStats::default()
    }

    fn fail(c: &mut CircuitBreaker, now: Instant) -> Option<Transition> {
        c.on_result_at(OutcomeKind::Failure, no_stats(), now)
    }

    fn succeed(c: &mut CircuitBreaker, now: Instant) -> Option<Transition> {
        c.on_result_at(OutcomeKind::Success, no_stats(), now)
    }

    #[test]
    fn starts_closed() {
        let mut c = cb(5);
        assert_eq!(c.state(), CircuitState::Closed);
        assert!(c.allow());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut c = cb(3);
        let t0 = Instant::now();
        assert!(fail(&mut c, t0).is_none());
        assert!(fail(&mut c, t0).is_none());
        let t = fail(&mut c, t0).unwrap();
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(t.reason, TransitionReason::ConsecutiveFailures);
        assert!(!c.allow_at(t0));
        assert_eq!(c.totals().total_rejections, 1);
    }

    #[test]
    fn timeouts_count_toward_threshold() {
        let mut c = cb(2);
        let t0 = Instant::now();
        c.on_result_at(OutcomeKind::Timeout, no_stats(), t0);
        c.on_result_at(OutcomeKind::Timeout, no_stats(), t0);
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut c = cb(3);
        let t0 = Instant::now();
        fail(&mut c, t0);
        fail(&mut c, t0);
        succeed(&mut c, t0);
        fail(&mut c, t0);
        fail(&mut c, t0);
        assert_eq!(c.state(), CircuitState::Closed);
        assert_eq!(c.consecutive_failures(), 2);
    }

    #[test]
    fn error_rate_trips_only_with_enough_samples() {
        let mut c = CircuitBreaker::new(
            "p",
            BreakerConfig {
                failure_threshold: 100,
                error_rate_threshold: 0.5,
                min_sample_size: 10,
                ..BreakerConfig::default()
            },
        );
        let t0 = Instant::now();
        let small = RollingStats { count: 4, error_rate: Some(0.75) };
        assert!(c.on_result_at(OutcomeKind::Failure, small, t0).is_none());

        let at_threshold = RollingStats { count: 10, error_rate: Some(0.5) };
        assert!(c.on_result_at(OutcomeKind::Failure, at_threshold, t0).is_none());

        let over = RollingStats { count: 10, error_rate: Some(0.6) };
        let t = c.on_result_at(OutcomeKind::Failure, over, t0).unwrap();
        assert_eq!(t.reason, TransitionReason::ErrorRate);
    }

    #[test]
    fn cooldown_moves_to_half_open() {
        let mut c = cb(1);
        let t0 = Instant::now();
        fail(&mut c, t0);
        assert!(!c.allow_at(t0 + Duration::from_secs(59)));
        assert_eq!(c.state_at(t0 + Duration::from_secs(60)), CircuitState::HalfOpen);
        // Read-only view does not transition.
        assert_eq!(c.state(), CircuitState::Open);

        assert_eq!(c.admit_at(t0 + Duration::from_secs(60)), Admission::Trial);
        assert_eq!(c.state(), CircuitState::HalfOpen);
        // Quota of one: the next call is rejected as if open.
        assert_eq!(c.admit_at(t0 + Duration::from_secs(61)), Admission::Rejected);
    }

    #[test]
    fn half_open_on_success_closes() {
        let mut c = cb(1);
        let t0 = Instant::now();
        fail(&mut c, t0);
        let later = t0 + Duration::from_secs(60);
        assert!(c.allow_at(later));

        let t = succeed(&mut c, later).unwrap();
        assert_eq!(t.to, CircuitState::Closed);
        assert_eq!(c.consecutive_failures(), 0);
        assert_eq!(c.half_open_trials(), 0);
        assert!(c.allow_at(later));
    }

    #[test]
    fn half_open_on_failure_reopens_and_restarts_cooldown() {
        let mut c = cb(1);
        let t0 = Instant::now();
        fail(&mut c, t0);
        let trial_at = t0 + Duration::from_secs(60);
        assert!(c.allow_at(trial_at));

        let t = fail(&mut c, trial_at).unwrap();
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(t.reason, TransitionReason::TrialFailed);
        assert_eq!(c.entered_at(), trial_at);
        assert!(!c.allow_at(trial_at + Duration::from_secs(59)));
        assert!(c.allow_at(trial_at + Duration::from_secs(60)));
    }

    #[test]
    fn exponential_backoff_lengthens_cooldown() {
        let mut c = CircuitBreaker::new(
            "p",
            BreakerConfig {
                failure_threshold: 1,
                open_cooldown: Duration::from_secs(10),
                cooldown_backoff: CooldownBackoff::Exponential {
                    multiplier: 2.0,
                    max_cooldown_ms: 25_000,
                },
                half_open_trial_quota: 1,
                ..BreakerConfig::default()
            },
        );
        let t0 = Instant::now();
        fail(&mut c, t0);
        let t1 = t0 + Duration::from_secs(10);
        assert!(c.allow_at(t1));
        fail(&mut c, t1); // cooldown now 20s
        assert!(!c.allow_at(t1 + Duration::from_secs(19)));
        let t2 = t1 + Duration::from_secs(20);
        assert!(c.allow_at(t2));
        fail(&mut c, t2); // 40s capped at 25s
        assert!(c.view_at(t2).cooldown_remaining_ms == Some(25_000));
    }

    #[test]
    fn released_trial_can_be_reused() {
        let mut c = cb(1);
        let t0 = Instant::now();
        fail(&mut c, t0);
        let later = t0 + Duration::from_secs(60);
        assert_eq!(c.admit_at(later), Admission::Trial);
        assert_eq!(c.admit_at(later), Admission::Rejected);
        c.release_trial();
        assert_eq!(c.admit_at(later), Admission::Trial);
    }

    #[test]
    fn would_admit_tracks_quota_without_side_effects() {
        let mut c = cb(1);
        let t0 = Instant::now();
        assert!(c.would_admit_at(t0));
        fail(&mut c, t0);
        assert!(!c.would_admit_at(t0));

        let later = t0 + Duration::from_secs(60);
        assert!(c.would_admit_at(later));
        assert_eq!(c.state(), CircuitState::Open);
        assert_eq!(c.totals().total_rejections, 0);

        assert_eq!(c.admit_at(later), Admission::Trial);
        assert!(!c.would_admit_at(later));
        c.release_trial();
        assert!(c.would_admit_at(later));
    }

    #[test]
    fn late_result_while_open_is_ignored() {
        let mut c = cb(1);
        let t0 = Instant::now();
        fail(&mut c, t0);
        assert!(succeed(&mut c, t0).is_none());
        assert_eq!(c.state(), CircuitState::Open);
    }

    #[test]
    fn force_and_reset() {
        let mut c = cb(5);
        let t0 = Instant::now();
        assert_eq!(c.force_open(t0).unwrap().reason, TransitionReason::Forced);
        assert!(c.force_open(t0).is_none());
        assert!(!c.allow_at(t0));
        c.force_close(t0).unwrap();
        assert!(c.allow_at(t0));

        c.force_open(t0);
        let t = c.reset(t0).unwrap();
        assert_eq!(t.reason, TransitionReason::Reset);
        assert_eq!(c.totals(), BreakerTotals::default());
        assert_eq!(c.history().count(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut c = cb(1);
        let t0 = Instant::now();
        for _ in 0..8 {
            c.force_open(t0);
            c.force_close(t0);
        }
        assert_eq!(c.history().count(), HISTORY_LEN);
    }

    #[test]
    fn display_matches_state_names() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
    }
}
