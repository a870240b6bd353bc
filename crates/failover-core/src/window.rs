//! Rolling metrics window: recent latency samples and outcome flags per provider.
//!
//! The window is a ring buffer bounded both by sample count and (optionally)
//! by sample age; whichever bound is reached first evicts the oldest sample.
//! Derived values:
//!
//! - `count`: samples currently represented
//! - `error_rate`: failures (incl. timeouts) / count, `None` when empty
//! - `p50` / `p95`: nearest-rank order statistics over successful latencies
//!   (optionally failed ones too)
//!
//! A window can be seeded with a snapshot pulled from the metrics store at
//! startup; see [`MetricsWindow::merge`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::provider::{CallOutcome, OutcomeKind};

/// Window bounds.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Maximum samples kept.
    pub capacity: usize,
    /// Maximum sample age (`None` = count bound only).
    pub time_bound: Option<Duration>,
    /// Include failure/timeout latencies in percentiles.
    pub include_failure_latency: bool,
    /// Minimum time between snapshot pushes (`None` = never due).
    pub flush_interval: Option<Duration>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            time_bound: Some(Duration::from_secs(60)),
            include_failure_latency: false,
            flush_interval: None,
        }
    }
}

/// Aggregated view of a window, as pushed to and pulled from the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub count: usize,
    /// `None` means "insufficient data", not "no errors".
    pub error_rate: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    /// Wall-clock time (Unix ms) the snapshot was taken.
    pub window_end_ms: i64,
}

impl WindowSnapshot {
    pub fn empty(window_end_ms: i64) -> Self {
        Self {
            count: 0,
            error_rate: None,
            p50_ms: None,
            p95_ms: None,
            window_end_ms,
        }
    }

    pub fn p50(&self) -> Option<Duration> {
        self.p50_ms.map(ms_to_duration)
    }

    pub fn p95(&self) -> Option<Duration> {
        self.p95_ms.map(ms_to_duration)
    }
}

/// What the breaker reads from the window after each outcome.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RollingStats {
    pub count: usize,
    pub error_rate: Option<f64>,
}

/// Snapshot inputs copied out under the provider lock; sorting happens after
/// the lock is released (see [`PendingSnapshot::finish`]).
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    count: usize,
    failures: usize,
    latencies: Vec<Duration>,
    seed_percentiles: Option<(Option<f64>, Option<f64>)>,
    window_end_ms: i64,
}

impl PendingSnapshot {
    pub fn finish(mut self) -> WindowSnapshot {
        let (p50_ms, p95_ms) = match self.seed_percentiles {
            Some(seeded) => seeded,
            None => {
                self.latencies.sort_unstable();
                (
                    nearest_rank(&self.latencies, 0.50).map(duration_to_ms),
                    nearest_rank(&self.latencies, 0.95).map(duration_to_ms),
                )
            }
        };
        WindowSnapshot {
            count: self.count,
            error_rate: (self.count > 0).then(|| self.failures as f64 / self.count as f64),
            p50_ms,
            p95_ms,
            window_end_ms: self.window_end_ms,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency: Duration,
    kind: OutcomeKind,
}

/// A remote snapshot standing in for samples older than the local ones.
#[derive(Debug, Clone)]
struct Seed {
    snapshot: WindowSnapshot,
    /// Leading local samples already represented by the seed.
    covered: usize,
    covered_failures: usize,
}

/// Sample and failure counts after applying the time bound and the seed.
#[derive(Debug, Clone, Copy)]
struct Totals {
    expired: usize,
    count: usize,
    failures: usize,
    /// Samples contributed by the seed (0 when unseeded).
    seed_count: usize,
}

/// Fixed-capacity rolling store of recent outcomes for one provider.
#[derive(Debug)]
pub struct MetricsWindow {
    config: WindowConfig,
    samples: VecDeque<Sample>,
    failures: usize,
    seed: Option<Seed>,
    /// Monotonic ↔ wall-clock anchor used to timestamp samples.
    anchor: Instant,
    anchor_ms: i64,
    last_flush: Instant,
}

impl MetricsWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self::with_anchor(config, crate::clock::now(), chrono::Utc::now().timestamp_millis())
    }

    /// Create a window whose wall clock reads `anchor_ms` at `anchor`.
    pub fn with_anchor(config: WindowConfig, anchor: Instant, anchor_ms: i64) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(4_096)),
            config: WindowConfig { capacity, ..config },
            failures: 0,
            seed: None,
            anchor,
            anchor_ms,
            last_flush: anchor,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Local samples currently held (ignores the seed and the time bound).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.seed.is_none()
    }

    /// Append a sample, evicting the oldest beyond capacity or age.
    ///
    /// Returns `true` when the flush interval has elapsed since the last flush;
    /// the caller then pushes a snapshot off the request path.
    pub fn record(&mut self, outcome: &CallOutcome) -> bool {
        let now = outcome.at;
        self.evict_expired(now);
        self.samples.push_back(Sample {
            at: outcome.at,
            latency: outcome.latency,
            kind: outcome.kind,
        });
        if outcome.kind.is_failure() {
            self.failures += 1;
        }
        while self.samples.len() > self.config.capacity {
            self.pop_oldest();
        }
        if let Some(seed) = &self.seed {
            if self.samples.len() - seed.covered >= self.config.capacity {
                // Local data alone fills the window; the seed has aged out.
                self.seed = None;
            }
        }

        match self.config.flush_interval {
            Some(interval) if now.saturating_duration_since(self.last_flush) >= interval => {
                self.last_flush = now;
                true
            }
            _ => false,
        }
    }

    /// Drop samples (and a seed) older than the time bound.
    pub fn evict_expired(&mut self, now: Instant) {
        let expired = self.expired_len(now);
        for _ in 0..expired {
            self.pop_oldest();
        }
        if let Some(seed) = &self.seed {
            if self.seed_expired(&seed.snapshot, now) {
                self.seed = None;
            }
        }
    }

    /// Count and error rate the breaker uses for its rate-based trip.
    pub fn rolling_stats(&self, now: Instant) -> RollingStats {
        let totals = self.totals_at(now);
        RollingStats {
            count: totals.count,
            error_rate: (totals.count > 0)
                .then(|| totals.failures as f64 / totals.count as f64),
        }
    }

    /// `{count, error_rate, p50, p95}` as of now.
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot_at(crate::clock::now())
    }

    /// Snapshot as of `now`. Does not mutate the window, so repeated calls
    /// with no intervening `record` agree.
    pub fn snapshot_at(&self, now: Instant) -> WindowSnapshot {
        self.prepare_snapshot(now).finish()
    }

    /// Copy out what a snapshot needs without sorting.
    pub fn prepare_snapshot(&self, now: Instant) -> PendingSnapshot {
        let totals = self.totals_at(now);
        let covered = self.live_seed(now).map_or(0, |s| s.covered);
        let first_local = totals.expired.max(covered);
        let latencies: Vec<Duration> = self
            .samples
            .iter()
            .skip(first_local)
            .filter(|s| s.kind.is_success() || self.config.include_failure_latency)
            .map(|s| s.latency)
            .collect();

        // Percentiles come from whichever side represents more samples.
        let seed_percentiles = self.live_seed(now).and_then(|seed| {
            (totals.seed_count > latencies.len())
                .then(|| (seed.snapshot.p50_ms, seed.snapshot.p95_ms))
        });

        PendingSnapshot {
            count: totals.count,
            failures: totals.failures,
            latencies,
            seed_percentiles,
            window_end_ms: self.wall_ms(now),
        }
    }

    /// Fold in a snapshot pulled from the metrics store.
    ///
    /// The most recent snapshot wins: one older than (or as old as) the
    /// current seed is ignored. Local samples taken at or before the
    /// snapshot's `window_end_ms` are treated as already counted by it, so a
    /// window re-merging its own pushed snapshot does not double-count.
    /// The seed stands in for the oldest part of the window and is evicted
    /// first as local samples arrive.
    ///
    /// Returns `true` if the snapshot was adopted.
    pub fn merge(&mut self, remote: WindowSnapshot) -> bool {
        self.merge_at(remote, crate::clock::now())
    }

    pub fn merge_at(&mut self, remote: WindowSnapshot, now: Instant) -> bool {
        if remote.count == 0 || self.seed_expired(&remote, now) {
            return false;
        }
        if let Some(seed) = &self.seed {
            if remote.window_end_ms <= seed.snapshot.window_end_ms {
                return false;
            }
        }
        let end = remote.window_end_ms;
        let covered = self.samples.partition_point(|s| self.wall_ms(s.at) <= end);
        let covered_failures = self
            .samples
            .iter()
            .take(covered)
            .filter(|s| s.kind.is_failure())
            .count();
        self.seed = Some(Seed {
            snapshot: remote,
            covered,
            covered_failures,
        });
        true
    }

    /// Forget all samples and any seed.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.failures = 0;
        self.seed = None;
    }

    /// Wall-clock milliseconds corresponding to a monotonic instant.
    pub fn wall_ms(&self, at: Instant) -> i64 {
        if at >= self.anchor {
            self.anchor_ms + at.duration_since(self.anchor).as_millis() as i64
        } else {
            self.anchor_ms - self.anchor.duration_since(at).as_millis() as i64
        }
    }

    fn pop_oldest(&mut self) {
        let Some(sample) = self.samples.pop_front() else {
            return;
        };
        if sample.kind.is_failure() {
            self.failures -= 1;
        }
        if let Some(seed) = &mut self.seed {
            if seed.covered > 0 {
                seed.covered -= 1;
                if sample.kind.is_failure() {
                    seed.covered_failures -= 1;
                }
            }
        }
    }

    fn expired_len(&self, now: Instant) -> usize {
        match self.config.time_bound {
            Some(bound) => self
                .samples
                .partition_point(|s| now.saturating_duration_since(s.at) > bound),
            None => 0,
        }
    }

    fn seed_expired(&self, snapshot: &WindowSnapshot, now: Instant) -> bool {
        match self.config.time_bound {
            Some(bound) => snapshot.window_end_ms < self.wall_ms(now) - bound.as_millis() as i64,
            None => false,
        }
    }

    fn live_seed(&self, now: Instant) -> Option<&Seed> {
        self.seed
            .as_ref()
            .filter(|seed| !self.seed_expired(&seed.snapshot, now))
    }

    fn totals_at(&self, now: Instant) -> Totals {
        let expired = self.expired_len(now);
        let covered = self.seed.as_ref().map_or(0, |s| s.covered);

        let mut expired_failures = 0;
        let mut expired_covered_failures = 0;
        for (i, sample) in self.samples.iter().take(expired).enumerate() {
            if sample.kind.is_failure() {
                expired_failures += 1;
                if i < covered {
                    expired_covered_failures += 1;
                }
            }
        }
        let live = self.samples.len() - expired;
        let live_failures = self.failures - expired_failures;

        let Some(seed) = self.live_seed(now) else {
            return Totals {
                expired,
                count: live,
                failures: live_failures,
                seed_count: 0,
            };
        };

        let covered_live = covered - covered.min(expired);
        let covered_live_failures = seed.covered_failures - expired_covered_failures;
        let newer = live - covered_live;
        let newer_failures = live_failures - covered_live_failures;

        let seed_count = seed
            .snapshot
            .count
            .min(self.config.capacity.saturating_sub(newer));
        let seed_failures = seed
            .snapshot
            .error_rate
            .map_or(0, |rate| (rate * seed_count as f64).round() as usize)
            .min(seed_count);

        Totals {
            expired,
            count: newer + seed_count,
            failures: newer_failures + seed_failures,
            seed_count,
        }
    }
}

/// Nearest-rank percentile over sorted values.
///
/// The one-based rank `ceil(p * n)` picks the smallest sample with at least
/// `p` of the values at or below it. For 100 samples `51..=150`, p50 is 100
/// and p95 is 145; for `[10, 20, 30]`, p50 is 20.
pub fn nearest_rank(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    // Subtract a hair so float noise like 95.00000000000001 doesn't bump the rank.
    let rank = (p.clamp(0.0, 1.0) * n as f64 - 1e-9).ceil().max(0.0) as usize;
    Some(sorted[rank.saturating_sub(1).min(n - 1)])
}

fn duration_to_ms(d: Duration) -> f64 {
    d.as_micros() as f64 / 1_000.0
}

fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1_000.0).round() as u64)
}
