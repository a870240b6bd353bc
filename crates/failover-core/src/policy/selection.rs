//! Provider ordering applied before the router walks the eligible list.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Latency above which a provider's latency score bottoms out.
const LATENCY_SCORE_CEILING_MS: f64 = 5_000.0;

/// Order in which eligible providers are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Ascending configured priority; ties keep registration order.
    #[default]
    Priority,
    /// Priority order rotated by one position per dispatch.
    RoundRobin,
    /// Ascending windowed p50. Providers without latency data go last.
    LowestLatency,
    /// Descending weighted blend of success rate, latency and availability.
    HealthScore,
}

/// What the selection policy needs to know about one candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankInfo {
    pub priority: u32,
    /// Registration sequence number, the final tie-break.
    pub seq: u64,
    pub p50_ms: Option<f64>,
    pub error_rate: Option<f64>,
    /// `false` when the breaker would currently reject.
    pub admitting: bool,
}

impl RankInfo {
    /// `0.5 * success_rate + 0.3 * latency_score + 0.2 * availability`.
    ///
    /// Providers without data are treated as fully successful and fast, so a
    /// fresh provider is not starved behind one with a short good history.
    pub fn health_score(&self) -> f64 {
        let success_rate = 1.0 - self.error_rate.unwrap_or(0.0);
        let latency_score = self
            .p50_ms
            .map(|ms| (1.0 - ms / LATENCY_SCORE_CEILING_MS).max(0.0))
            .unwrap_or(1.0);
        let availability = if self.admitting { 1.0 } else { 0.0 };
        success_rate * 0.5 + latency_score * 0.3 + availability * 0.2
    }

    fn by_priority(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl SelectionPolicy {
    /// Whether ordering needs live window/breaker data (and so the per-provider locks).
    pub fn needs_live_stats(self) -> bool {
        matches!(self, Self::LowestLatency | Self::HealthScore)
    }

    /// Sort `items` in place. `rotation` is only used by [`SelectionPolicy::RoundRobin`].
    pub fn order<T>(self, items: &mut [T], rotation: usize, rank: impl Fn(&T) -> RankInfo) {
        items.sort_by(|a, b| rank(a).by_priority(&rank(b)));
        match self {
            Self::Priority => {}
            Self::RoundRobin => {
                if !items.is_empty() {
                    let len = items.len();
                    items.rotate_left(rotation % len);
                }
            }
            Self::LowestLatency => {
                // Stable sort: equal or unknown latencies keep priority order.
                items.sort_by(|a, b| match (rank(a).p50_ms, rank(b).p50_ms) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                });
            }
            Self::HealthScore => {
                items.sort_by(|a, b| {
                    rank(b)
                        .health_score()
                        .partial_cmp(&rank(a).health_score())
                        .unwrap_or(Ordering::Equal)
                });
            }
        }
    }
}
