//! Read-only health projection for dashboards and logs.
//!
//! Each provider's state is copied out under its read lock and every derived
//! value (percentile sorting included) is computed after the lock is
//! released, so reporting never holds up dispatch for longer than a copy.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerTotals, CircuitState, Transition};
use crate::clock;
use crate::provider::ProviderId;
use crate::registry::{ProviderSlot, Registry};

/// Aggregate health across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every breaker is closed.
    Healthy,
    /// Some breakers are open or half-open.
    Degraded,
    /// No breaker is closed.
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of the most recent background health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub healthy: bool,
    /// Wall-clock time of the check (Unix ms).
    pub at_ms: i64,
    pub latency_ms: f64,
    /// Error text when the check failed or timed out.
    pub error: Option<String>,
}

/// Point-in-time view of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub priority: u32,
    pub state: CircuitState,
    pub count: usize,
    pub error_rate: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub half_open_trials: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub totals: BreakerTotals,
    /// Most recent transitions, oldest first.
    pub transitions: Vec<Transition>,
    /// Set once a health monitor has checked this provider.
    #[serde(default)]
    pub last_check: Option<CheckStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub status: HealthStatus,
}

/// Read-only handle over the router's provider state. Cheap to clone.
#[derive(Clone)]
pub struct HealthReporter {
    registry: Arc<Registry>,
}

impl HealthReporter {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Every provider, in priority order.
    pub fn report(&self) -> Vec<ProviderHealth> {
        self.report_at(clock::now())
    }

    pub fn report_at(&self, now: Instant) -> Vec<ProviderHealth> {
        let mut slots = self.registry.all();
        slots.sort_by_key(|s| (s.config.priority, s.seq));
        slots.iter().map(|slot| health_of(slot, now)).collect()
    }

    /// The same data keyed by provider id.
    pub fn report_map(&self) -> BTreeMap<ProviderId, ProviderHealth> {
        self.report()
            .into_iter()
            .map(|h| (h.provider.clone(), h))
            .collect()
    }

    pub fn provider(&self, id: &ProviderId) -> Option<ProviderHealth> {
        let slot = self.registry.get(id)?;
        Some(health_of(&slot, clock::now()))
    }

    pub fn summary(&self) -> HealthSummary {
        summarize(&self.report())
    }
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter")
            .field("providers", &self.registry.len())
            .finish()
    }
}

/// Fold per-provider states into a summary.
pub fn summarize(report: &[ProviderHealth]) -> HealthSummary {
    let count = |state| report.iter().filter(|h| h.state == state).count();
    let closed = count(CircuitState::Closed);
    let open = count(CircuitState::Open);
    let half_open = count(CircuitState::HalfOpen);
    let status = match closed {
        0 => HealthStatus::Unhealthy,
        n if n == report.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    };
    HealthSummary {
        total: report.len(),
        closed,
        open,
        half_open,
        status,
    }
}

fn health_of(slot: &ProviderSlot, now: Instant) -> ProviderHealth {
    let (pending, breaker, last_check) = {
        let state = slot.read();
        (
            state.window.prepare_snapshot(now),
            state.breaker.view_at(now),
            state.last_check.clone(),
        )
    };
    let snapshot = pending.finish();
    ProviderHealth {
        provider: slot.id().clone(),
        priority: slot.config.priority,
        state: breaker.state,
        count: snapshot.count,
        error_rate: snapshot.error_rate,
        p50_ms: snapshot.p50_ms,
        p95_ms: snapshot.p95_ms,
        consecutive_failures: breaker.consecutive_failures,
        half_open_trials: breaker.half_open_trials,
        cooldown_remaining_ms: breaker.cooldown_remaining_ms,
        totals: breaker.totals,
        transitions: breaker.history,
        last_check,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(id: &str, state: CircuitState) -> ProviderHealth {
        ProviderHealth {
            provider: id.into(),
            priority: 1,
            state,
            count: 0,
            error_rate: None,
            p50_ms: None,
            p95_ms: None,
            consecutive_failures: 0,
            half_open_trials: 0,
            cooldown_remaining_ms: None,
            totals: BreakerTotals::default(),
            transitions: Vec::new(),
            last_check: None,
        }
    }

    #[test]
    fn all_closed_is_healthy() {
        let s = summarize(&[health("a", CircuitState::Closed), health("b", CircuitState::Closed)]);
        assert_eq!(s.status, HealthStatus::Healthy);
        assert_eq!(s.closed, 2);
    }

    #[test]
    fn some_open_is_degraded() {
        let s = summarize(&[health("a", CircuitState::Closed), health("b", CircuitState::Open)]);
        assert_eq!(s.status, HealthStatus::Degraded);
        assert_eq!(s.open, 1);
    }

    #[test]
    fn none_closed_is_unhealthy() {
        let s = summarize(&[health("a", CircuitState::HalfOpen), health("b", CircuitState::Open)]);
        assert_eq!(s.status, HealthStatus::Unhealthy);
        assert_eq!(s.half_open, 1);
    }

    #[test]
    fn report_serializes_state_names() {
        let json = serde_json::to_value(health("a", CircuitState::HalfOpen)).unwrap();
        assert_eq!(json["state"], "half_open");
        assert!(json["error_rate"].is_null());
    }
}
