//! Hooks for observability consumers: breaker events and dispatch callbacks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::{CircuitState, Transition, TransitionReason};
use crate::provider::{OutcomeKind, ProviderId};

/// A breaker state change, broadcast by the router to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub provider: ProviderId,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at_ms: i64,
}

impl BreakerEvent {
    pub fn new(provider: ProviderId, transition: Transition) -> Self {
        Self {
            provider,
            from: transition.from,
            to: transition.to,
            reason: transition.reason,
            at_ms: transition.at_ms,
        }
    }
}

/// Synchronous callbacks invoked on the dispatch path.
///
/// Called outside every provider lock. Implementations must be cheap and
/// must not block; every method defaults to a no-op.
pub trait DispatchObserver: Send + Sync {
    /// A provider was invoked and the attempt finished.
    fn on_outcome(&self, _provider: &ProviderId, _kind: OutcomeKind, _latency: Duration) {}

    /// A provider was skipped because its breaker rejected the call.
    fn on_rejected(&self, _provider: &ProviderId) {}

    fn on_transition(&self, _event: &BreakerEvent) {}

    /// A dispatch ended with no provider able to serve it.
    fn on_exhausted(&self, _attempted: usize, _rejected: usize) {}

    /// A due snapshot could not be queued for the store.
    fn on_snapshot_dropped(&self, _provider: &ProviderId) {}
}
