//! Failover metrics definitions.
//!
//! All metrics use OpenTelemetry conventions.
//! They can be exported via OTLP to Prometheus, Grafana, Datadog, etc.

use std::time::Duration;

use failover_core::{BreakerEvent, DispatchObserver, OutcomeKind, ProviderId};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Central metrics handle for the failover router.
///
/// Implements [`DispatchObserver`] for the per-call instruments; breaker
/// transitions are counted from the router's event stream by
/// [`spawn_event_recorder`](crate::events::spawn_event_recorder).
#[derive(Clone)]
pub struct FailoverMetrics {
    pub calls: Counter<u64>,
    pub rejections: Counter<u64>,
    pub transitions: Counter<u64>,
    pub call_latency_ms: Histogram<f64>,
    pub dispatch_exhausted: Counter<u64>,
    pub snapshot_drops: Counter<u64>,
}

impl FailoverMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            calls: meter
                .u64_counter("failover.calls")
                .with_description("Provider invocations, by outcome")
                .build(),
            rejections: meter
                .u64_counter("failover.rejections")
                .with_description("Calls skipped because the provider's breaker rejected them")
                .build(),
            transitions: meter
                .u64_counter("failover.transitions")
                .with_description("Circuit breaker state changes")
                .build(),
            call_latency_ms: meter
                .f64_histogram("failover.call_latency_ms")
                .with_description("Provider call latency in milliseconds")
                .build(),
            dispatch_exhausted: meter
                .u64_counter("failover.dispatch_exhausted")
                .with_description("Requests that no provider could serve")
                .build(),
            snapshot_drops: meter
                .u64_counter("failover.snapshot_drops")
                .with_description("Window snapshots dropped before reaching the store")
                .build(),
        }
    }

    /// Instruments on the global meter provider (no-op until one is installed).
    pub fn from_global() -> Self {
        Self::new(&global::meter("failover"))
    }

    pub fn record_call(&self, provider: &ProviderId, kind: OutcomeKind, latency: Duration) {
        let provider = KeyValue::new("provider", provider.to_string());
        self.calls.add(
            1,
            &[provider.clone(), KeyValue::new("outcome", kind.to_string())],
        );
        self.call_latency_ms
            .record(latency.as_secs_f64() * 1_000.0, &[provider]);
    }

    pub fn record_transition(&self, event: &BreakerEvent) {
        self.transitions.add(
            1,
            &[
                KeyValue::new("provider", event.provider.to_string()),
                KeyValue::new("to", event.to.to_string()),
            ],
        );
    }
}

impl DispatchObserver for FailoverMetrics {
    fn on_outcome(&self, provider: &ProviderId, kind: OutcomeKind, latency: Duration) {
        self.record_call(provider, kind, latency);
    }

    fn on_rejected(&self, provider: &ProviderId) {
        self.rejections
            .add(1, &[KeyValue::new("provider", provider.to_string())]);
    }

    fn on_exhausted(&self, _attempted: usize, _rejected: usize) {
        self.dispatch_exhausted.add(1, &[]);
    }

    fn on_snapshot_dropped(&self, provider: &ProviderId) {
        self.snapshot_drops
            .add(1, &[KeyValue::new("provider", provider.to_string())]);
    }
}
