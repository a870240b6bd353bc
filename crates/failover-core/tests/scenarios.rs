//! End-to-end behavior of breaker, window, store and router together.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use proptest::prelude::*;

use failover_core::{
    BreakerConfig, CallOutcome, CircuitBreaker, CircuitState, DispatchError, FailoverConfig,
    MemoryMetricsStore, MetricsStore, MetricsWindow, OutcomeKind, ProviderConfig, ProviderError,
    ProviderId, ProviderInvoker, ProviderRouter, RollingStats, WindowConfig,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn breaker(threshold: u32, cooldown: Duration, quota: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "A",
        BreakerConfig {
            failure_threshold: threshold,
            open_cooldown: cooldown,
            half_open_trial_quota: quota,
            ..BreakerConfig::default()
        },
    )
}

fn count_window(capacity: usize) -> MetricsWindow {
    MetricsWindow::new(WindowConfig {
        capacity,
        time_bound: None,
        include_failure_latency: false,
        flush_interval: None,
    })
}

/// Invoker whose failing providers are listed up front; records every call.
struct ScriptedInvoker {
    failing: HashSet<ProviderId>,
    delay: Duration,
    calls: Mutex<Vec<ProviderId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedInvoker {
    fn new(failing: &[&str]) -> Self {
        Self {
            failing: failing.iter().map(|id| ProviderId::from(*id)).collect(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.to_string()).collect()
    }
}

#[async_trait]
impl ProviderInvoker for ScriptedInvoker {
    type Request = u32;
    type Response = String;

    async fn invoke(
        &self,
        provider: &ProviderId,
        request: &u32,
        _timeout: Duration,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(provider.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(provider) {
            Err(ProviderError::Status { code: 503, message: "overloaded".into() })
        } else {
            Ok(format!("{provider}:{request}"))
        }
    }
}

fn provider(id: &str, priority: u32) -> ProviderConfig {
    ProviderConfig {
        failure_threshold: 3,
        open_cooldown_ms: 60_000,
        ..ProviderConfig::new(id).with_priority(priority)
    }
}

// ─── Breaker ─────────────────────────────────────────────────────────────────

#[test]
fn three_consecutive_failures_open_provider_a() {
    let mut cb = breaker(3, Duration::from_secs(30), 1);
    let now = Instant::now();
    for _ in 0..3 {
        cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), now);
    }
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(!cb.allow_at(now));
}

#[test]
fn half_open_admits_at_most_quota_trials() {
    let mut cb = breaker(1, Duration::from_secs(10), 2);
    let t0 = Instant::now();
    cb.on_result_at(OutcomeKind::Timeout, RollingStats::default(), t0);

    let after = t0 + Duration::from_secs(10);
    let admitted = (0..5).filter(|_| cb.allow_at(after)).count();
    assert_eq!(admitted, 2);
    assert_eq!(cb.state(), CircuitState::HalfOpen);
}

#[test]
fn successful_trial_closes_with_counters_reset() {
    let mut cb = breaker(2, Duration::from_secs(10), 1);
    let t0 = Instant::now();
    cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), t0);
    cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), t0);
    let after = t0 + Duration::from_secs(10);
    assert!(cb.allow_at(after));
    cb.on_result_at(OutcomeKind::Success, RollingStats::default(), after);

    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.consecutive_failures(), 0);
    assert_eq!(cb.half_open_trials(), 0);
}

#[test]
fn failed_trial_reopens_and_restarts_cooldown() {
    let mut cb = breaker(1, Duration::from_secs(10), 1);
    let t0 = Instant::now();
    cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), t0);
    let trial = t0 + Duration::from_secs(15);
    assert!(cb.allow_at(trial));
    cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), trial);

    assert_eq!(cb.state(), CircuitState::Open);
    // The cooldown counts from the failed trial, not the first opening.
    assert!(!cb.allow_at(trial + Duration::from_secs(9)));
    assert!(cb.allow_at(trial + Duration::from_secs(10)));
}

// ─── Window ──────────────────────────────────────────────────────────────────

#[test]
fn percentiles_over_last_hundred_of_150() {
    let mut w = count_window(100);
    let t0 = Instant::now();
    for ms in 1..=150u64 {
        w.record(&CallOutcome::success("A", Duration::from_millis(ms)).at(t0));
    }
    let snap = w.snapshot_at(t0);
    assert_eq!(snap.count, 100);
    assert_eq!(snap.p50_ms, Some(100.0));
    assert_eq!(snap.p95_ms, Some(145.0));
}

#[tokio::test]
async fn store_round_trip_never_loses_samples() {
    let store = MemoryMetricsStore::new();
    let id = ProviderId::from("A");
    let mut original = count_window(50);
    for ms in 0..30u64 {
        let outcome = if ms % 4 == 0 {
            CallOutcome::failure(id.clone(), Duration::from_millis(ms))
        } else {
            CallOutcome::success(id.clone(), Duration::from_millis(ms))
        };
        original.record(&outcome);
    }
    let before = original.snapshot();
    store.push(&id, &before).await.unwrap();

    let mut restored = count_window(50);
    let pulled = store.pull(&id).await.unwrap().unwrap();
    assert!(restored.merge(pulled));
    let after = restored.snapshot();
    assert!(after.count >= before.count);
    assert_eq!(after.error_rate, before.error_rate);
}

// ─── Router ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn open_provider_is_skipped_and_left_unchanged() {
    let router = ProviderRouter::new(
        FailoverConfig::new(vec![provider("A", 1), provider("B", 2)]),
        ScriptedInvoker::new(&[]),
    )
    .unwrap();
    router.force_open(&"A".into()).unwrap();
    let before = router.reporter().provider(&"A".into()).unwrap();

    assert_eq!(router.dispatch(&7).await.unwrap(), "B:7");
    assert_eq!(router.invoker().calls(), ["B"]);

    let after = router.reporter().provider(&"A".into()).unwrap();
    assert_eq!(after.state, CircuitState::Open);
    assert_eq!(after.count, before.count);
    assert_eq!(after.totals.total_calls, before.totals.total_calls);
}

#[tokio::test]
async fn all_open_providers_fail_without_network_calls() {
    let router = ProviderRouter::new(
        FailoverConfig::new(vec![provider("A", 1), provider("B", 2), provider("C", 3)]),
        ScriptedInvoker::new(&[]),
    )
    .unwrap();
    for id in ["A", "B", "C"] {
        router.force_open(&id.into()).unwrap();
    }
    let err = router.dispatch(&1).await.unwrap_err();
    assert!(err.is_exhausted());
    assert!(matches!(err, DispatchError::AllProvidersUnavailable { attempted: 0, rejected: 3 }));
    assert!(router.invoker().calls().is_empty());
    assert_eq!(router.reporter().summary().open, 3);
}

#[tokio::test]
async fn failing_primary_trips_then_stops_receiving_load() {
    let router = ProviderRouter::new(
        FailoverConfig::new(vec![provider("A", 1), provider("B", 2)]),
        ScriptedInvoker::new(&["A"]),
    )
    .unwrap();
    for i in 0..10 {
        assert_eq!(router.dispatch(&i).await.unwrap(), format!("B:{i}"));
    }
    let a_calls = router.invoker().calls().iter().filter(|c| *c == "A").count();
    assert_eq!(a_calls, 3);

    let report = router.reporter().report();
    assert_eq!(report[0].provider.as_str(), "A");
    assert_eq!(report[0].state, CircuitState::Open);
    assert_eq!(report[0].totals.total_rejections, 7);
    assert_eq!(report[1].count, 10);
}

#[tokio::test(start_paused = true)]
async fn concurrent_half_open_trials_stay_within_quota() {
    let config = FailoverConfig::new(vec![ProviderConfig {
        open_cooldown_ms: 1_000,
        half_open_trial_quota: 2,
        timeout_ms: 60_000,
        ..ProviderConfig::new("A")
    }]);
    let invoker = ScriptedInvoker::new(&[]).with_delay(Duration::from_millis(50));
    let router = Arc::new(ProviderRouter::new(config, invoker).unwrap());
    router.force_open(&"A".into()).unwrap();
    tokio::time::advance(Duration::from_millis(1_500)).await;

    let results = futures::future::join_all((0..10).map(|i| {
        let router = router.clone();
        async move { router.dispatch(&i).await }
    }))
    .await;

    let served = results.iter().filter(|r| r.is_ok()).count();
    assert!(served >= 1);
    assert!(router.invoker().max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(router.breaker_state(&"A".into()), Some(CircuitState::Closed));
}

// ─── Properties ──────────────────────────────────────────────────────────────

fn outcome_kind() -> impl Strategy<Value = OutcomeKind> {
    prop_oneof![
        Just(OutcomeKind::Success),
        Just(OutcomeKind::Failure),
        Just(OutcomeKind::Timeout),
    ]
}

proptest! {
    #[test]
    fn successes_never_leave_closed(n in 1usize..500, rate in 0.0f64..1.0) {
        let mut cb = breaker(1, Duration::from_secs(1), 1);
        let now = Instant::now();
        let stats = RollingStats { count: 1_000, error_rate: Some(rate) };
        for _ in 0..n {
            prop_assert!(cb.allow_at(now));
            prop_assert!(cb.on_result_at(OutcomeKind::Success, stats, now).is_none());
        }
        prop_assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn threshold_failures_always_open(
        prefix in proptest::collection::vec(outcome_kind(), 0..50),
        threshold in 1u32..10,
    ) {
        let mut cb = breaker(threshold, Duration::from_secs(60), 1);
        let now = Instant::now();
        for kind in prefix {
            cb.on_result_at(kind, RollingStats::default(), now);
        }
        for _ in 0..threshold {
            cb.on_result_at(OutcomeKind::Failure, RollingStats::default(), now);
        }
        prop_assert_eq!(cb.state(), CircuitState::Open);
        prop_assert!(!cb.allow_at(now));
    }

    #[test]
    fn window_count_never_exceeds_capacity(
        capacity in 1usize..200,
        samples in proptest::collection::vec((outcome_kind(), 0u64..5_000), 0..600),
    ) {
        let mut w = count_window(capacity);
        let now = Instant::now();
        for (kind, ms) in samples {
            w.record(&CallOutcome::new("A", kind, Duration::from_millis(ms)).at(now));
            prop_assert!(w.snapshot_at(now).count <= capacity);
        }
    }

    #[test]
    fn snapshot_is_idempotent(
        samples in proptest::collection::vec((outcome_kind(), 0u64..5_000), 0..300),
    ) {
        let mut w = count_window(100);
        let now = Instant::now();
        for (kind, ms) in samples {
            w.record(&CallOutcome::new("A", kind, Duration::from_millis(ms)).at(now));
        }
        prop_assert_eq!(w.snapshot_at(now), w.snapshot_at(now));
    }

    #[test]
    fn p95_is_never_below_p50(latencies in proptest::collection::vec(0u64..10_000, 1..300)) {
        let mut w = count_window(1_000);
        let now = Instant::now();
        for ms in latencies {
            w.record(&CallOutcome::success("A", Duration::from_millis(ms)).at(now));
        }
        let snap = w.snapshot_at(now);
        prop_assert!(snap.p95_ms >= snap.p50_ms);
    }
}
