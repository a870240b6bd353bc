//! Priority failover dispatch over per-provider breakers and windows.
//!
//! For each request the router orders the registered providers by its
//! [`SelectionPolicy`], then walks the list: a provider whose breaker rejects
//! is skipped without being invoked (and without recording an outcome),
//! otherwise it is called under its configured timeout. The first success is
//! returned; failures and timeouts are recorded and the walk continues. When
//! the list is exhausted the caller gets a single
//! [`DispatchError::AllProvidersUnavailable`].
//!
//! # Usage
//! ```rust,no_run
//! use failover_core::{FailoverConfig, ProviderConfig, ProviderRouter};
//! # use failover_core::{ProviderError, ProviderId, ProviderInvoker};
//! # use std::time::Duration;
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl ProviderInvoker for Http {
//! #     type Request = String;
//! #     type Response = String;
//! #     async fn invoke(&self, _: &ProviderId, r: &String, _: Duration) -> Result<String, ProviderError> { Ok(r.clone()) }
//! # }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FailoverConfig::new(vec![
//!     ProviderConfig::new("primary").with_priority(1),
//!     ProviderConfig::new("fallback").with_priority(2),
//! ]);
//! let router = ProviderRouter::new(config, Http)?;
//! let reply = router.dispatch(&"ping".to_string()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::breaker::{Admission, CircuitState, Transition};
use crate::clock;
use crate::config::{FailoverConfig, ProviderConfig};
use crate::error::{ConfigError, DispatchError};
use crate::events::{BreakerEvent, DispatchObserver};
use crate::health::{HealthReporter, CheckStatus};
use crate::invoker::ProviderInvoker;
use crate::persistence::{push_with_retry, FlushHandle};
use crate::policy::{RetryConfig, RetryPolicy, SelectionPolicy};
use crate::provider::{CallOutcome, OutcomeKind, ProviderId};
use crate::registry::{ProviderSlot, Registry, SlotState};
use crate::store::MetricsStore;
use crate::window::WindowSnapshot;

/// Breaker events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of seeding windows from a metrics store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RehydrateReport {
    /// Windows that adopted a stored snapshot.
    pub seeded: usize,
    /// Snapshots found but too old (or empty) to use.
    pub stale: usize,
    /// Providers with no stored snapshot.
    pub missing: usize,
    /// Pulls that failed.
    pub failed: usize,
}

/// Result of an explicit flush of every window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub pushed: usize,
    pub failed: usize,
}

/// Failover router over a set of providers sharing one invoker.
pub struct ProviderRouter<I: ProviderInvoker> {
    invoker: I,
    registry: Arc<Registry>,
    selection: SelectionPolicy,
    flush_interval: Option<Duration>,
    push_retry: RetryConfig,
    cursor: AtomicUsize,
    flusher: Option<FlushHandle>,
    observer: Option<Arc<dyn DispatchObserver>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl<I: ProviderInvoker> ProviderRouter<I> {
    /// Build a router from a validated configuration.
    pub fn new(config: FailoverConfig, invoker: I) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(Registry::default());
        let flush_interval = config.persistence.flush_interval();
        for provider in config.providers {
            registry.insert(provider, flush_interval)?;
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tracing::info!(
            providers = registry.len(),
            selection = ?config.selection,
            "provider router ready"
        );
        Ok(Self {
            invoker,
            registry,
            selection: config.selection,
            flush_interval,
            push_retry: config.persistence.push_retry,
            cursor: AtomicUsize::new(0),
            flusher: None,
            observer: None,
            events,
        })
    }

    /// Send due snapshots to a background flusher.
    pub fn with_flusher(mut self, flusher: FlushHandle) -> Self {
        self.flusher = Some(flusher);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    pub fn selection(&self) -> SelectionPolicy {
        self.selection
    }

    /// Registered provider ids in registration order.
    pub fn providers(&self) -> Vec<ProviderId> {
        self.registry.all().iter().map(|s| s.id().clone()).collect()
    }

    /// Receive every breaker transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Read-only view over the same provider state.
    pub fn reporter(&self) -> HealthReporter {
        HealthReporter::new(self.registry.clone())
    }

    // ─── Dispatch ────────────────────────────────────────────────────────────

    /// Try providers in policy order until one succeeds.
    pub async fn dispatch(&self, request: &I::Request) -> Result<I::Response, DispatchError> {
        let candidates = self.ordered_candidates();
        self.traverse(candidates, request).await
    }

    /// Try exactly `providers`, in the given order, ignoring the selection policy.
    pub async fn dispatch_to(
        &self,
        providers: &[ProviderId],
        request: &I::Request,
    ) -> Result<I::Response, DispatchError> {
        let candidates = providers
            .iter()
            .map(|id| {
                self.registry
                    .get(id)
                    .ok_or_else(|| DispatchError::UnknownProvider(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.traverse(candidates, request).await
    }

    async fn traverse(
        &self,
        candidates: Vec<Arc<ProviderSlot>>,
        request: &I::Request,
    ) -> Result<I::Response, DispatchError> {
        if candidates.is_empty() {
            return Err(ConfigError::EmptyProviderList.into());
        }
        let mut attempted = 0;
        let mut rejected = 0;

        for slot in candidates {
            let (admission, transition) = {
                let mut state = slot.write();
                let now = clock::now();
                let transition = state.breaker.poll_at(now);
                (state.breaker.admit_at(now), transition)
            };
            if let Some(transition) = transition {
                self.publish(slot.id(), transition);
            }

            if admission == Admission::Rejected {
                rejected += 1;
                tracing::debug!(provider = %slot.id(), "circuit open, skipping provider");
                if let Some(observer) = &self.observer {
                    observer.on_rejected(slot.id());
                }
                continue;
            }

            attempted += 1;
            let permit = TrialPermit::new(&slot, admission == Admission::Trial);
            let timeout = slot.config.timeout();
            let started = clock::now();
            let result =
                tokio::time::timeout(timeout, self.invoker.invoke(slot.id(), request, timeout)).await;
            let latency = clock::now().saturating_duration_since(started);
            permit.disarm();

            match result {
                Ok(Ok(response)) => {
                    self.record(&slot, OutcomeKind::Success, latency);
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        provider = %slot.id(),
                        latency_ms = latency.as_millis() as u64,
                        error = %e,
                        "provider call failed"
                    );
                    self.record(&slot, OutcomeKind::Failure, latency);
                }
                Err(_) => {
                    tracing::warn!(
                        provider = %slot.id(),
                        timeout_ms = timeout.as_millis() as u64,
                        "provider call timed out"
                    );
                    self.record(&slot, OutcomeKind::Timeout, latency);
                }
            }
        }

        tracing::warn!(attempted, rejected, "all providers unavailable");
        if let Some(observer) = &self.observer {
            observer.on_exhausted(attempted, rejected);
        }
        Err(DispatchError::AllProvidersUnavailable { attempted, rejected })
    }

    fn ordered_candidates(&self) -> Vec<Arc<ProviderSlot>> {
        let slots = self.registry.all();
        let rotation = match self.selection {
            SelectionPolicy::RoundRobin => self.cursor.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if self.selection.needs_live_stats() {
            let now = clock::now();
            let mut ranked: Vec<_> = slots
                .into_iter()
                .map(|slot| {
                    let rank = slot.live_rank(now);
                    (slot, rank)
                })
                .collect();
            self.selection.order(&mut ranked, rotation, |(_, rank)| *rank);
            ranked.into_iter().map(|(slot, _)| slot).collect()
        } else {
            let mut slots = slots;
            self.selection.order(&mut slots, rotation, |slot| slot.static_rank());
            slots
        }
    }

    /// Feed one outcome into the provider's window and breaker.
    fn record(&self, slot: &ProviderSlot, kind: OutcomeKind, latency: Duration) {
        let (transition, pending) = {
            let mut state = slot.write();
            let now = clock::now();
            // Stamped under the lock so window samples stay in time order.
            let outcome = CallOutcome::new(slot.id().clone(), kind, latency).at(now);
            let flush_due = state.window.record(&outcome);
            let stats = state.window.rolling_stats(now);
            let transition = state.breaker.on_result_at(kind, stats, now);
            if transition.as_ref().is_some_and(|t| t.to == CircuitState::Closed) {
                // A recovered provider starts from a clean error rate.
                state.window.clear();
            }
            let pending = (flush_due && self.flusher.is_some())
                .then(|| state.window.prepare_snapshot(now));
            (transition, pending)
        };

        if let Some(observer) = &self.observer {
            observer.on_outcome(slot.id(), kind, latency);
        }
        if let Some(transition) = transition {
            self.publish(slot.id(), transition);
        }
        if let (Some(pending), Some(flusher)) = (pending, &self.flusher) {
            if !flusher.schedule(slot.id().clone(), pending) {
                if let Some(observer) = &self.observer {
                    observer.on_snapshot_dropped(slot.id());
                }
            }
        }
    }

    fn publish(&self, provider: &ProviderId, transition: Transition) {
        let event = BreakerEvent::new(provider.clone(), transition);
        if let Some(observer) = &self.observer {
            observer.on_transition(&event);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ─── Registry lifecycle ──────────────────────────────────────────────────

    /// Add a provider at runtime. Its breaker starts closed with an empty window.
    pub fn register(&self, config: ProviderConfig) -> Result<(), ConfigError> {
        let slot = self.registry.insert(config, self.flush_interval)?;
        tracing::info!(provider = %slot.id(), priority = slot.config.priority, "provider registered");
        Ok(())
    }

    /// Remove a provider and drop its breaker and window.
    pub fn deregister(&self, id: &ProviderId) -> bool {
        let removed = self.registry.remove(id).is_some();
        if removed {
            tracing::info!(provider = %id, "provider deregistered");
        }
        removed
    }

    // ─── Operator intervention ───────────────────────────────────────────────

    pub fn force_open(&self, id: &ProviderId) -> Result<(), DispatchError> {
        self.intervene(id, |state, now| state.breaker.force_open(now))
    }

    pub fn force_close(&self, id: &ProviderId) -> Result<(), DispatchError> {
        self.intervene(id, |state, now| {
            let transition = state.breaker.force_close(now);
            if transition.is_some() {
                state.window.clear();
            }
            transition
        })
    }

    /// Return the provider's breaker and window to their initial state.
    pub fn reset(&self, id: &ProviderId) -> Result<(), DispatchError> {
        self.intervene(id, |state, now| {
            state.window.clear();
            state.breaker.reset(now)
        })
    }

    fn intervene(
        &self,
        id: &ProviderId,
        apply: impl FnOnce(&mut SlotState, Instant) -> Option<Transition>,
    ) -> Result<(), DispatchError> {
        let slot = self
            .registry
            .get(id)
            .ok_or_else(|| DispatchError::UnknownProvider(id.clone()))?;
        let transition = {
            let mut state = slot.write();
            apply(&mut state, clock::now())
        };
        if let Some(transition) = transition {
            self.publish(slot.id(), transition);
        }
        Ok(())
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Effective breaker state for one provider.
    pub fn breaker_state(&self, id: &ProviderId) -> Option<CircuitState> {
        let slot = self.registry.get(id)?;
        let state = slot.read().breaker.state_at(clock::now());
        Some(state)
    }

    pub fn snapshot(&self, id: &ProviderId) -> Option<WindowSnapshot> {
        let slot = self.registry.get(id)?;
        let pending = slot.read().window.prepare_snapshot(clock::now());
        Some(pending.finish())
    }

    // ─── Store synchronisation ───────────────────────────────────────────────

    /// Seed every window from `store`. Call once at startup, before traffic.
    pub async fn rehydrate(&self, store: &dyn MetricsStore) -> RehydrateReport {
        let mut report = RehydrateReport::default();
        for slot in self.registry.all() {
            match store.pull(slot.id()).await {
                Ok(Some(snapshot)) => {
                    let count = snapshot.count;
                    if slot.write().window.merge(snapshot) {
                        report.seeded += 1;
                        tracing::info!(provider = %slot.id(), count, store = store.name(), "window rehydrated");
                    } else {
                        report.stale += 1;
                        tracing::debug!(provider = %slot.id(), store = store.name(), "stored snapshot not used");
                    }
                }
                Ok(None) => report.missing += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(provider = %slot.id(), store = store.name(), error = %e, "snapshot pull failed");
                }
            }
        }
        report
    }

    /// Push every window's current snapshot to `store`, e.g. on shutdown.
    pub async fn flush_now(&self, store: &dyn MetricsStore) -> FlushReport {
        let retry = RetryPolicy::new(self.push_retry.clone());
        let mut report = FlushReport::default();
        for slot in self.registry.all() {
            let pending = slot.read().window.prepare_snapshot(clock::now());
            let snapshot = pending.finish();
            match push_with_retry(store, slot.id(), &snapshot, &retry).await {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(provider = %slot.id(), store = store.name(), error = %e, "snapshot push failed");
                }
            }
        }
        report
    }
}

impl<I: ProviderInvoker> ProviderRouter<I> {
    // ─── Health monitoring ───────────────────────────────────────────────────

    /// Run [`ProviderInvoker::health_check`] once against every provider,
    /// under each provider's timeout. Returns how many checks failed.
    ///
    /// Results are kept for the health report only; breakers and windows
    /// are driven by real traffic.
    pub async fn check_providers(&self) -> usize {
        let mut failed = 0;
        for slot in self.registry.all() {
            let timeout = slot.config.timeout();
            let started = clock::now();
            let result =
                tokio::time::timeout(timeout, self.invoker.health_check(slot.id(), timeout)).await;
            let latency = clock::now().saturating_duration_since(started);

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("health check timed out after {}ms", timeout.as_millis())),
            };
            match &error {
                Some(error) => {
                    failed += 1;
                    tracing::warn!(provider = %slot.id(), %error, "health check failed");
                }
                None => tracing::debug!(
                    provider = %slot.id(),
                    latency_ms = latency.as_millis() as u64,
                    "health check ok"
                ),
            }
            slot.write().last_check = Some(CheckStatus {
                healthy: error.is_none(),
                at_ms: chrono::Utc::now().timestamp_millis(),
                latency_ms: latency.as_secs_f64() * 1_000.0,
                error,
            });
        }
        failed
    }

    /// Check every provider each `interval`, starting immediately.
    ///
    /// The task holds only a weak reference and stops once the router is
    /// dropped.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let router: Weak<Self> = Arc::downgrade(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(router) = router.upgrade() else {
                    break;
                };
                let failed = router.check_providers().await;
                tracing::trace!(failed, "health monitor round finished");
            }
            tracing::debug!("health monitor stopped");
        })
    }
}

/// Half-open trial slot held for the duration of one invocation.
///
/// Dropped without [`TrialPermit::disarm`] (the dispatch future was
/// cancelled mid-call), it hands the slot back so the breaker cannot be
/// left half-open with its quota used up by calls that will never report.
struct TrialPermit<'a> {
    slot: Option<&'a ProviderSlot>,
}

impl<'a> TrialPermit<'a> {
    fn new(slot: &'a ProviderSlot, trial: bool) -> Self {
        Self {
            slot: trial.then_some(slot),
        }
    }

    fn disarm(mut self) {
        self.slot = None;
    }
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.write().breaker.release_trial();
            tracing::debug!(provider = %slot.id(), "half-open trial abandoned");
        }
    }
}
