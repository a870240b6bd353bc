//! Provider id → per-provider state, shared by the router and the health reporter.
//!
//! Two levels of locking: the map lock is held only long enough to clone an
//! `Arc` to a slot, and each slot has its own lock over its window and
//! breaker, so traffic to one provider never waits on another. Neither lock
//! is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::config::ProviderConfig;
use crate::error::ConfigError;
use crate::health::CheckStatus;
use crate::policy::RankInfo;
use crate::provider::ProviderId;
use crate::window::MetricsWindow;

pub(crate) struct SlotState {
    pub(crate) window: MetricsWindow,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) last_check: Option<CheckStatus>,
}

pub(crate) struct ProviderSlot {
    pub(crate) config: ProviderConfig,
    /// Registration order, the final ordering tie-break.
    pub(crate) seq: u64,
    state: RwLock<SlotState>,
}

impl ProviderSlot {
    fn new(config: ProviderConfig, seq: u64, flush_interval: Option<Duration>) -> Self {
        let state = SlotState {
            window: MetricsWindow::new(config.window_config(flush_interval)),
            breaker: CircuitBreaker::new(config.id.clone(), config.breaker_config()),
            last_check: None,
        };
        Self {
            config,
            seq,
            state: RwLock::new(state),
        }
    }

    pub(crate) fn id(&self) -> &ProviderId {
        &self.config.id
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ordering inputs without touching the slot lock.
    pub(crate) fn static_rank(&self) -> RankInfo {
        RankInfo {
            priority: self.config.priority,
            seq: self.seq,
            p50_ms: None,
            error_rate: None,
            admitting: true,
        }
    }

    /// Ordering inputs including live window and breaker data.
    pub(crate) fn live_rank(&self, now: Instant) -> RankInfo {
        let (pending, admitting) = {
            let state = self.read();
            (
                state.window.prepare_snapshot(now),
                state.breaker.would_admit_at(now),
            )
        };
        let snapshot = pending.finish();
        RankInfo {
            p50_ms: snapshot.p50_ms,
            error_rate: snapshot.error_rate,
            admitting,
            ..self.static_rank()
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: RwLock<HashMap<ProviderId, Arc<ProviderSlot>>>,
    next_seq: AtomicU64,
}

impl Registry {
    pub(crate) fn insert(
        &self,
        config: ProviderConfig,
        flush_interval: Option<Duration>,
    ) -> Result<Arc<ProviderSlot>, ConfigError> {
        config.validate()?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(&config.id) {
            return Err(ConfigError::DuplicateProvider(config.id));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ProviderSlot::new(config, seq, flush_interval));
        slots.insert(slot.id().clone(), slot.clone());
        Ok(slot)
    }

    pub(crate) fn remove(&self, id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub(crate) fn get(&self, id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every slot, in registration order.
    pub(crate) fn all(&self) -> Vec<Arc<ProviderSlot>> {
        let mut slots: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_open_after_one_failure(id: &str) -> ProviderConfig {
        ProviderConfig {
            failure_threshold: 1,
            open_cooldown_ms: 1_000,
            half_open_trial_quota: 1,
            ..ProviderConfig::new(id)
        }
    }

    #[test]
    fn live_rank_reports_exhausted_trial_quota_as_not_admitting() {
        let registry = Registry::default();
        let slot = registry.insert(half_open_after_one_failure("a"), None).unwrap();
        let t0 = Instant::now();
        assert!(slot.live_rank(t0).admitting);

        slot.write().breaker.force_open(t0);
        assert!(!slot.live_rank(t0).admitting);

        let cooled = t0 + Duration::from_millis(1_000);
        assert!(slot.live_rank(cooled).admitting);

        // The only trial slot is taken by an in-flight call.
        slot.write().breaker.admit_at(cooled);
        assert!(!slot.live_rank(cooled).admitting);
    }

    #[test]
    fn duplicate_insert_is_rejected_and_order_follows_registration() {
        let registry = Registry::default();
        registry.insert(ProviderConfig::new("b"), None).unwrap();
        registry.insert(ProviderConfig::new("a"), None).unwrap();
        assert!(matches!(
            registry.insert(ProviderConfig::new("a"), None),
            Err(ConfigError::DuplicateProvider(_))
        ));
        let ids: Vec<_> = registry.all().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["b", "a"]);
    }
}

