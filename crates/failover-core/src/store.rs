//! Metrics store adapter: where window snapshots are pushed and pulled.
//!
//! The store is a best-effort cache, never a source of truth. The router
//! pulls once per provider at startup to seed its windows and pushes
//! periodically from a background task; store failures are logged and
//! counted but never reach `dispatch`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::provider::ProviderId;
use crate::window::WindowSnapshot;

/// Pluggable backend for window snapshots.
///
/// Implementations must keep the most recent snapshot per provider:
/// a push older than the stored one (by `window_end_ms`) is ignored.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Upsert the snapshot for `provider`.
    async fn push(&self, provider: &ProviderId, snapshot: &WindowSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot for `provider`, if one was ever pushed.
    async fn pull(&self, provider: &ProviderId) -> Result<Option<WindowSnapshot>, StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &str {
        "store"
    }
}

/// In-memory snapshot store.
///
/// All data is lost when the process exits. Useful for tests and for
/// sharing snapshots between routers in one process.
#[derive(Debug, Default)]
pub struct MemoryMetricsStore {
    snapshots: Mutex<HashMap<ProviderId, WindowSnapshot>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots().is_empty()
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<ProviderId, WindowSnapshot>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn push(&self, provider: &ProviderId, snapshot: &WindowSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots();
        match snapshots.get(provider) {
            Some(existing) if existing.window_end_ms > snapshot.window_end_ms => {
                tracing::debug!(provider = %provider, "ignoring older snapshot");
            }
            _ => {
                snapshots.insert(provider.clone(), snapshot.clone());
            }
        }
        Ok(())
    }

    async fn pull(&self, provider: &ProviderId) -> Result<Option<WindowSnapshot>, StoreError> {
        Ok(self.snapshots().get(provider).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(count: usize, end: i64) -> WindowSnapshot {
        WindowSnapshot {
            count,
            error_rate: Some(0.1),
            p50_ms: Some(20.0),
            p95_ms: Some(80.0),
            window_end_ms: end,
        }
    }

    #[tokio::test]
    async fn push_then_pull() {
        let store = MemoryMetricsStore::new();
        let id = ProviderId::from("primary");
        assert!(store.pull(&id).await.unwrap().is_none());

        store.push(&id, &snap(12, 1_000)).await.unwrap();
        let loaded = store.pull(&id).await.unwrap().unwrap();
        assert_eq!(loaded.count, 12);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn older_push_does_not_overwrite_newer() {
        let store = MemoryMetricsStore::new();
        let id = ProviderId::from("primary");
        store.push(&id, &snap(5, 2_000)).await.unwrap();
        store.push(&id, &snap(99, 1_000)).await.unwrap();
        assert_eq!(store.pull(&id).await.unwrap().unwrap().count, 5);

        store.push(&id, &snap(7, 3_000)).await.unwrap();
        assert_eq!(store.pull(&id).await.unwrap().unwrap().count, 7);
    }

    #[tokio::test]
    async fn providers_are_isolated() {
        let store = MemoryMetricsStore::new();
        store.push(&"a".into(), &snap(1, 10)).await.unwrap();
        store.push(&"b".into(), &snap(2, 10)).await.unwrap();
        assert_eq!(store.pull(&"a".into()).await.unwrap().unwrap().count, 1);
        assert_eq!(store.pull(&"b".into()).await.unwrap().unwrap().count, 2);
    }
}
