//! Background snapshot flusher.
//!
//! The request path only copies window data out under the provider lock and
//! hands it to [`FlushHandle::schedule`], which never blocks: when the bounded
//! queue is full the snapshot is dropped and counted. A single background
//! task finishes each snapshot (sorting happens here) and pushes it to the
//! [`MetricsStore`] with bounded retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::policy::RetryPolicy;
use crate::provider::ProviderId;
use crate::store::MetricsStore;
use crate::window::{PendingSnapshot, WindowSnapshot};

struct FlushJob {
    provider: ProviderId,
    pending: PendingSnapshot,
}

/// Counters shared by the flusher and its handles.
#[derive(Debug, Default)]
pub struct FlushStats {
    pushed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl FlushStats {
    /// Snapshots stored successfully.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Snapshots abandoned after exhausting retries.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Snapshots dropped because the queue was full or the flusher had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cheap, cloneable sender side of the flusher.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<FlushJob>,
    stats: Arc<FlushStats>,
}

impl FlushHandle {
    /// Queue a snapshot for pushing. Returns `false` if it was dropped.
    pub fn schedule(&self, provider: ProviderId, pending: PendingSnapshot) -> bool {
        match self.tx.try_send(FlushJob { provider, pending }) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(provider = %job.provider, "snapshot queue full, dropping snapshot");
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(provider = %job.provider, "snapshot flusher stopped, dropping snapshot");
                false
            }
        }
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Counters that outlive this handle.
    pub fn shared_stats(&self) -> Arc<FlushStats> {
        self.stats.clone()
    }
}

impl std::fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushHandle")
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .field("stats", &self.stats)
            .finish()
    }
}

/// Owner of the background push task.
pub struct SnapshotFlusher;

impl SnapshotFlusher {
    /// Spawn the flush task on the current Tokio runtime.
    ///
    /// The task exits once every [`FlushHandle`] has been dropped and the
    /// queue is drained.
    pub fn spawn(
        store: Arc<dyn MetricsStore>,
        config: &PersistenceConfig,
    ) -> (FlushHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stats = Arc::new(FlushStats::default());
        let retry = RetryPolicy::new(config.push_retry.clone());

        let task_stats = stats.clone();
        let task = tokio::spawn(async move {
            flush_loop(rx, store, retry, task_stats).await;
        });

        (FlushHandle { tx, stats }, task)
    }
}

async fn flush_loop(
    mut rx: mpsc::Receiver<FlushJob>,
    store: Arc<dyn MetricsStore>,
    retry: RetryPolicy,
    stats: Arc<FlushStats>,
) {
    while let Some(job) = rx.recv().await {
        let snapshot = job.pending.finish();
        match push_with_retry(store.as_ref(), &job.provider, &snapshot, &retry).await {
            Ok(()) => {
                stats.pushed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(provider = %job.provider, count = snapshot.count, "snapshot pushed");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    provider = %job.provider,
                    store = store.name(),
                    error = %e,
                    "snapshot push failed"
                );
            }
        }
    }
    tracing::debug!(store = store.name(), "snapshot flusher stopped");
}

/// Push once, then retry on the policy's schedule until it succeeds or
/// attempts run out. The last error is returned.
pub async fn push_with_retry(
    store: &dyn MetricsStore,
    provider: &ProviderId,
    snapshot: &WindowSnapshot,
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        match store.push(provider, snapshot).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                let Some(delay) = policy.next_delay(attempt) else {
                    return Err(e);
                };
                tracing::debug!(
                    provider = %provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying snapshot push"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
