//! `failover simulate`: synthetic traffic against a configured router.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;

use failover_core::{
    DispatchError, FailoverConfig, MetricsStore, ProviderError, ProviderHealth, ProviderId,
    ProviderInvoker, ProviderRouter, SnapshotFlusher,
};
use failover_observability::{spawn_event_recorder, FailoverMetrics};
use failover_storage::SqliteMetricsStore;

pub struct Options {
    pub config_path: PathBuf,
    pub requests: usize,
    pub concurrency: usize,
    pub store: Option<PathBuf>,
    pub json: bool,
}

/// Per-provider behaviour of the synthetic backend.
#[derive(Debug, Clone, Default, Deserialize)]
struct SimulateSpec {
    /// Fixed latency of every call.
    #[serde(default)]
    latency_ms: u64,
    /// Every n-th call fails with a 503. 0 never fails, 1 always fails.
    #[serde(default)]
    fail_every: u64,
}

#[derive(Debug, Deserialize)]
struct SimProvider {
    id: ProviderId,
    #[serde(default)]
    simulate: SimulateSpec,
}

#[derive(Debug, Deserialize)]
struct SimFile {
    #[serde(default)]
    providers: Vec<SimProvider>,
}

fn read_sim_file(path: &Path) -> Result<SimFile> {
    let raw = std::fs::read_to_string(path)?;
    let file = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    Ok(file)
}

struct Backend {
    spec: SimulateSpec,
    calls: AtomicU64,
}

/// Invoker that sleeps and fails on a fixed schedule per provider.
struct SimInvoker {
    backends: HashMap<ProviderId, Backend>,
}

impl SimInvoker {
    fn new(file: SimFile) -> Self {
        let backends = file
            .providers
            .into_iter()
            .map(|p| {
                let backend = Backend {
                    spec: p.simulate,
                    calls: AtomicU64::new(0),
                };
                (p.id, backend)
            })
            .collect();
        Self { backends }
    }

    fn calls(&self) -> BTreeMap<ProviderId, u64> {
        self.backends
            .iter()
            .map(|(id, b)| (id.clone(), b.calls.load(Ordering::Relaxed)))
            .collect()
    }
}

#[async_trait]
impl ProviderInvoker for SimInvoker {
    type Request = usize;
    type Response = ProviderId;

    async fn invoke(
        &self,
        provider: &ProviderId,
        request: &usize,
        _timeout: Duration,
    ) -> Result<ProviderId, ProviderError> {
        let backend = self
            .backends
            .get(provider)
            .ok_or_else(|| ProviderError::Other(format!("no simulated backend for {provider}")))?;

        let n = backend.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if backend.spec.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(backend.spec.latency_ms)).await;
        }

        let fail_every = backend.spec.fail_every;
        if fail_every > 0 && n % fail_every == 0 {
            tracing::trace!(provider = %provider, request, call = n, "simulated failure");
            return Err(ProviderError::Status {
                code: 503,
                message: "simulated outage".into(),
            });
        }
        Ok(provider.clone())
    }
}

pub async fn run(config: FailoverConfig, opts: Options) -> Result<()> {
    let sim = read_sim_file(&opts.config_path)
        .with_context(|| format!("reading simulate blocks from {}", opts.config_path.display()))?;
    let persistence = config.persistence.clone();

    let store: Option<Arc<SqliteMetricsStore>> = match &opts.store {
        Some(path) => Some(Arc::new(
            SqliteMetricsStore::open(&path.to_string_lossy()).await?,
        )),
        None => None,
    };

    let metrics = FailoverMetrics::from_global();
    let mut router =
        ProviderRouter::new(config, SimInvoker::new(sim))?.with_observer(Arc::new(metrics.clone()));

    let mut flusher_task = None;
    if let Some(store) = &store {
        let report = router.rehydrate(store.as_ref()).await;
        tracing::info!(
            seeded = report.seeded,
            stale = report.stale,
            missing = report.missing,
            failed = report.failed,
            "windows rehydrated"
        );
        let (handle, task) =
            SnapshotFlusher::spawn(store.clone() as Arc<dyn MetricsStore>, &persistence);
        router = router.with_flusher(handle);
        flusher_task = Some(task);
    }

    let recorder = spawn_event_recorder(router.subscribe(), metrics);

    let started = Instant::now();
    let results: Vec<Result<ProviderId, DispatchError>> = stream::iter(0..opts.requests)
        .map(|i| {
            let router = &router;
            async move { router.dispatch(&i).await }
        })
        .buffer_unordered(opts.concurrency)
        .collect()
        .await;
    let elapsed = started.elapsed();

    let mut served: BTreeMap<ProviderId, usize> = BTreeMap::new();
    let mut exhausted = 0usize;
    for result in &results {
        match result {
            Ok(provider) => *served.entry(provider.clone()).or_default() += 1,
            Err(e) if e.is_exhausted() => exhausted += 1,
            Err(e) => return Err(anyhow::anyhow!("dispatch failed: {e}")),
        }
    }

    if let Some(store) = &store {
        let flushed = router.flush_now(store.as_ref()).await;
        tracing::info!(pushed = flushed.pushed, failed = flushed.failed, "final flush");
    }

    let reporter = router.reporter();
    let report = reporter.report();
    let summary = reporter.summary();
    let calls = router.invoker().calls();

    if opts.json {
        let out = serde_json::json!({
            "requests": opts.requests,
            "elapsed_ms": elapsed.as_millis() as u64,
            "served": served,
            "exhausted": exhausted,
            "calls": calls,
            "summary": summary,
            "providers": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&report, &served, &calls);
        println!(
            "\n{} requests in {:.2}s: {} served, {} exhausted",
            opts.requests,
            elapsed.as_secs_f64(),
            results.len() - exhausted,
            exhausted
        );
        println!(
            "status: {} ({} closed, {} open, {} half-open)",
            summary.status, summary.closed, summary.open, summary.half_open
        );
    }

    drop(reporter);
    drop(router);
    if let Some(task) = flusher_task {
        task.await?;
    }
    let transitions = recorder.await?;
    tracing::debug!(transitions, "simulation finished");
    Ok(())
}

fn ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".into(), |v| format!("{v:.1}"))
}

fn print_report(
    report: &[ProviderHealth],
    served: &BTreeMap<ProviderId, usize>,
    calls: &BTreeMap<ProviderId, u64>,
) {
    println!(
        "{:<16} {:<10} {:>7} {:>7} {:>7} {:>8} {:>8} {:>8} {:>7}",
        "PROVIDER", "STATE", "CALLS", "SERVED", "REJECT", "ERR%", "P50ms", "P95ms", "TRIPS"
    );
    for p in report {
        let trips = p
            .transitions
            .iter()
            .filter(|t| t.to == failover_core::CircuitState::Open)
            .count();
        println!(
            "{:<16} {:<10} {:>7} {:>7} {:>7} {:>8} {:>8} {:>8} {:>7}",
            p.provider.as_str(),
            p.state.to_string(),
            calls.get(&p.provider).copied().unwrap_or(0),
            served.get(&p.provider).copied().unwrap_or(0),
            p.totals.total_rejections,
            p.error_rate
                .map_or_else(|| "-".into(), |r| format!("{:.1}", r * 100.0)),
            ms(p.p50_ms),
            ms(p.p95_ms),
            trips,
        );
    }
}
