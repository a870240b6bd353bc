//! failover-core: circuit breakers, rolling metrics and failover routing.
//!
//! # Overview
//!
//! A reliability layer in front of interchangeable upstream providers (LLM
//! backends, data APIs, RPC endpoints). The core crate defines:
//!
//! - [`MetricsWindow`]: bounded rolling window with p50/p95 and error rate
//! - [`MetricsStore`]: push/pull boundary for window snapshots, with an
//!   in-memory backend and a background [`SnapshotFlusher`]
//! - [`CircuitBreaker`]: the per-provider Closed/Open/Half-Open state machine
//! - [`ProviderRouter`]: ordered failover dispatch over a [`ProviderInvoker`]
//! - [`HealthReporter`]: read-only per-provider health projection
//! - [`FailoverConfig`]: YAML/JSON configuration with validation

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod invoker;
pub mod persistence;
pub mod policy;
pub mod provider;
pub mod router;
pub mod store;
pub mod window;

mod registry;

pub use breaker::{
    Admission, BreakerConfig, BreakerTotals, BreakerView, CircuitBreaker, CircuitState,
    Transition, TransitionReason,
};
pub use config::{FailoverConfig, PersistenceConfig, ProviderConfig};
pub use error::{ConfigError, DispatchError, ProviderError, StoreError};
pub use events::{BreakerEvent, DispatchObserver};
pub use health::{HealthReporter, HealthStatus, HealthSummary, CheckStatus, ProviderHealth};
pub use invoker::ProviderInvoker;
pub use persistence::{FlushHandle, FlushStats, SnapshotFlusher};
pub use policy::{CooldownBackoff, RetryConfig, RetryPolicy, SelectionPolicy};
pub use provider::{CallOutcome, OutcomeKind, ProviderId};
pub use router::{FlushReport, ProviderRouter, RehydrateReport};
pub use store::{MemoryMetricsStore, MetricsStore};
pub use window::{MetricsWindow, RollingStats, WindowConfig, WindowSnapshot};
