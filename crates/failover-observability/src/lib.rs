//! # failover-observability
//!
//! OpenTelemetry-based observability for the failover router.
//!
//! ## Built-in metrics
//! - `failover.calls`: counter, tagged with provider + outcome
//! - `failover.rejections`: counter, tagged with provider
//! - `failover.transitions`: counter, tagged with provider + to-state
//! - `failover.call_latency_ms`: histogram, tagged with provider
//! - `failover.dispatch_exhausted`: counter
//! - `failover.snapshot_drops`: counter, tagged with provider
//!
//! ## Structured logging
//! JSON-structured logs compatible with ELK, Loki, CloudWatch.
//! Log levels configurable per component.

pub mod events;
pub mod metrics;
pub mod tracing_setup;

pub use events::spawn_event_recorder;
pub use metrics::FailoverMetrics;
pub use tracing_setup::{init_tracing, LogConfig};
