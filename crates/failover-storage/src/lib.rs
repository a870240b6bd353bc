//! failover-storage: durable metrics store backends for failover-core.
//!
//! Backends:
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//! - in-memory: [`failover_core::MemoryMetricsStore`], re-exported here

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use failover_core::MemoryMetricsStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMetricsStore;
