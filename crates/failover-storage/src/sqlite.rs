//! SQLite metrics store.
//!
//! Keeps one row per provider holding its latest window snapshot as JSON.
//! Several router instances can share one database file; a push never
//! replaces a snapshot with an older one.
//!
//! # Usage
//! ```rust,no_run
//! use failover_storage::sqlite::SqliteMetricsStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteMetricsStore::open("./failover.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteMetricsStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use failover_core::{MetricsStore, ProviderId, StoreError, WindowSnapshot};

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQLite-backed snapshot store.
#[derive(Clone)]
pub struct SqliteMetricsStore {
    pool: SqlitePool,
}

impl SqliteMetricsStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./failover.db"`) or a full
    /// SQLite URL (`"sqlite:./failover.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(backend)?;
        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory database.
    ///
    /// Every connection to `:memory:` gets its own database, so the pool is
    /// pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StoreError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS provider_snapshots (
                provider_id   TEXT    NOT NULL PRIMARY KEY,
                snapshot_json TEXT    NOT NULL,
                window_end_ms INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Remove the stored snapshot for `provider`.
    pub async fn delete(&self, provider: &ProviderId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM provider_snapshots WHERE provider_id = ?")
            .bind(provider.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    /// Providers with a stored snapshot, sorted by id.
    pub async fn providers(&self) -> Result<Vec<ProviderId>, StoreError> {
        let rows = sqlx::query("SELECT provider_id FROM provider_snapshots ORDER BY provider_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .into_iter()
            .map(|r| ProviderId::from(r.get::<String, _>("provider_id")))
            .collect())
    }
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn push(&self, provider: &ProviderId, snapshot: &WindowSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)?;

        // Upsert, but only forward in time.
        let result = sqlx::query(
            "INSERT INTO provider_snapshots (provider_id, snapshot_json, window_end_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(provider_id) DO UPDATE SET
                 snapshot_json = excluded.snapshot_json,
                 window_end_ms = excluded.window_end_ms
             WHERE excluded.window_end_ms >= provider_snapshots.window_end_ms",
        )
        .bind(provider.as_str())
        .bind(&json)
        .bind(snapshot.window_end_ms)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(
            provider = %provider,
            count = snapshot.count,
            stored = result.rows_affected() > 0,
            "snapshot pushed"
        );
        Ok(())
    }

    async fn pull(&self, provider: &ProviderId) -> Result<Option<WindowSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot_json FROM provider_snapshots WHERE provider_id = ?")
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(r) => {
                let json: String = r.get("snapshot_json");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
