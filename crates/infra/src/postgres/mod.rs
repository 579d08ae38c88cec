//! Postgres-backed stores.
//!
//! Every store trait in this crate is synchronous, while SQLx is async. A
//! [`PgBackend`] owns the pool together with a handle to the runtime that
//! drives it, and each call runs `handle.block_on(..)`. Callers must be plain
//! threads (the tick workers), never tasks on that runtime.
//!
//! Entities are kept as JSONB documents next to the few columns the queries
//! filter or sort on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | RowNotFound | N/A | `NotFound` |
//! | Any other | Any other | `Storage` |

mod counters;
mod jobs;
mod orders;
mod state;

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::info;

use augur_ai::CounterError;

use crate::config::PipelineConfig;
use crate::context::StoreSet;
use crate::error::StoreError;

pub use counters::PgCounterStore;
pub use jobs::{PgDeadLetterStore, PgJobStore};
pub use orders::PgOrderStore;
pub use state::{PgReportStore, PgSettingsStore};

/// Tables and indexes, created on connect when missing.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS augur_orders (
    order_id UUID PRIMARY KEY,
    status TEXT NOT NULL,
    version BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    replied_at TIMESTAMPTZ,
    body JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS augur_orders_status_idx ON augur_orders (status, created_at);

CREATE TABLE IF NOT EXISTS augur_jobs (
    job_id UUID PRIMARY KEY,
    order_id UUID NOT NULL,
    status TEXT NOT NULL,
    next_eligible_at TIMESTAMPTZ NOT NULL,
    claimed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    body JSONB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS augur_jobs_one_active_per_order
    ON augur_jobs (order_id) WHERE status IN ('pending', 'in_flight', 'failed');
CREATE INDEX IF NOT EXISTS augur_jobs_ready_idx ON augur_jobs (status, next_eligible_at);

CREATE TABLE IF NOT EXISTS augur_dead_letters (
    job_id UUID PRIMARY KEY,
    seq BIGSERIAL NOT NULL,
    dead_lettered_at TIMESTAMPTZ NOT NULL,
    replay_after TIMESTAMPTZ NOT NULL,
    body JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS augur_rate_counters (
    key TEXT PRIMARY KEY,
    count INTEGER NOT NULL,
    resets_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS augur_queue_reports (
    generated_at TIMESTAMPTZ PRIMARY KEY,
    body JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS augur_settings (
    id SMALLINT PRIMARY KEY CHECK (id = 1),
    body JSONB NOT NULL
);
"#;

/// Connection pool plus the runtime it is driven on.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
    handle: Handle,
}

impl PgBackend {
    /// Connect, then create any missing tables.
    pub fn connect(url: &str, max_connections: u32, handle: Handle) -> Result<Self, StoreError> {
        let pool = handle
            .block_on(PgPoolOptions::new().max_connections(max_connections).connect(url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        let backend = Self { pool, handle };
        backend.migrate()?;
        info!(max_connections, "connected to postgres");
        Ok(backend)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        self.block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Every store on this pool. Counters too, unless Redis takes them over.
    pub fn stores(&self, config: &PipelineConfig) -> StoreSet {
        StoreSet {
            orders: Arc::new(PgOrderStore::new(self.clone())),
            jobs: Arc::new(PgJobStore::new(self.clone())),
            dead_letters: Arc::new(PgDeadLetterStore::new(self.clone(), config.dead_letter.capacity)),
            counters: Arc::new(PgCounterStore::new(self.clone())),
            reports: Arc::new(PgReportStore::new(self.clone())),
            settings: Arc::new(PgSettingsStore::new(self.clone())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("40001") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no row in {operation}")),
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

pub(crate) fn counter_error(operation: &str, err: sqlx::Error) -> CounterError {
    CounterError::new(map_sqlx_error(operation, err).to_string())
}

pub(crate) fn decode_error(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("failed to decode {what}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rows_map_to_not_found() {
        assert!(matches!(
            map_sqlx_error("get_order", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn pool_errors_are_storage_errors() {
        let err = map_sqlx_error("claim_ready", sqlx::Error::PoolClosed);
        assert!(matches!(&err, StoreError::Storage(msg) if msg.starts_with("claim_ready")));
        let counter = counter_error("try_acquire", sqlx::Error::PoolTimedOut);
        assert!(counter.to_string().starts_with("counter store error: storage error: try_acquire"));
    }

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "augur_orders",
            "augur_jobs",
            "augur_dead_letters",
            "augur_rate_counters",
            "augur_queue_reports",
            "augur_settings",
        ] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "{table}");
        }
    }
}
