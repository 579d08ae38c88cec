use chrono::{DateTime, Utc};
use sqlx::types::Json;

use super::{decode_error, map_sqlx_error, PgBackend};
use crate::error::StoreError;
use crate::queue::{QueueReport, ReportStore};
use crate::settings::{QueueSettings, SettingsStore};

pub struct PgReportStore {
    backend: PgBackend,
}

impl PgReportStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

impl ReportStore for PgReportStore {
    fn put(&self, report: &QueueReport) -> Result<(), StoreError> {
        let pool = self.backend.pool();
        self.backend
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO augur_queue_reports (generated_at, body) VALUES ($1, $2)
                    ON CONFLICT (generated_at) DO UPDATE SET body = EXCLUDED.body
                    "#,
                )
                .bind(report.generated_at)
                .bind(Json(report))
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("put_report", e))?;
        Ok(())
    }

    fn latest(&self) -> Result<Option<QueueReport>, StoreError> {
        let pool = self.backend.pool();
        let body: Option<Json<serde_json::Value>> = self
            .backend
            .block_on(
                sqlx::query_scalar("SELECT body FROM augur_queue_reports ORDER BY generated_at DESC LIMIT 1")
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("latest_report", e))?;
        body.map(|b| serde_json::from_value(b.0).map_err(|e| decode_error("queue report", e)))
            .transpose()
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let pool = self.backend.pool();
        let done = self
            .backend
            .block_on(
                sqlx::query("DELETE FROM augur_queue_reports WHERE generated_at < $1")
                    .bind(cutoff)
                    .execute(pool),
            )
            .map_err(|e| map_sqlx_error("purge_reports", e))?;
        Ok(done.rows_affected() as usize)
    }
}

/// Single-row settings table; defaults until the first save.
pub struct PgSettingsStore {
    backend: PgBackend,
}

impl PgSettingsStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

impl SettingsStore for PgSettingsStore {
    fn load(&self) -> Result<QueueSettings, StoreError> {
        let pool = self.backend.pool();
        let body: Option<Json<serde_json::Value>> = self
            .backend
            .block_on(sqlx::query_scalar("SELECT body FROM augur_settings WHERE id = 1").fetch_optional(pool))
            .map_err(|e| map_sqlx_error("load_settings", e))?;
        match body {
            Some(b) => serde_json::from_value(b.0).map_err(|e| decode_error("settings", e)),
            None => Ok(QueueSettings::default()),
        }
    }

    fn save(&self, settings: &QueueSettings) -> Result<(), StoreError> {
        let pool = self.backend.pool();
        self.backend
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO augur_settings (id, body) VALUES (1, $1)
                    ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body
                    "#,
                )
                .bind(Json(settings))
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("save_settings", e))?;
        Ok(())
    }
}
