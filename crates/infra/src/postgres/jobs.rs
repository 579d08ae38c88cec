use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use augur_core::{JobId, OrderId};

use super::{decode_error, map_sqlx_error, PgBackend};
use crate::error::StoreError;
use crate::jobs::{DeadLetterEntry, DeadLetterStore, EnrichmentJob, JobStats, JobStatus, JobStore};

/// Value of the `status` column. Discarded successes get their own label so
/// stats can be a single `GROUP BY`.
pub(crate) fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::InFlight => "in_flight",
        JobStatus::Succeeded { discarded: false } => "succeeded",
        JobStatus::Succeeded { discarded: true } => "discarded",
        JobStatus::Failed => "failed",
        JobStatus::DeadLettered => "dead_lettered",
    }
}

fn decode_job(row: &PgRow) -> Result<EnrichmentJob, StoreError> {
    row.try_get::<Json<EnrichmentJob>, _>("body")
        .map(|body| body.0)
        .map_err(|e| decode_error("job", e))
}

fn decode_entry(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    row.try_get::<Json<DeadLetterEntry>, _>("body")
        .map(|body| body.0)
        .map_err(|e| decode_error("dead letter", e))
}

/// Jobs as JSONB. A partial unique index keeps one active job per order.
pub struct PgJobStore {
    backend: PgBackend,
}

impl PgJobStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

async fn write_job<'e, E>(executor: E, job: &EnrichmentJob) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let done = sqlx::query(
        r#"
        UPDATE augur_jobs
        SET status = $2, next_eligible_at = $3, claimed_at = $4, updated_at = $5, body = $6
        WHERE job_id = $1
        "#,
    )
    .bind(*job.id.as_uuid())
    .bind(status_label(job.status))
    .bind(job.next_eligible_at)
    .bind(job.claimed_at)
    .bind(job.updated_at)
    .bind(Json(job))
    .execute(executor)
    .await?;
    Ok(done.rows_affected())
}

async fn claim(pool: &PgPool, now: DateTime<Utc>, limit: usize, lease: Duration) -> Result<Vec<EnrichmentJob>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        r#"
        SELECT body FROM augur_jobs
        WHERE (status IN ('pending', 'failed') AND next_eligible_at <= $1)
           OR (status = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= $2))
        ORDER BY next_eligible_at, created_at, job_id
        LIMIT $3
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(now)
    .bind(now - lease)
    .bind(limit as i64)
    .fetch_all(&mut *tx)
    .await?;

    let mut claimed = Vec::with_capacity(rows.len());
    for row in &rows {
        let Ok(mut job) = decode_job(row) else {
            tracing::error!("skipping undecodable job row during claim");
            continue;
        };
        job.mark_in_flight(now);
        write_job(&mut *tx, &job).await?;
        claimed.push(job);
    }
    tx.commit().await?;
    Ok(claimed)
}

async fn refresh(pool: &PgPool, order_id: OrderId, text: &str, now: DateTime<Utc>) -> Result<Option<EnrichmentJob>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query(
        "SELECT body FROM augur_jobs WHERE order_id = $1 AND status IN ('pending', 'failed') FOR UPDATE",
    )
    .bind(*order_id.as_uuid())
    .fetch_optional(&mut *tx)
    .await?;
    let Some(mut job) = row.as_ref().and_then(|r| decode_job(r).ok()) else {
        return Ok(None);
    };
    job.text = text.to_string();
    job.updated_at = now;
    write_job(&mut *tx, &job).await?;
    tx.commit().await?;
    Ok(Some(job))
}

impl JobStore for PgJobStore {
    fn enqueue(&self, job: EnrichmentJob) -> Result<(EnrichmentJob, bool), StoreError> {
        let pool = self.backend.pool();
        let inserted = self
            .backend
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO augur_jobs
                        (job_id, order_id, status, next_eligible_at, claimed_at, created_at, updated_at, body)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(*job.id.as_uuid())
                .bind(*job.order_id.as_uuid())
                .bind(status_label(job.status))
                .bind(job.next_eligible_at)
                .bind(job.claimed_at)
                .bind(job.created_at)
                .bind(job.updated_at)
                .bind(Json(&job))
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("enqueue_job", e))?
            .rows_affected();

        if inserted == 1 {
            return Ok((job, true));
        }
        match self.active_for_order(job.order_id)? {
            Some(existing) => Ok((existing, false)),
            None => Err(StoreError::AlreadyExists(format!("job {}", job.id))),
        }
    }

    fn get(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        let pool = self.backend.pool();
        let row = self
            .backend
            .block_on(
                sqlx::query("SELECT body FROM augur_jobs WHERE job_id = $1")
                    .bind(*job_id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    fn active_for_order(&self, order_id: OrderId) -> Result<Option<EnrichmentJob>, StoreError> {
        let pool = self.backend.pool();
        let row = self
            .backend
            .block_on(
                sqlx::query(
                    "SELECT body FROM augur_jobs WHERE order_id = $1 AND status IN ('pending', 'in_flight', 'failed')",
                )
                .bind(*order_id.as_uuid())
                .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("active_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    fn update(&self, job: &EnrichmentJob) -> Result<(), StoreError> {
        let updated = self
            .backend
            .block_on(write_job(self.backend.pool(), job))
            .map_err(|e| map_sqlx_error("update_job", e))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<EnrichmentJob>, StoreError> {
        self.backend
            .block_on(claim(self.backend.pool(), now, limit, lease))
            .map_err(|e| map_sqlx_error("claim_ready", e))
    }

    fn refresh_text(&self, order_id: OrderId, text: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let refreshed = self
            .backend
            .block_on(refresh(self.backend.pool(), order_id, text, now))
            .map_err(|e| map_sqlx_error("refresh_text", e))?;
        Ok(refreshed.is_some())
    }

    fn remove(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        let pool = self.backend.pool();
        let row = self
            .backend
            .block_on(
                sqlx::query("DELETE FROM augur_jobs WHERE job_id = $1 RETURNING body")
                    .bind(*job_id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("remove_job", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let pool = self.backend.pool();
        let done = self
            .backend
            .block_on(
                sqlx::query(
                    "DELETE FROM augur_jobs WHERE status IN ('succeeded', 'discarded') AND updated_at < $1",
                )
                .bind(cutoff)
                .execute(pool),
            )
            .map_err(|e| map_sqlx_error("purge_jobs", e))?;
        Ok(done.rows_affected() as usize)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(sqlx::query("SELECT status, COUNT(*) AS n FROM augur_jobs GROUP BY status").fetch_all(pool))
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let label: String = row.try_get("status").map_err(|e| decode_error("status", e))?;
            let n = row.try_get::<i64, _>("n").map_err(|e| decode_error("count", e))? as usize;
            match label.as_str() {
                "pending" => stats.pending = n,
                "in_flight" => stats.in_flight = n,
                "failed" => stats.failed = n,
                "succeeded" => stats.succeeded = n,
                "discarded" => stats.discarded = n,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Dead letters as JSONB, bounded to `capacity` rows.
///
/// `seq` records insertion order; the oldest row is evicted on overflow.
pub struct PgDeadLetterStore {
    backend: PgBackend,
    capacity: usize,
}

impl PgDeadLetterStore {
    pub fn new(backend: PgBackend, capacity: usize) -> Self {
        Self { backend, capacity }
    }
}

async fn push_entry(pool: &PgPool, entry: &DeadLetterEntry, capacity: usize) -> Result<Option<PgRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO augur_dead_letters (job_id, dead_lettered_at, replay_after, body)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id) DO UPDATE
        SET dead_lettered_at = EXCLUDED.dead_lettered_at,
            replay_after = EXCLUDED.replay_after,
            body = EXCLUDED.body
        "#,
    )
    .bind(*entry.id.as_uuid())
    .bind(entry.dead_lettered_at)
    .bind(entry.replay_after())
    .bind(Json(entry))
    .execute(&mut *tx)
    .await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM augur_dead_letters")
        .fetch_one(&mut *tx)
        .await?;
    let evicted = if count as usize > capacity {
        sqlx::query(
            r#"
            DELETE FROM augur_dead_letters
            WHERE job_id = (SELECT job_id FROM augur_dead_letters ORDER BY seq LIMIT 1)
            RETURNING body
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
    } else {
        None
    };
    tx.commit().await?;
    Ok(evicted)
}

async fn fail_replay(pool: &PgPool, job_id: JobId, error: &str, now: DateTime<Utc>) -> Result<Option<DeadLetterEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let row = sqlx::query("SELECT body FROM augur_dead_letters WHERE job_id = $1 FOR UPDATE")
        .bind(*job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
    let Some(mut entry) = row.as_ref().and_then(|r| decode_entry(r).ok()) else {
        return Ok(None);
    };
    entry.record_replay_failure(error.to_string(), now);
    sqlx::query("UPDATE augur_dead_letters SET replay_after = $2, body = $3 WHERE job_id = $1")
        .bind(*job_id.as_uuid())
        .bind(entry.replay_after())
        .bind(Json(&entry))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(entry))
}

impl DeadLetterStore for PgDeadLetterStore {
    fn push(&self, entry: DeadLetterEntry) -> Result<Option<DeadLetterEntry>, StoreError> {
        let evicted = self
            .backend
            .block_on(push_entry(self.backend.pool(), &entry, self.capacity))
            .map_err(|e| map_sqlx_error("push_dead_letter", e))?;
        evicted.as_ref().map(decode_entry).transpose()
    }

    fn peek_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(
                sqlx::query(
                    "SELECT body FROM augur_dead_letters ORDER BY replay_after, dead_lettered_at LIMIT $1",
                )
                .bind(limit as i64)
                .fetch_all(pool),
            )
            .map_err(|e| map_sqlx_error("peek_dead_letters", e))?;
        rows.iter().map(decode_entry).collect()
    }

    fn mark_replay_failed(&self, job_id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let updated = self
            .backend
            .block_on(fail_replay(self.backend.pool(), job_id, error, now))
            .map_err(|e| map_sqlx_error("mark_replay_failed", e))?;
        Ok(updated.is_some())
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let pool = self.backend.pool();
        let rows = self
            .backend
            .block_on(
                sqlx::query("SELECT body FROM augur_dead_letters ORDER BY seq DESC LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(pool),
            )
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.iter().map(decode_entry).collect()
    }

    fn remove(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let pool = self.backend.pool();
        let row = self
            .backend
            .block_on(
                sqlx::query("DELETE FROM augur_dead_letters WHERE job_id = $1 RETURNING body")
                    .bind(*job_id.as_uuid())
                    .fetch_optional(pool),
            )
            .map_err(|e| map_sqlx_error("remove_dead_letter", e))?;
        row.as_ref().map(decode_entry).transpose()
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let pool = self.backend.pool();
        let done = self
            .backend
            .block_on(
                sqlx::query("DELETE FROM augur_dead_letters WHERE dead_lettered_at < $1")
                    .bind(cutoff)
                    .execute(pool),
            )
            .map_err(|e| map_sqlx_error("purge_dead_letters", e))?;
        Ok(done.rows_affected() as usize)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let pool = self.backend.pool();
        let count: i64 = self
            .backend
            .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM augur_dead_letters").fetch_one(pool))
            .map_err(|e| map_sqlx_error("count_dead_letters", e))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_labels_match_the_unique_index() {
        let active: Vec<&str> = [
            JobStatus::Pending,
            JobStatus::InFlight,
            JobStatus::Failed,
            JobStatus::Succeeded { discarded: false },
            JobStatus::Succeeded { discarded: true },
            JobStatus::DeadLettered,
        ]
        .into_iter()
        .filter(|s| s.is_active())
        .map(status_label)
        .collect();
        assert_eq!(active, vec!["pending", "in_flight", "failed"]);
        assert!(super::super::SCHEMA.contains("WHERE status IN ('pending', 'in_flight', 'failed')"));
    }

    #[test]
    fn successes_are_split_by_discard() {
        assert_eq!(status_label(JobStatus::Succeeded { discarded: false }), "succeeded");
        assert_eq!(status_label(JobStatus::Succeeded { discarded: true }), "discarded");
    }
}
