use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use augur_ai::{AcquireOutcome, CounterError, CounterSlot, CounterStore};

use super::{counter_error, PgBackend};

/// Rate-limit buckets shared by every worker on the database.
///
/// An acquire locks its rows in key order, checks every limit, then
/// increments all of them or none.
pub struct PgCounterStore {
    backend: PgBackend,
}

impl PgCounterStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

fn exhausted_slots(slots: &[CounterSlot], counts: &[(String, i32)]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| {
            let used = counts
                .iter()
                .find(|(key, _)| *key == slot.key)
                .map_or(0, |(_, n)| *n);
            used >= slot.limit as i32
        })
        .map(|(i, _)| i)
        .collect()
}

async fn acquire(pool: &PgPool, slots: &[CounterSlot]) -> Result<AcquireOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;
    for slot in slots {
        sqlx::query(
            "INSERT INTO augur_rate_counters (key, count, resets_at) VALUES ($1, 0, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(&slot.key)
        .bind(slot.resets_at)
        .execute(&mut *tx)
        .await?;
    }

    let keys: Vec<String> = slots.iter().map(|s| s.key.clone()).collect();
    let rows = sqlx::query("SELECT key, count FROM augur_rate_counters WHERE key = ANY($1) ORDER BY key FOR UPDATE")
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await?;
    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        counts.push((row.try_get::<String, _>("key")?, row.try_get::<i32, _>("count")?));
    }

    let exhausted = exhausted_slots(slots, &counts);
    if !exhausted.is_empty() {
        tx.rollback().await?;
        return Ok(AcquireOutcome::Exhausted(exhausted));
    }

    sqlx::query("UPDATE augur_rate_counters SET count = count + 1 WHERE key = ANY($1)")
        .bind(&keys)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(AcquireOutcome::Acquired)
}

impl CounterStore for PgCounterStore {
    fn try_acquire(&self, slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError> {
        self.backend
            .block_on(acquire(self.backend.pool(), slots))
            .map_err(|e| counter_error("try_acquire", e))
    }

    fn current(&self, key: &str) -> Result<u32, CounterError> {
        let pool = self.backend.pool();
        let count: Option<i32> = self
            .backend
            .block_on(
                sqlx::query_scalar("SELECT count FROM augur_rate_counters WHERE key = $1")
                    .bind(key)
                    .fetch_optional(pool),
            )
            .map_err(|e| counter_error("current", e))?;
        Ok(count.map_or(0, |n| n.max(0) as u32))
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let pool = self.backend.pool();
        let done = self
            .backend
            .block_on(
                sqlx::query("DELETE FROM augur_rate_counters WHERE resets_at <= $1")
                    .bind(now)
                    .execute(pool),
            )
            .map_err(|e| counter_error("prune", e))?;
        Ok(done.rows_affected() as usize)
    }
}
