//! Redis-backed rate-limit counters (optional).
//!
//! Buckets are plain integer keys that expire at their reset time, so
//! `prune` has nothing to do. An acquire runs under `WATCH`: read every
//! bucket, then increment all of them in one `MULTI` or retry if another
//! worker touched one in between.

use chrono::{DateTime, Utc};

use augur_ai::{AcquireOutcome, CounterError, CounterSlot, CounterStore};

#[derive(Debug, Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(redis_error)?;
        Ok(Self { client })
    }

    fn connection(&self) -> Result<redis::Connection, CounterError> {
        self.client.get_connection().map_err(redis_error)
    }
}

fn redis_error(err: redis::RedisError) -> CounterError {
    CounterError::new(format!("redis: {err}"))
}

fn exhausted_slots(slots: &[CounterSlot], counts: &[Option<u32>]) -> Vec<usize> {
    slots
        .iter()
        .zip(counts)
        .enumerate()
        .filter(|(_, (slot, count))| count.unwrap_or(0) >= slot.limit)
        .map(|(i, _)| i)
        .collect()
}

impl CounterStore for RedisCounterStore {
    fn try_acquire(&self, slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError> {
        if slots.is_empty() {
            return Ok(AcquireOutcome::Acquired);
        }
        let mut conn = self.connection()?;
        let keys: Vec<&str> = slots.iter().map(|s| s.key.as_str()).collect();

        redis::transaction(&mut conn, &keys, |conn, pipe| {
            let counts: Vec<Option<u32>> = redis::cmd("MGET").arg(&keys).query(conn)?;
            let exhausted = exhausted_slots(slots, &counts);
            if !exhausted.is_empty() {
                return Ok(Some(AcquireOutcome::Exhausted(exhausted)));
            }

            for slot in slots {
                pipe.cmd("INCR").arg(&slot.key);
                pipe.cmd("EXPIREAT").arg(&slot.key).arg(slot.resets_at.timestamp()).ignore();
            }
            let applied: Option<Vec<i64>> = pipe.query(conn)?;
            Ok(applied.map(|_| AcquireOutcome::Acquired))
        })
        .map_err(redis_error)
    }

    fn current(&self, key: &str) -> Result<u32, CounterError> {
        let mut conn = self.connection()?;
        let count: Option<u32> = redis::cmd("GET").arg(key).query(&mut conn).map_err(redis_error)?;
        Ok(count.unwrap_or(0))
    }

    fn prune(&self, _now: DateTime<Utc>) -> Result<usize, CounterError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_buckets_count_as_empty() {
        let resets_at = Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap();
        let slots = [
            CounterSlot { key: "ai:daily:2026-06-01".into(), limit: 2, resets_at },
            CounterSlot { key: "ai:window:7".into(), limit: 1, resets_at },
        ];
        assert!(exhausted_slots(&slots, &[None, None]).is_empty());
        assert_eq!(exhausted_slots(&slots, &[Some(2), Some(0)]), vec![0]);
    }

    #[test]
    fn bad_url_is_a_counter_error() {
        let err = RedisCounterStore::new("not a url").unwrap_err();
        assert!(err.to_string().starts_with("counter store error: redis:"));
    }
}
