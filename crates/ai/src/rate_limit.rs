//! Outbound call budget over two horizons.
//!
//! A call proceeds only when both the calendar-day counter and the current
//! short-window bucket have room. The check and the increment happen in one
//! [`CounterStore::try_acquire`] call, so concurrent callers cannot overshoot,
//! and a denied call spends nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caps for the two counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub daily_limit: u32,
    pub window_limit: u32,
    pub window_seconds: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            daily_limit: 8000,
            window_limit: 10,
            window_seconds: 300,
        }
    }
}

/// One counter participating in an acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSlot {
    pub key: String,
    pub limit: u32,
    /// When the bucket stops counting (start of the next bucket).
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every slot had room and was incremented.
    Acquired,
    /// Indices (into the given slots) of the counters already at their limit.
    /// Nothing was incremented.
    Exhausted(Vec<usize>),
}

/// The counter backend could not be reached or answered badly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("counter store error: {0}")]
pub struct CounterError(pub String);

impl CounterError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Shared counter storage.
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically increment all slots if every one is below its limit.
    fn try_acquire(&self, slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError>;

    /// Current count under `key` (0 when absent).
    fn current(&self, key: &str) -> Result<u32, CounterError>;

    /// Drop buckets whose reset time is at or before `now`. Returns how many
    /// were removed.
    fn prune(&self, now: DateTime<Utc>) -> Result<usize, CounterError>;
}

impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    fn try_acquire(&self, slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError> {
        (**self).try_acquire(slots)
    }

    fn current(&self, key: &str) -> Result<u32, CounterError> {
        (**self).current(key)
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        (**self).prune(now)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    resets_at: DateTime<Utc>,
}

/// Process-local counters behind one mutex.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for InMemoryCounterStore {
    fn try_acquire(&self, slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let exhausted: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| buckets.get(&slot.key).map_or(0, |b| b.count) >= slot.limit)
            .map(|(i, _)| i)
            .collect();

        if !exhausted.is_empty() {
            return Ok(AcquireOutcome::Exhausted(exhausted));
        }

        for slot in slots {
            buckets
                .entry(slot.key.clone())
                .and_modify(|b| b.count += 1)
                .or_insert(Bucket {
                    count: 1,
                    resets_at: slot.resets_at,
                });
        }
        Ok(AcquireOutcome::Acquired)
    }

    fn current(&self, key: &str) -> Result<u32, CounterError> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        Ok(buckets.get(key).map_or(0, |b| b.count))
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|_, b| b.resets_at > now);
        Ok(before - buckets.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterStatus {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub window_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub daily: CounterStatus,
    pub window: WindowStatus,
}

/// Dual-window limiter over a shared [`CounterStore`].
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: RateLimits,
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter").field("limits", &self.limits).finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    pub fn in_memory(limits: RateLimits) -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()), limits)
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Check both counters and, if both have room, count one call.
    ///
    /// A store error denies nothing and spends nothing; the caller decides.
    pub fn allow(&self, now: DateTime<Utc>) -> Result<RateDecision, CounterError> {
        let slots = [self.daily_slot(now), self.window_slot(now)];

        Ok(match self.store.try_acquire(&slots)? {
            AcquireOutcome::Acquired => RateDecision::Allowed,
            AcquireOutcome::Exhausted(indices) => {
                // Both must have budget, so wait for the later reset.
                let resets_at = indices
                    .iter()
                    .filter_map(|&i| slots.get(i))
                    .map(|slot| slot.resets_at)
                    .max()
                    .unwrap_or(now);
                let retry_after = (resets_at - now).max(Duration::zero());
                tracing::debug!(
                    retry_after_secs = retry_after.num_seconds(),
                    "rate limit denied outbound call"
                );
                RateDecision::Denied { retry_after }
            }
        })
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<RateLimitStatus, CounterError> {
        let daily_used = self.store.current(&daily_key(now))?;
        let window_used = self.store.current(&self.window_key(now))?;

        Ok(RateLimitStatus {
            daily: CounterStatus {
                used: daily_used,
                limit: self.limits.daily_limit,
                remaining: self.limits.daily_limit.saturating_sub(daily_used),
            },
            window: WindowStatus {
                used: window_used,
                limit: self.limits.window_limit,
                remaining: self.limits.window_limit.saturating_sub(window_used),
                window_minutes: self.limits.window_seconds / 60,
            },
        })
    }

    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, CounterError> {
        self.store.prune(now)
    }

    fn daily_slot(&self, now: DateTime<Utc>) -> CounterSlot {
        CounterSlot {
            key: daily_key(now),
            limit: self.limits.daily_limit,
            resets_at: next_utc_midnight(now),
        }
    }

    fn window_slot(&self, now: DateTime<Utc>) -> CounterSlot {
        let start = self.window_start(now);
        CounterSlot {
            key: format!("ai:window:{start}"),
            limit: self.limits.window_limit,
            resets_at: Utc
                .timestamp_opt(start + self.window_len(), 0)
                .single()
                .unwrap_or(now),
        }
    }

    fn window_key(&self, now: DateTime<Utc>) -> String {
        format!("ai:window:{}", self.window_start(now))
    }

    fn window_len(&self) -> i64 {
        self.limits.window_seconds.max(1)
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        let len = self.window_len();
        now.timestamp().div_euclid(len) * len
    }
}

fn daily_key(now: DateTime<Utc>) -> String {
    format!("ai:daily:{}", now.format("%Y-%m-%d"))
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}
