//! Enrichment job types and retry policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use augur_core::{JobId, OrderId};

use crate::config::RetryConfig;

/// Job lifecycle.
///
/// `Pending → InFlight → {Succeeded | Failed → (eligible again) | DeadLettered}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next-eligible time.
    Pending,
    /// Claimed by a dispatch tick.
    InFlight,
    /// Finished. `discarded` results were dropped because the order left the queue.
    Succeeded { discarded: bool },
    /// Failed transiently; retried once eligible.
    Failed,
    /// Moved to the dead-letter store.
    DeadLettered,
}

impl JobStatus {
    /// Active jobs block creating another job for the same order.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InFlight | JobStatus::Failed)
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

/// Retry budget and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transient failures allowed before dead-lettering.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Floor for the wait after an upstream 429.
    pub rate_limited_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::seconds(cfg.base_delay_secs),
            max_delay: Duration::seconds(cfg.max_delay_secs),
            rate_limited_cooldown: Duration::seconds(cfg.rate_limited_cooldown_secs),
        }
    }

    /// Delay after the `attempt`-th failure (1-indexed): `base × 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::zero();
        }
        let factor = 1i64 << attempt.saturating_sub(1).min(30);
        let secs = self.base_delay.num_seconds().saturating_mul(factor);
        Duration::seconds(secs).min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Wait after an upstream 429: at least the cooldown, longer if asked.
    pub fn rate_limited_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map_or(self.rate_limited_cooldown, |d| d.max(self.rate_limited_cooldown))
    }
}

/// One summarization job for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: JobId,
    pub order_id: OrderId,
    /// Text as of enqueue (or the last refresh after an edit).
    pub text: String,
    /// Transient failures so far.
    pub attempts: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub first_failed_at: Option<DateTime<Utc>>,
    /// When the current in-flight claim was taken.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnrichmentJob {
    pub fn new(order_id: OrderId, text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            order_id,
            text: text.into(),
            attempts: 0,
            next_eligible_at: now,
            status: JobStatus::Pending,
            last_error: None,
            first_failed_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_eligible_at <= now
    }

    /// In flight for longer than `lease`: the claiming tick is presumed dead.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.status == JobStatus::InFlight
            && self.claimed_at.is_none_or(|claimed| claimed + lease <= now)
    }

    /// Ready, or stuck in flight past its lease.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.is_ready(now) || self.lease_expired(now, lease)
    }

    pub fn mark_in_flight(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::InFlight;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>, discarded: bool) {
        self.status = JobStatus::Succeeded { discarded };
        self.claimed_at = None;
        self.updated_at = now;
    }

    /// Put back without spending a retry (local budget or upstream 429).
    pub fn release(&mut self, now: DateTime<Utc>, eligible_at: DateTime<Utc>, reason: Option<String>) {
        self.status = JobStatus::Pending;
        self.claimed_at = None;
        self.next_eligible_at = eligible_at;
        if reason.is_some() {
            self.last_error = reason;
        }
        self.updated_at = now;
    }

    /// Count one failure. Returns `true` while the job is still retryable;
    /// `false` means the caller must dead-letter it.
    pub fn record_failure(&mut self, error: String, now: DateTime<Utc>, policy: &RetryPolicy) -> bool {
        self.attempts += 1;
        self.claimed_at = None;
        self.first_failed_at.get_or_insert(now);
        self.last_error = Some(error);
        self.updated_at = now;

        if policy.should_retry(self.attempts) {
            self.status = JobStatus::Failed;
            self.next_eligible_at = now + policy.delay_for_attempt(self.attempts);
            true
        } else {
            false
        }
    }

    /// Record a failure that skips the retry budget.
    pub fn record_permanent(&mut self, error: String, now: DateTime<Utc>) {
        self.first_failed_at.get_or_insert(now);
        self.last_error = Some(error);
        self.updated_at = now;
    }
}

/// Why a job ended up in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientExhausted,
    Permanent,
}

/// A job that could not be completed, kept for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Id of the job that failed.
    pub id: JobId,
    pub order_id: OrderId,
    pub text: String,
    pub last_error: String,
    pub class: FailureClass,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub attempts: u32,
    /// Replays of this entry that failed.
    #[serde(default)]
    pub replay_failures: u32,
    #[serde(default)]
    pub last_replay_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &EnrichmentJob, class: FailureClass, now: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            order_id: job.order_id,
            text: job.text.clone(),
            last_error: job.last_error.clone().unwrap_or_default(),
            class,
            first_failed_at: job.first_failed_at.unwrap_or(now),
            dead_lettered_at: now,
            attempts: job.attempts,
            replay_failures: 0,
            last_replay_at: None,
        }
    }

    /// Position in the replay rotation: entries whose replay failed go to the back.
    pub fn replay_after(&self) -> DateTime<Utc> {
        self.last_replay_at.unwrap_or(self.dead_lettered_at)
    }

    pub fn record_replay_failure(&mut self, error: String, now: DateTime<Utc>) {
        self.replay_failures += 1;
        self.last_replay_at = Some(now);
        self.last_error = error;
    }
}
