//! Job and dead-letter storage.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use augur_core::{JobId, OrderId};

use super::types::{DeadLetterEntry, EnrichmentJob, JobStatus};
use crate::error::StoreError;

/// Enrichment job storage.
///
/// At most one active job (pending, in flight or failed) exists per order.
pub trait JobStore: Send + Sync + 'static {
    /// Store `job` unless the order already has an active one.
    ///
    /// Returns the job that is now active for the order, and whether it was
    /// newly inserted.
    fn enqueue(&self, job: EnrichmentJob) -> Result<(EnrichmentJob, bool), StoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError>;

    fn active_for_order(&self, order_id: OrderId) -> Result<Option<EnrichmentJob>, StoreError>;

    fn update(&self, job: &EnrichmentJob) -> Result<(), StoreError>;

    /// Claim up to `limit` ready jobs, earliest-eligible first, marking them in flight.
    ///
    /// Jobs that have been in flight for `lease` or longer are claimed again.
    fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<EnrichmentJob>, StoreError>;

    /// Replace the text of the order's waiting job. In-flight jobs are left alone.
    ///
    /// Returns `true` when a job was updated.
    fn refresh_text(&self, order_id: OrderId, text: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    fn remove(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError>;

    /// Drop succeeded jobs last touched before `cutoff`.
    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: EnrichmentJob) -> Result<(EnrichmentJob, bool), StoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        (**self).get(job_id)
    }

    fn active_for_order(&self, order_id: OrderId) -> Result<Option<EnrichmentJob>, StoreError> {
        (**self).active_for_order(order_id)
    }

    fn update(&self, job: &EnrichmentJob) -> Result<(), StoreError> {
        (**self).update(job)
    }

    fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<EnrichmentJob>, StoreError> {
        (**self).claim_ready(now, limit, lease)
    }

    fn refresh_text(&self, order_id: OrderId, text: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).refresh_text(order_id, text, now)
    }

    fn remove(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        (**self).remove(job_id)
    }

    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).purge_succeeded_before(cutoff)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub succeeded: usize,
    pub discarded: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, EnrichmentJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: EnrichmentJob) -> Result<(EnrichmentJob, bool), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;
        if let Some(existing) = jobs
            .values()
            .find(|j| j.order_id == job.order_id && j.status.is_active())
        {
            return Ok((existing.clone(), false));
        }
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    fn get(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("job store"))?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn active_for_order(&self, order_id: OrderId) -> Result<Option<EnrichmentJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("job store"))?;
        Ok(jobs
            .values()
            .find(|j| j.order_id == order_id && j.status.is_active())
            .cloned())
    }

    fn update(&self, job: &EnrichmentJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.id))),
        }
    }

    fn claim_ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<EnrichmentJob>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;

        let mut ready: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_claimable(now, lease))
            .map(|j| (j.next_eligible_at, j.created_at, j.id))
            .collect();
        ready.sort();
        ready.truncate(limit);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_in_flight(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    fn refresh_text(&self, order_id: OrderId, text: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;
        let waiting = jobs
            .values_mut()
            .find(|j| j.order_id == order_id && j.status.is_claimable());
        match waiting {
            Some(job) => {
                job.text = text.to_string();
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, job_id: JobId) -> Result<Option<EnrichmentJob>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;
        Ok(jobs.remove(&job_id))
    }

    fn purge_succeeded_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned("job store"))?;
        let before = jobs.len();
        jobs.retain(|_, j| !(matches!(j.status, JobStatus::Succeeded { .. }) && j.updated_at < cutoff));
        Ok(before - jobs.len())
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned("job store"))?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::InFlight => stats.in_flight += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Succeeded { discarded: false } => stats.succeeded += 1,
                JobStatus::Succeeded { discarded: true } => stats.discarded += 1,
                JobStatus::DeadLettered => {}
            }
        }
        Ok(stats)
    }
}

/// Bounded store of jobs that could not be completed.
///
/// Entries are kept oldest first. Pushing past capacity evicts the oldest.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Append an entry; returns the entry evicted to make room, if any.
    fn push(&self, entry: DeadLetterEntry) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Up to `limit` entries next in the replay rotation, without removing them.
    ///
    /// Never-replayed entries come oldest first; an entry whose replay failed
    /// waits behind everything dead-lettered before that failure.
    fn peek_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Record a failed replay, moving the entry to the back of the rotation.
    ///
    /// Returns `false` when the entry is gone.
    fn mark_replay_failed(&self, job_id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Up to `limit` entries, newest first.
    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    fn remove(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Drop entries dead-lettered before `cutoff`.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    fn push(&self, entry: DeadLetterEntry) -> Result<Option<DeadLetterEntry>, StoreError> {
        (**self).push(entry)
    }

    fn peek_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).peek_oldest(limit)
    }

    fn mark_replay_failed(&self, job_id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).mark_replay_failed(job_id, error, now)
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).list(limit)
    }

    fn remove(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        (**self).remove(job_id)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).purge_before(cutoff)
    }

    fn len(&self) -> Result<usize, StoreError> {
        (**self).len()
    }
}

#[derive(Debug)]
pub struct InMemoryDeadLetterStore {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn push(&self, entry: DeadLetterEntry) -> Result<Option<DeadLetterEntry>, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        entries.push_back(entry);
        if entries.len() > self.capacity {
            return Ok(entries.pop_front());
        }
        Ok(None)
    }

    fn peek_oldest(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        let mut rotation: Vec<&DeadLetterEntry> = entries.iter().collect();
        rotation.sort_by_key(|e| (e.replay_after(), e.dead_lettered_at));
        Ok(rotation.into_iter().take(limit).cloned().collect())
    }

    fn mark_replay_failed(&self, job_id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        match entries.iter_mut().find(|e| e.id == job_id) {
            Some(entry) => {
                entry.record_replay_failure(error.to_string(), now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    fn remove(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        let pos = entries.iter().position(|e| e.id == job_id);
        Ok(pos.and_then(|i| entries.remove(i)))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        let before = entries.len();
        entries.retain(|e| e.dead_lettered_at >= cutoff);
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::poisoned("dead letters"))?;
        Ok(entries.len())
    }
}
