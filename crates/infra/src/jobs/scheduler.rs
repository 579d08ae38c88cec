//! Enrichment dispatch, dead-letter replay and cleanup.
//!
//! Per claimed job:
//!
//! ```text
//! order gone / no longer queued ─────────► Succeeded(discarded)
//! keyword already present ───────────────► Succeeded
//! local budget denied ───────────────────► Pending @ now + retry_after (rest of batch too)
//! call ─┬─ Ok(keyword) ──────────────────► keyword recorded, Succeeded
//!       ├─ RateLimited ──────────────────► Pending @ now + max(cooldown, retry_after)
//!       ├─ Transient, budget left ───────► Failed @ now + backoff
//!       ├─ Transient, budget spent ──────► dead letter
//!       └─ Permanent ────────────────────► dead letter
//! ```
//!
//! Nothing escapes a tick: every outcome is a job state change, and store
//! failures are logged and counted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use augur_ai::{FailureKind, Keyword, RateDecision, RateLimiter, Summarizer};
use augur_core::{Clock, OrderId};
use augur_orders::{OrderCommand, RecordKeyword};

use super::store::{DeadLetterStore, JobStore};
use super::types::{DeadLetterEntry, EnrichmentJob, FailureClass, JobStatus, RetryPolicy};
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::orders::{Dispatched, OrderDispatcher, OrderStore};
use crate::queue::SimulationQuota;

/// Counts for one dispatch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    /// Results dropped because the order left the queue.
    pub discarded: usize,
    /// Skipped without a call because the order already had a keyword.
    pub already_enriched: usize,
    /// Results dropped because the order was edited during the call.
    pub stale: usize,
    /// Released because the local budget was exhausted.
    pub deferred: usize,
    pub upstream_limited: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub examined: usize,
    pub requeued: usize,
    /// Entries dropped because their order no longer needs a keyword.
    pub resolved: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dead_letters_purged: usize,
    pub rate_buckets_pruned: usize,
    pub jobs_purged: usize,
    pub simulation_callers_pruned: usize,
    pub errors: usize,
}

enum Outcome {
    Succeeded,
    Discarded,
    AlreadyEnriched,
    Stale,
    Deferred { until: DateTime<Utc> },
    UpstreamLimited,
    Retried,
    DeadLettered,
}

enum ReplayOutcome {
    Requeued,
    Resolved,
}

/// Drives enrichment jobs through their lifecycle.
pub struct RetryScheduler {
    orders: Arc<dyn OrderStore>,
    jobs: Arc<dyn JobStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    limiter: Arc<RateLimiter>,
    summarizer: Arc<dyn Summarizer>,
    simulation: Arc<SimulationQuota>,
    clock: Arc<dyn Clock>,
    config: Arc<PipelineConfig>,
    dispatcher: OrderDispatcher,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            orders: ctx.orders.clone(),
            jobs: ctx.jobs.clone(),
            dead_letters: ctx.dead_letters.clone(),
            limiter: ctx.limiter.clone(),
            summarizer: ctx.summarizer.clone(),
            simulation: ctx.simulation.clone(),
            clock: ctx.clock.clone(),
            config: ctx.config.clone(),
            dispatcher: ctx.dispatcher(),
            policy: ctx.retry_policy(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Create the order's job unless one is already active. Idempotent.
    pub fn enqueue(&self, order_id: OrderId, text: &str) -> Result<EnrichmentJob, QueueError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueueError::Validation("enrichment text must not be empty".to_string()));
        }

        let now = self.clock.now();
        let (job, created) = self.jobs.enqueue(EnrichmentJob::new(order_id, text, now))?;
        if created {
            info!(order_id = %order_id, job_id = %job.id, "enrichment job enqueued");
        } else {
            debug!(order_id = %order_id, job_id = %job.id, status = ?job.status, "enrichment job already active");
        }
        Ok(job)
    }

    /// Point the order's waiting job at new text, or enqueue one.
    ///
    /// An in-flight job is left alone; its result is dropped as stale when it
    /// comes back.
    pub fn refresh(&self, order_id: OrderId, text: &str) -> Result<(), QueueError> {
        if self.jobs.refresh_text(order_id, text, self.clock.now())? {
            debug!(order_id = %order_id, "enrichment job text refreshed");
            return Ok(());
        }
        self.enqueue(order_id, text).map(|_| ())
    }

    pub fn dispatch_tick(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        let now = self.clock.now();

        let batch = match self
            .jobs
            .claim_ready(now, self.config.dispatch.batch_size, self.config.dispatch_lease())
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to claim enrichment jobs");
                report.errors += 1;
                return report;
            }
        };
        report.claimed = batch.len();

        let mut batch = batch.into_iter();
        while let Some(mut job) = batch.next() {
            match self.process(&mut job) {
                Ok(Outcome::Deferred { until }) => {
                    report.deferred += 1;
                    for mut rest in batch.by_ref() {
                        rest.release(self.clock.now(), until, None);
                        match self.jobs.update(&rest) {
                            Ok(()) => report.deferred += 1,
                            Err(e) => {
                                error!(job_id = %rest.id, error = %e, "failed to release job");
                                report.errors += 1;
                            }
                        }
                    }
                    break;
                }
                Ok(Outcome::Succeeded) => report.succeeded += 1,
                Ok(Outcome::Discarded) => report.discarded += 1,
                Ok(Outcome::AlreadyEnriched) => report.already_enriched += 1,
                Ok(Outcome::Stale) => report.stale += 1,
                Ok(Outcome::UpstreamLimited) => report.upstream_limited += 1,
                Ok(Outcome::Retried) => report.retried += 1,
                Ok(Outcome::DeadLettered) => report.dead_lettered += 1,
                Err(e) => {
                    error!(job_id = %job.id, order_id = %job.order_id, error = %e, "enrichment job failed to process");
                    report.errors += 1;
                    self.release_after_error(&mut job, &e);
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                deferred = report.deferred,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                errors = report.errors,
                "dispatch tick finished"
            );
        }
        report
    }

    fn process(&self, job: &mut EnrichmentJob) -> Result<Outcome, QueueError> {
        let now = self.clock.now();

        let order = match self.orders.get(job.order_id)? {
            Some(order) if order.is_active() => order,
            _ => {
                job.mark_succeeded(now, true);
                self.jobs.update(job)?;
                debug!(job_id = %job.id, order_id = %job.order_id, "order left the queue, job discarded");
                return Ok(Outcome::Discarded);
            }
        };

        if order.keyword().is_some() {
            job.mark_succeeded(now, false);
            self.jobs.update(job)?;
            debug!(job_id = %job.id, order_id = %job.order_id, "order already enriched");
            return Ok(Outcome::AlreadyEnriched);
        }

        if let RateDecision::Denied { retry_after } = self.limiter.allow(now)? {
            let until = now + retry_after;
            job.release(now, until, None);
            self.jobs.update(job)?;
            debug!(job_id = %job.id, retry_after_secs = retry_after.num_seconds(), "call budget exhausted, job deferred");
            return Ok(Outcome::Deferred { until });
        }

        let result = self.summarizer.summarize(&job.text);
        let now = self.clock.now();

        match result {
            Ok(keyword) => self.complete(job, keyword, now),
            Err(FailureKind::RateLimited { retry_after }) => {
                let delay = self.policy.rate_limited_delay(retry_after);
                job.release(now, now + delay, Some("upstream rate limited".to_string()));
                self.jobs.update(job)?;
                info!(job_id = %job.id, delay_secs = delay.num_seconds(), "upstream rate limited, job rescheduled");
                Ok(Outcome::UpstreamLimited)
            }
            Err(FailureKind::Transient(msg)) => {
                if job.record_failure(msg, now, &self.policy) {
                    self.jobs.update(job)?;
                    debug!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        next_eligible_at = %job.next_eligible_at,
                        "transient failure, job will retry"
                    );
                    Ok(Outcome::Retried)
                } else {
                    self.dead_letter(job, FailureClass::TransientExhausted, now)?;
                    Ok(Outcome::DeadLettered)
                }
            }
            Err(FailureKind::Permanent(msg)) => {
                job.record_permanent(msg, now);
                self.dead_letter(job, FailureClass::Permanent, now)?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    fn complete(&self, job: &mut EnrichmentJob, keyword: Keyword, now: DateTime<Utc>) -> Result<Outcome, QueueError> {
        let text = job.text.clone();
        let dispatched = self.dispatcher.dispatch_if(job.order_id, |order| {
            let current = order.is_active() && order.keyword().is_none() && order.content() == text;
            current.then(|| {
                OrderCommand::RecordKeyword(RecordKeyword {
                    order_id: order.id_typed(),
                    keyword: keyword.as_str().to_string(),
                    occurred_at: now,
                })
            })
        });

        let order = match dispatched {
            Ok(Dispatched::Applied(..)) => {
                job.mark_succeeded(now, false);
                self.jobs.update(job)?;
                info!(order_id = %job.order_id, job_id = %job.id, keyword = %keyword, "keyword recorded");
                return Ok(Outcome::Succeeded);
            }
            Ok(Dispatched::Declined(order)) => order,
            Err(QueueError::NotFound) => {
                job.mark_succeeded(now, true);
                self.jobs.update(job)?;
                warn!(order_id = %job.order_id, job_id = %job.id, "order vanished during enrichment, result discarded");
                return Ok(Outcome::Discarded);
            }
            Err(e) => return Err(e),
        };

        if !order.is_active() {
            job.mark_succeeded(now, true);
            self.jobs.update(job)?;
            warn!(order_id = %job.order_id, job_id = %job.id, status = %order.status(), "order left the queue during enrichment, result discarded");
            Ok(Outcome::Discarded)
        } else if order.keyword().is_some() {
            job.mark_succeeded(now, false);
            self.jobs.update(job)?;
            Ok(Outcome::AlreadyEnriched)
        } else {
            job.text = order.content().to_string();
            job.release(now, now, None);
            self.jobs.update(job)?;
            debug!(order_id = %job.order_id, job_id = %job.id, "order edited during enrichment, job requeued with new text");
            Ok(Outcome::Stale)
        }
    }

    fn dead_letter(&self, job: &mut EnrichmentJob, class: FailureClass, now: DateTime<Utc>) -> Result<(), QueueError> {
        job.status = JobStatus::DeadLettered;
        let entry = DeadLetterEntry::from_job(job, class, now);
        if let Some(evicted) = self.dead_letters.push(entry)? {
            warn!(job_id = %evicted.id, order_id = %evicted.order_id, "dead-letter store full, oldest entry evicted");
        }
        self.jobs.remove(job.id)?;
        warn!(
            order_id = %job.order_id,
            job_id = %job.id,
            attempts = job.attempts,
            class = ?class,
            error = job.last_error.as_deref().unwrap_or_default(),
            "enrichment job dead-lettered"
        );
        Ok(())
    }

    fn release_after_error(&self, job: &mut EnrichmentJob, error: &QueueError) {
        if job.status != JobStatus::InFlight {
            return;
        }
        let now = self.clock.now();
        job.release(now, now + self.policy.base_delay, Some(error.to_string()));
        if let Err(e) = self.jobs.update(job) {
            error!(job_id = %job.id, error = %e, "failed to release job after error");
        }
    }

    /// Requeue the oldest dead letters whose order still needs a keyword.
    ///
    /// An entry whose replay fails moves to the back of the rotation, so a
    /// batch of stubborn entries cannot starve the rest.
    pub fn replay_dead_letters(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let now = self.clock.now();

        let entries = match self.dead_letters.peek_oldest(self.config.dead_letter.replay_batch_size) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to read dead letters");
                report.errors += 1;
                return report;
            }
        };
        report.examined = entries.len();

        for entry in &entries {
            match self.replay_one(entry, now) {
                Ok(ReplayOutcome::Requeued) => report.requeued += 1,
                Ok(ReplayOutcome::Resolved) => report.resolved += 1,
                Err(e) => {
                    warn!(job_id = %entry.id, order_id = %entry.order_id, error = %e, "dead-letter replay failed");
                    report.errors += 1;
                    if let Err(e) = self.dead_letters.mark_replay_failed(entry.id, &e.to_string(), now) {
                        error!(job_id = %entry.id, error = %e, "failed to rotate dead letter after replay failure");
                    }
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                requeued = report.requeued,
                resolved = report.resolved,
                errors = report.errors,
                "dead-letter replay finished"
            );
        }
        report
    }

    fn replay_one(&self, entry: &DeadLetterEntry, now: DateTime<Utc>) -> Result<ReplayOutcome, QueueError> {
        let order = self.orders.get(entry.order_id)?;
        let Some(order) = order.filter(|o| o.is_active() && o.keyword().is_none()) else {
            self.dead_letters.remove(entry.id)?;
            debug!(job_id = %entry.id, order_id = %entry.order_id, "dead letter no longer needed");
            return Ok(ReplayOutcome::Resolved);
        };

        let (job, _) = self
            .jobs
            .enqueue(EnrichmentJob::new(entry.order_id, order.content(), now))?;
        self.dead_letters.remove(entry.id)?;
        info!(order_id = %entry.order_id, job_id = %job.id, replayed = %entry.id, "dead letter requeued");
        Ok(ReplayOutcome::Requeued)
    }

    /// Purge expired dead letters, rate buckets, finished jobs and simulation history.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = self.clock.now();

        match self.dead_letters.purge_before(now - self.config.dead_letter_retention()) {
            Ok(n) => report.dead_letters_purged = n,
            Err(e) => {
                error!(error = %e, "failed to purge dead letters");
                report.errors += 1;
            }
        }
        match self.limiter.prune(now) {
            Ok(n) => report.rate_buckets_pruned = n,
            Err(e) => {
                error!(error = %e, "failed to prune rate buckets");
                report.errors += 1;
            }
        }
        match self.jobs.purge_succeeded_before(now - self.config.job_retention()) {
            Ok(n) => report.jobs_purged = n,
            Err(e) => {
                error!(error = %e, "failed to purge finished jobs");
                report.errors += 1;
            }
        }
        report.simulation_callers_pruned = self.simulation.prune(now);

        info!(
            dead_letters_purged = report.dead_letters_purged,
            rate_buckets_pruned = report.rate_buckets_pruned,
            jobs_purged = report.jobs_purged,
            "cleanup finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use augur_ai::ScriptedSummarizer;
    use augur_core::{Currency, ManualClock, Money, OwnerId};
    use augur_ai::{AcquireOutcome, CounterError, CounterSlot, CounterStore};
    use augur_orders::{ConfirmPayment, ModifyOrder, Order, OrderStatus, RefundOrder, SubmitOrder};
    use chrono::{Duration, TimeZone};

    use crate::context::StoreSet;
    use crate::error::StoreError;

    struct Harness {
        ctx: PipelineContext,
        clock: Arc<ManualClock>,
        model: Arc<ScriptedSummarizer>,
        scheduler: RetryScheduler,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap()
    }

    fn harness_with(config: PipelineConfig) -> Harness {
        let stores = StoreSet::in_memory(&config);
        harness_with_stores(config, stores)
    }

    fn harness_with_stores(config: PipelineConfig, stores: StoreSet) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let model = Arc::new(ScriptedSummarizer::new());
        let ctx = PipelineContext::new(config, stores, model.clone(), clock.clone());
        let scheduler = RetryScheduler::new(&ctx);
        Harness { ctx, clock, model, scheduler }
    }

    fn harness() -> Harness {
        harness_with(PipelineConfig::default())
    }

    fn queued_order(h: &Harness, content: &str) -> Order {
        let dispatcher = h.ctx.dispatcher();
        let order = dispatcher
            .submit(SubmitOrder {
                order_id: OrderId::new(),
                owner_id: OwnerId::new(),
                content: content.to_string(),
                money: Money::from_minor(10_000, Currency::Cad).unwrap(),
                normalized_amount: 100.0,
                urgent: false,
                max_modifications: 5,
                occurred_at: h.clock.now(),
            })
            .unwrap();
        let (order, _) = dispatcher
            .dispatch(order.id_typed(), |o| {
                OrderCommand::ConfirmPayment(ConfirmPayment {
                    order_id: o.id_typed(),
                    occurred_at: t0(),
                })
            })
            .unwrap();
        h.scheduler.enqueue(order.id_typed(), order.content()).unwrap();
        order
    }

    fn stored(h: &Harness, id: OrderId) -> Order {
        h.ctx.orders.get(id).unwrap().unwrap()
    }

    #[test]
    fn success_records_keyword() {
        let h = harness();
        h.model.push_ok("career, change");
        let order = queued_order(&h, "should I change careers");

        let report = h.scheduler.dispatch_tick();
        assert_eq!(report.succeeded, 1);
        assert_eq!(stored(&h, order.id_typed()).keyword(), Some("career, change"));
        assert!(h.ctx.jobs.active_for_order(order.id_typed()).unwrap().is_none());
    }

    #[test]
    fn enqueue_twice_keeps_one_job() {
        let h = harness();
        let order = queued_order(&h, "question");
        let again = h.scheduler.enqueue(order.id_typed(), "question").unwrap();

        assert_eq!(h.ctx.jobs.stats().unwrap().pending, 1);
        assert_eq!(h.ctx.jobs.active_for_order(order.id_typed()).unwrap().map(|j| j.id), Some(again.id));
    }

    #[test]
    fn transient_failures_back_off_then_dead_letter() {
        let h = harness();
        for _ in 0..3 {
            h.model.push_err(FailureKind::transient("503 service unavailable"));
        }
        let order = queued_order(&h, "question");

        assert_eq!(h.scheduler.dispatch_tick().retried, 1);
        // Not eligible before the first backoff elapses.
        assert_eq!(h.scheduler.dispatch_tick().claimed, 0);

        h.clock.advance(Duration::seconds(60));
        assert_eq!(h.scheduler.dispatch_tick().retried, 1);

        h.clock.advance(Duration::seconds(120));
        assert_eq!(h.scheduler.dispatch_tick().dead_lettered, 1);

        let letters = h.ctx.dead_letters.list(10).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].order_id, order.id_typed());
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].class, FailureClass::TransientExhausted);
        assert_eq!(letters[0].first_failed_at, t0());
        assert!(h.ctx.jobs.active_for_order(order.id_typed()).unwrap().is_none());
    }

    #[test]
    fn permanent_failure_dead_letters_immediately() {
        let h = harness();
        h.model.push_err(FailureKind::permanent("401 unauthorized"));
        queued_order(&h, "question");

        assert_eq!(h.scheduler.dispatch_tick().dead_lettered, 1);
        let letters = h.ctx.dead_letters.list(10).unwrap();
        assert_eq!(letters[0].attempts, 0);
        assert_eq!(letters[0].class, FailureClass::Permanent);
        assert_eq!(letters[0].last_error, "401 unauthorized");
    }

    #[test]
    fn upstream_rate_limit_does_not_spend_retries() {
        let h = harness();
        h.model.push_err(FailureKind::RateLimited {
            retry_after: Some(Duration::seconds(30)),
        });
        let order = queued_order(&h, "question");

        assert_eq!(h.scheduler.dispatch_tick().upstream_limited, 1);
        let job = h.ctx.jobs.active_for_order(order.id_typed()).unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_eligible_at, t0() + Duration::minutes(15));
    }

    #[test]
    fn local_budget_denial_releases_rest_of_batch() {
        let mut config = PipelineConfig::default();
        config.rate_limit.window_limit = 1;
        let h = harness_with(config);
        let orders: Vec<_> = (0..3).map(|i| queued_order(&h, &format!("question {i}"))).collect();

        let report = h.scheduler.dispatch_tick();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(h.model.calls(), 1);

        // 10:00 bucket ends at 10:05.
        for order in &orders[1..] {
            let job = h.ctx.jobs.active_for_order(order.id_typed()).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, 0);
            assert_eq!(job.next_eligible_at, t0() + Duration::minutes(5));
        }
    }

    #[test]
    fn refunded_order_is_discarded_without_a_call() {
        let h = harness();
        let order = queued_order(&h, "question");
        h.ctx
            .dispatcher()
            .dispatch(order.id_typed(), |o| {
                OrderCommand::RefundOrder(RefundOrder {
                    order_id: o.id_typed(),
                    reason: "customer request".to_string(),
                    occurred_at: t0(),
                })
            })
            .unwrap();

        assert_eq!(h.scheduler.dispatch_tick().discarded, 1);
        assert_eq!(h.model.calls(), 0);
        assert_eq!(h.ctx.jobs.stats().unwrap().discarded, 1);
    }

    #[test]
    fn already_enriched_order_skips_the_call() {
        let h = harness();
        let order = queued_order(&h, "question");
        h.ctx
            .dispatcher()
            .dispatch(order.id_typed(), |o| {
                OrderCommand::RecordKeyword(RecordKeyword {
                    order_id: o.id_typed(),
                    keyword: "earlier".to_string(),
                    occurred_at: t0(),
                })
            })
            .unwrap();

        assert_eq!(h.scheduler.dispatch_tick().already_enriched, 1);
        assert_eq!(h.model.calls(), 0);
    }

    /// Edits the order while the "call" is in progress.
    struct EditingSummarizer {
        dispatcher: OrderDispatcher,
        edit: std::sync::Mutex<Option<ModifyOrder>>,
    }

    impl Summarizer for EditingSummarizer {
        fn summarize(&self, _text: &str) -> Result<Keyword, FailureKind> {
            let pending = self.edit.lock().unwrap().take();
            if let Some(cmd) = pending {
                self.dispatcher
                    .dispatch(cmd.order_id, |_| OrderCommand::ModifyOrder(cmd.clone()))
                    .unwrap();
            }
            augur_ai::ScriptedSummarizer::new().summarize("old text keyword")
        }
    }

    #[test]
    fn edit_during_call_drops_stale_keyword() {
        let clock = Arc::new(ManualClock::new(t0()));
        let orders: Arc<dyn OrderStore> = crate::orders::InMemoryOrderStore::arc();
        let editing = Arc::new(EditingSummarizer {
            dispatcher: OrderDispatcher::new(orders.clone()),
            edit: std::sync::Mutex::new(None),
        });
        let mut ctx = PipelineContext::in_memory(PipelineConfig::default(), editing.clone(), clock.clone());
        ctx.orders = orders;
        let scheduler = RetryScheduler::new(&ctx);
        let h = Harness {
            ctx,
            clock,
            model: Arc::new(ScriptedSummarizer::new()),
            scheduler,
        };

        let order = queued_order(&h, "old text");
        *editing.edit.lock().unwrap() = Some(ModifyOrder {
            order_id: order.id_typed(),
            owner_id: order.owner_id().unwrap(),
            content: "new text".to_string(),
            money: order.money().unwrap(),
            normalized_amount: 100.0,
            urgent: false,
            occurred_at: t0(),
        });

        assert_eq!(h.scheduler.dispatch_tick().stale, 1);
        assert_eq!(stored(&h, order.id_typed()).keyword(), None);

        let job = h.ctx.jobs.active_for_order(order.id_typed()).unwrap().unwrap();
        assert_eq!(job.text, "new text");
        assert_eq!(job.attempts, 0);
        assert!(job.is_ready(t0()));
    }

    #[test]
    fn replay_requeues_and_success_clears_the_entry() {
        let h = harness();
        h.model.push_err(FailureKind::permanent("400 bad request"));
        let order = queued_order(&h, "question about travel");
        h.scheduler.dispatch_tick();
        assert_eq!(h.ctx.dead_letters.len().unwrap(), 1);

        let replay = h.scheduler.replay_dead_letters();
        assert_eq!(replay.requeued, 1);
        assert_eq!(h.ctx.dead_letters.len().unwrap(), 0);

        h.model.push_ok("travel");
        assert_eq!(h.scheduler.dispatch_tick().succeeded, 1);
        assert_eq!(stored(&h, order.id_typed()).keyword(), Some("travel"));
    }

    #[test]
    fn replay_drops_entries_for_finished_orders() {
        let h = harness();
        h.model.push_err(FailureKind::permanent("400 bad request"));
        let order = queued_order(&h, "question");
        h.scheduler.dispatch_tick();
        h.ctx
            .dispatcher()
            .dispatch(order.id_typed(), |o| {
                OrderCommand::RefundOrder(RefundOrder {
                    order_id: o.id_typed(),
                    reason: "refund".to_string(),
                    occurred_at: t0(),
                })
            })
            .unwrap();

        let replay = h.scheduler.replay_dead_letters();
        assert_eq!(replay.resolved, 1);
        assert_eq!(replay.requeued, 0);
        assert_eq!(h.ctx.dead_letters.len().unwrap(), 0);
        assert_eq!(h.ctx.jobs.stats().unwrap().pending, 0);
    }

    #[test]
    fn cleanup_purges_expired_records() {
        let h = harness();
        h.model.push_err(FailureKind::permanent("400 bad request"));
        queued_order(&h, "dead");
        queued_order(&h, "alive");
        h.scheduler.dispatch_tick();
        assert_eq!(h.ctx.dead_letters.len().unwrap(), 1);

        h.clock.advance(Duration::days(8));
        let report = h.scheduler.cleanup();
        assert_eq!(report.dead_letters_purged, 1);
        assert_eq!(report.jobs_purged, 1);
        assert!(report.rate_buckets_pruned >= 2);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn job_abandoned_in_flight_is_reclaimed_after_the_lease() {
        let h = harness();
        h.model.push_ok("health");
        let order = queued_order(&h, "question about health");

        // A tick claimed the job and died before recording any outcome.
        let lease = h.ctx.config.dispatch_lease();
        let abandoned = h.ctx.jobs.claim_ready(t0(), 5, lease).unwrap();
        assert_eq!(abandoned.len(), 1);

        h.clock.advance(lease - Duration::seconds(1));
        assert_eq!(h.scheduler.dispatch_tick().claimed, 0);
        assert_eq!(h.ctx.jobs.stats().unwrap().in_flight, 1);

        h.clock.advance(Duration::seconds(1));
        let report = h.scheduler.dispatch_tick();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(stored(&h, order.id_typed()).keyword(), Some("health"));
        assert_eq!(h.ctx.jobs.stats().unwrap().in_flight, 0);
    }

    struct DownCounters;

    impl CounterStore for DownCounters {
        fn try_acquire(&self, _slots: &[CounterSlot]) -> Result<AcquireOutcome, CounterError> {
            Err(CounterError::new("connection reset"))
        }

        fn current(&self, _key: &str) -> Result<u32, CounterError> {
            Err(CounterError::new("connection reset"))
        }

        fn prune(&self, _now: DateTime<Utc>) -> Result<usize, CounterError> {
            Err(CounterError::new("connection reset"))
        }
    }

    #[test]
    fn counter_store_outage_releases_the_job_without_calling() {
        let config = PipelineConfig::default();
        let stores = StoreSet {
            counters: Arc::new(DownCounters),
            ..StoreSet::in_memory(&config)
        };
        let h = harness_with_stores(config, stores);
        let order = queued_order(&h, "question");

        let report = h.scheduler.dispatch_tick();
        assert_eq!(report.errors, 1);
        assert_eq!(h.model.calls(), 0);

        let job = h.ctx.jobs.active_for_order(order.id_typed()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_eligible_at, t0() + h.scheduler.policy().base_delay);

        assert_eq!(h.scheduler.cleanup().errors, 1);
    }

    /// Order store whose reads fail for one chosen order.
    struct UnreadableOrder {
        inner: Arc<crate::orders::InMemoryOrderStore>,
        broken: std::sync::Mutex<Option<OrderId>>,
    }

    impl OrderStore for UnreadableOrder {
        fn insert(&self, order: Order) -> Result<(), StoreError> {
            self.inner.insert(order)
        }

        fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
            if *self.broken.lock().unwrap() == Some(order_id) {
                return Err(StoreError::Storage("read timed out".into()));
            }
            self.inner.get(order_id)
        }

        fn save(&self, order: &Order, expected: augur_core::ExpectedVersion) -> Result<(), StoreError> {
            self.inner.save(order, expected)
        }

        fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
            self.inner.list_by_status(statuses)
        }
    }

    #[test]
    fn failing_replay_does_not_starve_later_entries() {
        let mut config = PipelineConfig::default();
        config.dead_letter.replay_batch_size = 1;
        let orders = Arc::new(UnreadableOrder {
            inner: crate::orders::InMemoryOrderStore::arc(),
            broken: std::sync::Mutex::new(None),
        });
        let stores = StoreSet {
            orders: orders.clone(),
            ..StoreSet::in_memory(&config)
        };
        let h = harness_with_stores(config, stores);

        h.model.push_err(FailureKind::permanent("400 bad request"));
        let stuck = queued_order(&h, "first");
        h.scheduler.dispatch_tick();
        h.clock.advance(Duration::minutes(1));
        h.model.push_err(FailureKind::permanent("400 bad request"));
        let healthy = queued_order(&h, "second");
        h.scheduler.dispatch_tick();
        assert_eq!(h.ctx.dead_letters.len().unwrap(), 2);

        *orders.broken.lock().unwrap() = Some(stuck.id_typed());
        h.clock.advance(Duration::hours(1));
        let first = h.scheduler.replay_dead_letters();
        assert_eq!((first.examined, first.errors), (1, 1));

        let second = h.scheduler.replay_dead_letters();
        assert_eq!(second.requeued, 1);
        assert!(h.ctx.jobs.active_for_order(healthy.id_typed()).unwrap().is_some());

        let left = h.ctx.dead_letters.list(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].order_id, stuck.id_typed());
        assert_eq!(left[0].replay_failures, 1);
    }
}
