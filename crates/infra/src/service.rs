//! `QueueService`: the synchronous surface used by the API layer.
//!
//! Order lifecycle calls go through the order dispatcher, then keep the
//! priority index and enrichment jobs in step. Enrichment problems are logged
//! and never fail a lifecycle call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use augur_ai::{check_health, RateLimitStatus, SummarizerHealth};
use augur_core::{Currency, JobId, Money, OrderId, OwnerId};
use augur_orders::{
    ConfirmPayment, ModifyOrder, Order, OrderCommand, OrderStatus, QueueSlot, RefundOrder,
    ReplyToOrder, StartProcessing, SubmitOrder,
};

use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::jobs::{DeadLetterEntry, JobStats, RetryScheduler};
use crate::orders::OrderDispatcher;
use crate::queue::{AutoProcessOutcome, AutoProcessor, QueueReport, QueueReporter};
use crate::settings::{QueueSettings, SettingsUpdate};

/// Result of an accepted edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModificationReceipt {
    pub count: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub jobs: JobStats,
    pub dead_letters: usize,
    pub indexed: usize,
    pub active_orders: usize,
    pub enriched: usize,
    pub awaiting_keyword: usize,
}

pub struct QueueService {
    ctx: PipelineContext,
    dispatcher: OrderDispatcher,
    scheduler: RetryScheduler,
}

impl QueueService {
    pub fn new(ctx: PipelineContext) -> Self {
        let dispatcher = ctx.dispatcher();
        let scheduler = RetryScheduler::new(&ctx);
        Self {
            ctx,
            dispatcher,
            scheduler,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    fn price(&self, amount_minor: i64, currency: Currency) -> Result<(Money, f64), QueueError> {
        let money = Money::from_minor(amount_minor, currency)?;
        let normalized = self.ctx.config.exchange_rates.normalize(&money)?;
        Ok((money, normalized))
    }

    /// Submit a new order awaiting payment.
    pub fn create_order(
        &self,
        owner: OwnerId,
        text: &str,
        amount_minor: i64,
        currency: Currency,
        urgent: bool,
    ) -> Result<OrderId, QueueError> {
        let (money, normalized_amount) = self.price(amount_minor, currency)?;
        let order = self.dispatcher.submit(SubmitOrder {
            order_id: OrderId::new(),
            owner_id: owner,
            content: text.to_string(),
            money,
            normalized_amount,
            urgent,
            max_modifications: self.ctx.config.queue.max_modifications,
            occurred_at: self.now(),
        })?;

        info!(
            order_id = %order.id_typed(),
            owner_id = %owner,
            amount = %money,
            normalized_amount,
            urgent,
            "order created"
        );
        Ok(order.id_typed())
    }

    /// Owner edit. Clears the keyword; a queued order gets its enrichment redone.
    pub fn modify_order(
        &self,
        owner: OwnerId,
        order_id: OrderId,
        text: &str,
        amount_minor: i64,
        currency: Currency,
        urgent: bool,
    ) -> Result<ModificationReceipt, QueueError> {
        let (money, normalized_amount) = self.price(amount_minor, currency)?;
        let now = self.now();
        let (order, _) = self.dispatcher.dispatch(order_id, |_| {
            OrderCommand::ModifyOrder(ModifyOrder {
                order_id,
                owner_id: owner,
                content: text.to_string(),
                money,
                normalized_amount,
                urgent,
                occurred_at: now,
            })
        })?;

        if order.is_active() {
            self.ctx.index.upsert(&order, now);
        }
        if order.status() == OrderStatus::Queued {
            if let Err(e) = self.scheduler.refresh(order_id, order.content()) {
                error!(order_id = %order_id, error = %e, "failed to refresh enrichment after edit");
            }
        }

        let receipt = ModificationReceipt {
            count: order.modification_count(),
            remaining: order.remaining_modifications(),
        };
        info!(order_id = %order_id, count = receipt.count, remaining = receipt.remaining, "order modified");
        Ok(receipt)
    }

    /// Payment confirmed: queue the order, rank it and schedule enrichment.
    pub fn on_payment_confirmed(&self, order_id: OrderId) -> Result<(), QueueError> {
        let now = self.now();
        let (order, _) = self.dispatcher.dispatch(order_id, |_| {
            OrderCommand::ConfirmPayment(ConfirmPayment {
                order_id,
                occurred_at: now,
            })
        })?;

        self.ctx.index.upsert(&order, now);
        info!(order_id = %order_id, queued = self.ctx.index.len(), "payment confirmed, order queued");

        if let Err(e) = self.scheduler.enqueue(order_id, order.content()) {
            error!(order_id = %order_id, error = %e, "failed to enqueue enrichment");
        }
        Ok(())
    }

    /// Staff picked the order up.
    pub fn start_processing(&self, order_id: OrderId) -> Result<(), QueueError> {
        let now = self.now();
        self.dispatcher.dispatch(order_id, |_| {
            OrderCommand::StartProcessing(StartProcessing {
                order_id,
                occurred_at: now,
            })
        })?;
        info!(order_id = %order_id, "order processing started");
        Ok(())
    }

    pub fn reply(&self, order_id: OrderId, content: &str) -> Result<(), QueueError> {
        let now = self.now();
        self.dispatcher.dispatch(order_id, |_| {
            OrderCommand::ReplyToOrder(ReplyToOrder {
                order_id,
                content: content.to_string(),
                occurred_at: now,
            })
        })?;
        self.ctx.index.remove(order_id);
        info!(order_id = %order_id, "order completed");
        Ok(())
    }

    pub fn refund(&self, order_id: OrderId, reason: &str) -> Result<(), QueueError> {
        let now = self.now();
        self.dispatcher.dispatch(order_id, |_| {
            OrderCommand::RefundOrder(RefundOrder {
                order_id,
                reason: reason.to_string(),
                occurred_at: now,
            })
        })?;
        self.ctx.index.remove(order_id);
        info!(order_id = %order_id, reason, "order refunded");
        Ok(())
    }

    /// Make sure an active order has an enrichment job. Idempotent.
    pub fn enqueue_for_enrichment(&self, order_id: OrderId, text: &str) -> Result<JobId, QueueError> {
        let order = self.get_order(order_id)?;
        if !order.is_active() {
            return Err(QueueError::NotInQueue);
        }
        self.scheduler.enqueue(order_id, text).map(|job| job.id)
    }

    /// Stored slot from the last rebuild, or the live index before the first one.
    pub fn get_queue_position(&self, order_id: OrderId) -> Result<QueueSlot, QueueError> {
        let order = self.get_order(order_id)?;
        if !order.is_active() {
            return Err(QueueError::NotInQueue);
        }
        order
            .queue_slot()
            .or_else(|| self.ctx.index.slot(order_id))
            .ok_or(QueueError::NotInQueue)
    }

    /// Where a hypothetical order would land right now. Read-only.
    pub fn simulate_position(
        &self,
        caller: OwnerId,
        amount_minor: i64,
        currency: Currency,
        urgent: bool,
    ) -> Result<QueueSlot, QueueError> {
        let (_, normalized_amount) = self.price(amount_minor, currency)?;
        let now = self.now();
        self.ctx
            .simulation
            .check(caller, now)
            .map_err(|retry_after| QueueError::RateLimitExceeded { retry_after })?;
        Ok(self.ctx.index.simulate(normalized_amount, urgent, now))
    }

    pub fn get_rate_limit_status(&self) -> Result<RateLimitStatus, QueueError> {
        Ok(self.ctx.limiter.status(self.now())?)
    }

    pub fn get_settings(&self) -> Result<QueueSettings, QueueError> {
        Ok(self.ctx.settings.load()?)
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<QueueSettings, QueueError> {
        let settings = self.ctx.settings.load()?.apply(update)?;
        self.ctx.settings.save(&settings)?;
        info!(
            is_enabled = settings.is_enabled,
            min_amount = settings.min_amount,
            currency = ?settings.currency,
            "queue settings updated"
        );
        Ok(settings)
    }

    /// Move the queue head to processing if the queue is enabled and idle.
    pub fn check_auto_processing(&self) -> Result<AutoProcessOutcome, QueueError> {
        AutoProcessor::new(&self.ctx).run()
    }

    pub fn generate_queue_report(&self) -> Result<QueueReport, QueueError> {
        QueueReporter::new(&self.ctx).generate()
    }

    pub fn latest_queue_report(&self) -> Result<Option<QueueReport>, QueueError> {
        Ok(self.ctx.reports.latest()?)
    }

    /// One budgeted call through the configured summarizer.
    pub fn check_summarizer(&self) -> SummarizerHealth {
        check_health(self.ctx.summarizer.as_ref(), &self.ctx.limiter, self.now())
    }

    /// Newest first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.ctx.dead_letters.list(limit)?)
    }

    pub fn pipeline_stats(&self) -> Result<PipelineStats, QueueError> {
        let active = self
            .ctx
            .orders
            .list_by_status(&[OrderStatus::Queued, OrderStatus::Processing])?;
        let enriched = active.iter().filter(|o| o.keyword().is_some()).count();

        Ok(PipelineStats {
            jobs: self.ctx.jobs.stats()?,
            dead_letters: self.ctx.dead_letters.len()?,
            indexed: self.ctx.index.len(),
            active_orders: active.len(),
            enriched,
            awaiting_keyword: active.len() - enriched,
        })
    }

    pub fn get_order(&self, order_id: OrderId) -> Result<Order, QueueError> {
        self.ctx.orders.get(order_id)?.ok_or(QueueError::NotFound)
    }
}
