//! Expiry sweep: cancel unpaid orders past their payment window and drop
//! index entries that no longer belong.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use augur_core::Clock;
use augur_orders::{CancelOrder, OrderCommand, OrderStatus};

use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::orders::{Dispatched, OrderDispatcher, OrderStore};
use crate::queue::PriorityIndex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    /// Index entries whose order is missing or no longer active.
    pub index_removed: usize,
    pub failed: usize,
}

pub struct ExpirySweeper {
    orders: Arc<dyn OrderStore>,
    index: Arc<PriorityIndex>,
    clock: Arc<dyn Clock>,
    dispatcher: OrderDispatcher,
    ttl: Duration,
    reason: String,
}

impl ExpirySweeper {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            orders: ctx.orders.clone(),
            index: ctx.index.clone(),
            clock: ctx.clock.clone(),
            dispatcher: ctx.dispatcher(),
            ttl: ctx.config.payment_ttl(),
            reason: ctx.config.expiry.reason.clone(),
        }
    }

    pub fn sweep(&self) -> Result<SweepReport, QueueError> {
        let now = self.clock.now();
        let cutoff = now - self.ttl;
        let mut report = SweepReport::default();

        let unpaid = self
            .orders
            .list_by_status(&[OrderStatus::PendingPayment])
            .inspect_err(|e| error!(error = %e, "expiry sweep could not read orders"))?;

        for order in unpaid.iter().filter(|o| o.created_at() <= cutoff) {
            let order_id = order.id_typed();
            let cancelled = self.dispatcher.dispatch_if(order_id, |o| {
                (o.status() == OrderStatus::PendingPayment && o.created_at() <= cutoff).then(|| {
                    OrderCommand::CancelOrder(CancelOrder {
                        order_id,
                        reason: self.reason.clone(),
                        occurred_at: now,
                    })
                })
            });
            match cancelled {
                Ok(Dispatched::Applied(..)) => {
                    self.index.remove(order_id);
                    report.expired += 1;
                    info!(order_id = %order_id, created_at = %order.created_at(), "unpaid order expired");
                }
                Ok(Dispatched::Declined(_)) => {
                    debug!(order_id = %order_id, "order changed before expiry, skipped");
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "failed to expire order");
                    report.failed += 1;
                }
            }
        }

        for order_id in self.index.snapshot().order_ids() {
            match self.orders.get(order_id) {
                Ok(Some(order)) if order.is_active() => {}
                Ok(_) => {
                    if self.index.remove(order_id) {
                        report.index_removed += 1;
                        debug!(order_id = %order_id, "stale index entry removed");
                    }
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "could not check index entry");
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.index_removed > 0 || report.failed > 0 {
            info!(
                expired = report.expired,
                index_removed = report.index_removed,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }
}
