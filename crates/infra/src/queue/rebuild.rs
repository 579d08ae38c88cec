//! Periodic full rebuild of the priority index.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use augur_core::{Clock, OrderId};
use augur_orders::{AssignQueueSlot, OrderCommand, OrderStatus, QueueSlot};

use super::index::{PriorityIndex, RankedQueue};
use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::orders::{Dispatched, OrderDispatcher, OrderStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub ranked: usize,
    /// Slots written back to orders.
    pub persisted: usize,
    /// Orders whose stored slot was already current.
    pub unchanged: usize,
    pub failed: usize,
}

/// Recomputes the ranking from the order store and swaps it in.
pub struct IndexRebuilder {
    orders: Arc<dyn OrderStore>,
    index: Arc<PriorityIndex>,
    clock: Arc<dyn Clock>,
    dispatcher: OrderDispatcher,
}

impl IndexRebuilder {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            orders: ctx.orders.clone(),
            index: ctx.index.clone(),
            clock: ctx.clock.clone(),
            dispatcher: ctx.dispatcher(),
        }
    }

    /// Rank all queued and processing orders, swap, then persist slots.
    ///
    /// Live upserts and removals made while the store is being read are
    /// merged into the new ranking. If the store cannot be read the current
    /// index is left in place.
    pub fn rebuild(&self) -> Result<RebuildReport, QueueError> {
        let now = self.clock.now();
        let ticket = self.index.begin_rebuild();
        let active = match self
            .orders
            .list_by_status(&[OrderStatus::Queued, OrderStatus::Processing])
        {
            Ok(active) => active,
            Err(e) => {
                self.index.abort_rebuild(ticket);
                error!(error = %e, "index rebuild could not read orders, keeping previous index");
                return Err(e.into());
            }
        };

        let Some(queue) = self
            .index
            .finish_rebuild(ticket, RankedQueue::from_orders(&active, now), now)
        else {
            warn!("index rebuild superseded by a newer one");
            return Ok(RebuildReport::default());
        };
        let slots: Vec<(OrderId, QueueSlot)> = queue
            .order_ids()
            .filter_map(|id| queue.slot(id).map(|slot| (id, slot)))
            .collect();

        let mut report = RebuildReport {
            ranked: queue.len(),
            ..RebuildReport::default()
        };

        for (order_id, slot) in slots {
            let assigned = self.dispatcher.dispatch_if(order_id, |order| {
                (order.is_active() && order.queue_slot() != Some(slot)).then(|| {
                    OrderCommand::AssignQueueSlot(AssignQueueSlot {
                        order_id,
                        slot,
                        occurred_at: now,
                    })
                })
            });
            match assigned {
                Ok(Dispatched::Applied(..)) => report.persisted += 1,
                Ok(Dispatched::Declined(_)) => report.unchanged += 1,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "failed to persist queue slot");
                    report.failed += 1;
                }
            }
        }

        info!(
            ranked = report.ranked,
            persisted = report.persisted,
            failed = report.failed,
            "priority index rebuilt"
        );
        debug!(unchanged = report.unchanged, "unchanged queue slots");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use augur_ai::ScriptedSummarizer;
    use augur_core::{Currency, ManualClock, Money, OwnerId};
    use augur_orders::{ConfirmPayment, Order, SubmitOrder};
    use chrono::{DateTime, TimeZone, Utc};

    use std::sync::Mutex;

    use crate::config::PipelineConfig;
    use crate::error::StoreError;
    use crate::orders::InMemoryOrderStore;
    use crate::service::QueueService;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).unwrap()
    }

    fn context() -> PipelineContext {
        PipelineContext::in_memory(
            PipelineConfig::default(),
            Arc::new(ScriptedSummarizer::new()),
            Arc::new(ManualClock::new(t0())),
        )
    }

    fn order(ctx: &PipelineContext, amount: f64, urgent: bool, paid: bool) -> Order {
        let dispatcher = ctx.dispatcher();
        let order = dispatcher
            .submit(SubmitOrder {
                order_id: OrderId::new(),
                owner_id: OwnerId::new(),
                content: "question".to_string(),
                money: Money::from_minor((amount * 100.0) as i64, Currency::Cad).unwrap(),
                normalized_amount: amount,
                urgent,
                max_modifications: 5,
                occurred_at: t0(),
            })
            .unwrap();
        if !paid {
            return order;
        }
        dispatcher
            .dispatch(order.id_typed(), |o| {
                OrderCommand::ConfirmPayment(ConfirmPayment {
                    order_id: o.id_typed(),
                    occurred_at: t0(),
                })
            })
            .unwrap()
            .0
    }

    #[test]
    fn rebuild_ranks_active_orders_and_persists_slots() {
        let ctx = context();
        let low = order(&ctx, 100.0, false, true);
        let high = order(&ctx, 100.0, true, true);
        let unpaid = order(&ctx, 900.0, true, false);

        let report = IndexRebuilder::new(&ctx).rebuild().unwrap();
        assert_eq!(report.ranked, 2);
        assert_eq!(report.persisted, 2);

        let snapshot = ctx.index.snapshot();
        assert_eq!(snapshot.position(high.id_typed()), Some(1));
        assert_eq!(snapshot.position(low.id_typed()), Some(2));
        assert!(!snapshot.contains(unpaid.id_typed()));

        let stored = ctx.orders.get(low.id_typed()).unwrap().unwrap();
        assert_eq!(stored.queue_slot(), Some(QueueSlot::new(2, 2)));
    }

    #[test]
    fn second_rebuild_writes_nothing_new() {
        let ctx = context();
        order(&ctx, 50.0, false, true);
        order(&ctx, 70.0, false, true);
        let rebuilder = IndexRebuilder::new(&ctx);

        let first = rebuilder.rebuild().unwrap();
        let ids: Vec<_> = ctx.index.snapshot().order_ids().collect();
        let second = rebuilder.rebuild().unwrap();

        assert_eq!(first.persisted, 2);
        assert_eq!(second.persisted, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(ctx.index.snapshot().order_ids().collect::<Vec<_>>(), ids);
    }

    struct BrokenStore;

    impl OrderStore for BrokenStore {
        fn insert(&self, _order: Order) -> Result<(), StoreError> {
            Err(StoreError::Storage("down".into()))
        }

        fn get(&self, _order_id: OrderId) -> Result<Option<Order>, StoreError> {
            Err(StoreError::Storage("down".into()))
        }

        fn save(&self, _order: &Order, _expected: augur_core::ExpectedVersion) -> Result<(), StoreError> {
            Err(StoreError::Storage("down".into()))
        }

        fn list_by_status(&self, _statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
            Err(StoreError::Storage("down".into()))
        }
    }

    /// Runs a hook once, right after the rebuild has read the store.
    struct HookedStore {
        inner: Arc<InMemoryOrderStore>,
        after_list: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl OrderStore for HookedStore {
        fn insert(&self, order: Order) -> Result<(), StoreError> {
            self.inner.insert(order)
        }

        fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
            self.inner.get(order_id)
        }

        fn save(&self, order: &Order, expected: augur_core::ExpectedVersion) -> Result<(), StoreError> {
            self.inner.save(order, expected)
        }

        fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
            let listed = self.inner.list_by_status(statuses)?;
            let hook = self.after_list.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(listed)
        }
    }

    fn hooked_service() -> (Arc<QueueService>, Arc<HookedStore>) {
        let store = Arc::new(HookedStore {
            inner: InMemoryOrderStore::arc(),
            after_list: Mutex::new(None),
        });
        let mut ctx = context();
        ctx.orders = store.clone();
        (Arc::new(QueueService::new(ctx)), store)
    }

    #[test]
    fn payment_confirmed_mid_rebuild_stays_queued() {
        let (svc, store) = hooked_service();
        let id = svc
            .create_order(OwnerId::new(), "question", 5_000, Currency::Cad, false)
            .unwrap();

        let confirming = svc.clone();
        *store.after_list.lock().unwrap() = Some(Box::new(move || {
            confirming.on_payment_confirmed(id).unwrap();
        }));

        let report = IndexRebuilder::new(svc.context()).rebuild().unwrap();
        assert_eq!(report.ranked, 1);
        assert!(svc.context().index.snapshot().contains(id));
        assert_eq!(svc.get_queue_position(id), Ok(QueueSlot::new(1, 1)));
    }

    #[test]
    fn refund_mid_rebuild_is_not_resurrected() {
        let (svc, store) = hooked_service();
        let owner = OwnerId::new();
        let kept = svc.create_order(owner, "first", 5_000, Currency::Cad, false).unwrap();
        let refunded = svc.create_order(owner, "second", 5_000, Currency::Cad, false).unwrap();
        svc.on_payment_confirmed(kept).unwrap();
        svc.on_payment_confirmed(refunded).unwrap();

        let refunding = svc.clone();
        *store.after_list.lock().unwrap() = Some(Box::new(move || {
            refunding.refund(refunded, "duplicate").unwrap();
        }));

        let report = IndexRebuilder::new(svc.context()).rebuild().unwrap();
        assert_eq!(report.ranked, 1);
        let snapshot = svc.context().index.snapshot();
        assert!(snapshot.contains(kept));
        assert!(!snapshot.contains(refunded));
        assert_eq!(svc.get_queue_position(refunded), Err(QueueError::NotInQueue));
    }

    #[test]
    fn unreadable_store_keeps_previous_index() {
        let ctx = context();
        let kept = order(&ctx, 10.0, false, true);
        IndexRebuilder::new(&ctx).rebuild().unwrap();

        let mut broken = ctx.clone();
        broken.orders = Arc::new(BrokenStore);
        let err = IndexRebuilder::new(&broken).rebuild().unwrap_err();

        assert!(matches!(err, QueueError::Storage(_)));
        assert!(ctx.index.snapshot().contains(kept.id_typed()));
    }
}
