//! Command execution for the `Order` aggregate.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the current order
//!   ↓
//! 2. Handle the command (pure decision, yields events)
//!   ↓
//! 3. Apply events
//!   ↓
//! 4. Save with the loaded version as expectation
//! ```
//!
//! Losing a version race reloads once and re-decides against fresh state. A
//! second conflict is returned to the caller.

use std::sync::Arc;

use tracing::debug;

use augur_core::{Aggregate, AggregateRoot, ExpectedVersion, OrderId};
use augur_orders::{Order, OrderCommand, OrderEvent, SubmitOrder};

use crate::error::{QueueError, StoreError};
use crate::orders::store::OrderStore;

#[derive(Clone)]
pub struct OrderDispatcher {
    store: Arc<dyn OrderStore>,
}

impl OrderDispatcher {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Create a brand new order from a submission.
    pub fn submit(&self, cmd: SubmitOrder) -> Result<Order, QueueError> {
        let mut order = Order::empty(cmd.order_id);
        order.execute(&OrderCommand::SubmitOrder(cmd))?;
        self.store.insert(order.clone())?;
        Ok(order)
    }

    /// Load, decide, apply and save a command against an existing order.
    ///
    /// `build` is re-run after a reload so it can read fresh state.
    pub fn dispatch<F>(
        &self,
        order_id: OrderId,
        build: F,
    ) -> Result<(Order, Vec<OrderEvent>), QueueError>
    where
        F: Fn(&Order) -> OrderCommand,
    {
        match self.dispatch_if(order_id, |order| Some(build(order)))? {
            Dispatched::Applied(order, events) => Ok((order, events)),
            Dispatched::Declined(order) => Ok((order, Vec::new())),
        }
    }

    /// Like [`dispatch`](Self::dispatch), but `decide` may decline by returning
    /// `None` after inspecting the loaded order. Nothing is saved in that case.
    pub fn dispatch_if<F>(&self, order_id: OrderId, decide: F) -> Result<Dispatched, QueueError>
    where
        F: Fn(&Order) -> Option<OrderCommand>,
    {
        match self.try_dispatch(order_id, &decide) {
            Err(QueueError::Conflict(msg)) => {
                debug!(order_id = %order_id, reason = %msg, "order version conflict, reloading");
                self.try_dispatch(order_id, &decide)
            }
            other => other,
        }
    }

    fn try_dispatch<F>(&self, order_id: OrderId, decide: &F) -> Result<Dispatched, QueueError>
    where
        F: Fn(&Order) -> Option<OrderCommand>,
    {
        let mut order = self.store.get(order_id)?.ok_or(QueueError::NotFound)?;
        let base_version = order.version();

        let Some(cmd) = decide(&order) else {
            return Ok(Dispatched::Declined(order));
        };
        let events = order.execute(&cmd)?;
        if events.is_empty() {
            return Ok(Dispatched::Applied(order, events));
        }

        match self.store.save(&order, ExpectedVersion::Exact(base_version)) {
            Ok(()) => Ok(Dispatched::Applied(order, events)),
            Err(StoreError::Conflict(msg)) => Err(QueueError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Result of [`OrderDispatcher::dispatch_if`].
#[derive(Debug)]
pub enum Dispatched {
    Applied(Order, Vec<OrderEvent>),
    /// The decision declined; carries the order as loaded.
    Declined(Order),
}
