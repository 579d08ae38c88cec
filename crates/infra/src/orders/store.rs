//! Order persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use augur_core::{AggregateRoot, ExpectedVersion, OrderId};
use augur_orders::{Order, OrderStatus};

use crate::error::StoreError;

/// Order record storage keyed by order id.
///
/// `save` enforces optimistic concurrency: the stored copy must be at the
/// expected version, otherwise the write is rejected with `Conflict`.
pub trait OrderStore: Send + Sync + 'static {
    fn insert(&self, order: Order) -> Result<(), StoreError>;

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// Orders in any of `statuses`, oldest first.
    fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError>;

    /// Number of orders per status. Every status is present, zero or not.
    fn count_by_status(&self) -> Result<BTreeMap<OrderStatus, usize>, StoreError> {
        let mut counts: BTreeMap<OrderStatus, usize> =
            OrderStatus::ALL.iter().map(|&status| (status, 0)).collect();
        for order in self.list_by_status(&OrderStatus::ALL)? {
            *counts.entry(order.status()).or_default() += 1;
        }
        Ok(counts)
    }

    /// Up to `limit` completed orders replied to at or after `since`, latest reply first.
    fn recently_completed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Order>, StoreError> {
        let mut done: Vec<Order> = self
            .list_by_status(&[OrderStatus::Completed])?
            .into_iter()
            .filter(|o| o.replied_at().is_some_and(|at| at >= since))
            .collect();
        done.sort_by(|a, b| b.replied_at().cmp(&a.replied_at()));
        done.truncate(limit);
        Ok(done)
    }
}

impl<S> OrderStore for Arc<S>
where
    S: OrderStore + ?Sized,
{
    fn insert(&self, order: Order) -> Result<(), StoreError> {
        (**self).insert(order)
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get(order_id)
    }

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        (**self).save(order, expected)
    }

    fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
        (**self).list_by_status(statuses)
    }

    fn count_by_status(&self) -> Result<BTreeMap<OrderStatus, usize>, StoreError> {
        (**self).count_by_status()
    }

    fn recently_completed(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Order>, StoreError> {
        (**self).recently_completed(since, limit)
    }
}

/// In-memory order store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(|_| StoreError::poisoned("order store"))?;
        let id = *order.id();
        if orders.contains_key(&id) {
            return Err(StoreError::AlreadyExists(format!("order {id}")));
        }
        orders.insert(id, order);
        Ok(())
    }

    fn get(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().map_err(|_| StoreError::poisoned("order store"))?;
        Ok(orders.get(&order_id).cloned())
    }

    fn save(&self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(|_| StoreError::poisoned("order store"))?;
        let id = *order.id();
        let current = orders
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;

        if !expected.matches(current.version()) {
            return Err(StoreError::Conflict(format!(
                "order {id} is at version {}, expected {expected:?}",
                current.version()
            )));
        }

        orders.insert(id, order.clone());
        Ok(())
    }

    fn list_by_status(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, StoreError> {
        let orders = self.orders.read().map_err(|_| StoreError::poisoned("order store"))?;
        let mut result: Vec<Order> = orders
            .values()
            .filter(|o| statuses.contains(&o.status()))
            .cloned()
            .collect();
        result.sort_by_key(|o| (o.created_at(), *o.id()));
        Ok(result)
    }
}
