//! Derived ranking of active orders.
//!
//! The index is a read-mostly snapshot (`Arc<RankedQueue>`) behind a lock
//! that is only held long enough to clone or replace the pointer. Writers
//! build a complete new snapshot and swap it in, so readers never see a
//! half-built ranking.
//!
//! A full rebuild reads the store without holding the lock. Upserts and
//! removals that land while it runs are journaled and replayed onto the
//! rebuilt ranking before it is swapped in.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use augur_core::OrderId;
use augur_orders::{priority_score, Order, QueueSlot};

/// One ranked order. `score` is as of the snapshot's `scored_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub order_id: OrderId,
    pub normalized_amount: f64,
    pub urgent: bool,
    pub created_at: DateTime<Utc>,
    pub score: f64,
}

impl RankedEntry {
    pub fn from_order(order: &Order, now: DateTime<Utc>) -> Self {
        Self {
            order_id: order.id_typed(),
            normalized_amount: order.normalized_amount(),
            urgent: order.is_urgent(),
            created_at: order.created_at(),
            score: order.priority_score(now),
        }
    }

    fn rescored(mut self, now: DateTime<Utc>) -> Self {
        self.score = priority_score(self.normalized_amount, self.urgent, self.created_at, now);
        self
    }
}

/// Score descending, then older first, then by id.
fn rank_cmp(a: &RankedEntry, b: &RankedEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.order_id.cmp(&b.order_id))
}

/// Immutable ranked snapshot.
#[derive(Debug, Clone, Default)]
pub struct RankedQueue {
    entries: Vec<RankedEntry>,
    positions: HashMap<OrderId, usize>,
    scored_at: Option<DateTime<Utc>>,
}

impl RankedQueue {
    /// Score every entry at `now` and sort.
    pub fn build(entries: impl IntoIterator<Item = RankedEntry>, now: DateTime<Utc>) -> Self {
        let mut entries: Vec<RankedEntry> =
            entries.into_iter().map(|e| e.rescored(now)).collect();
        entries.sort_by(rank_cmp);
        Self::from_sorted(entries, Some(now))
    }

    pub fn from_orders<'a>(orders: impl IntoIterator<Item = &'a Order>, now: DateTime<Utc>) -> Self {
        Self::build(orders.into_iter().map(|o| RankedEntry::from_order(o, now)), now)
    }

    fn from_sorted(entries: Vec<RankedEntry>, scored_at: Option<DateTime<Utc>>) -> Self {
        let positions = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.order_id, i))
            .collect();
        Self {
            entries,
            positions,
            scored_at,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.entries
    }

    pub fn scored_at(&self) -> Option<DateTime<Utc>> {
        self.scored_at
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.positions.contains_key(&order_id)
    }

    pub fn order_ids(&self) -> impl Iterator<Item = OrderId> + '_ {
        self.entries.iter().map(|e| e.order_id)
    }

    /// 1-based rank.
    pub fn position(&self, order_id: OrderId) -> Option<u32> {
        self.positions
            .get(&order_id)
            .map(|&i| u32::try_from(i + 1).unwrap_or(u32::MAX))
    }

    pub fn slot(&self, order_id: OrderId) -> Option<QueueSlot> {
        self.position(order_id)
            .map(|position| QueueSlot::new(position, self.len()))
    }

    fn with_entry(&self, entry: RankedEntry, now: DateTime<Utc>) -> Self {
        let id = entry.order_id;
        let rest = self.entries.iter().filter(|e| e.order_id != id).cloned();
        Self::build(rest.chain(std::iter::once(entry)), now)
    }

    fn without(&self, order_id: OrderId) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|e| e.order_id != order_id)
            .cloned()
            .collect();
        Self::from_sorted(entries, self.scored_at)
    }
}

/// Where a hypothetical order would land.
///
/// Every urgent entry and every entry whose current score beats the
/// hypothetical's fresh score ranks ahead of it.
pub fn simulated_slot(
    queue: &RankedQueue,
    normalized_amount: f64,
    urgent: bool,
    now: DateTime<Utc>,
) -> QueueSlot {
    let candidate = priority_score(normalized_amount, urgent, now, now);
    let ahead = queue
        .entries
        .iter()
        .filter(|e| {
            e.urgent || priority_score(e.normalized_amount, e.urgent, e.created_at, now) > candidate
        })
        .count();
    let position = u32::try_from(ahead + 1).unwrap_or(u32::MAX);
    QueueSlot::new(position, queue.len())
}

/// A change applied to the live ranking while a rebuild was reading the store.
#[derive(Debug, Clone)]
enum IndexChange {
    Upsert(RankedEntry),
    Remove(OrderId),
}

#[derive(Debug, Default)]
struct IndexState {
    current: Arc<RankedQueue>,
    generation: u64,
    journal: Option<Vec<IndexChange>>,
}

impl IndexState {
    fn record(&mut self, change: IndexChange) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(change);
        }
    }
}

/// Handle for one in-progress rebuild. Only the newest ticket can finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildTicket(u64);

/// Shared, swappable ranking.
#[derive(Debug, Default)]
pub struct PriorityIndex {
    state: RwLock<IndexState>,
}

impl PriorityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RankedQueue> {
        match self.state.read() {
            Ok(guard) => guard.current.clone(),
            Err(poisoned) => poisoned.into_inner().current.clone(),
        }
    }

    /// Replace the whole ranking. Returns the previous snapshot.
    pub fn swap(&self, next: RankedQueue) -> Arc<RankedQueue> {
        let mut guard = self.write();
        std::mem::replace(&mut guard.current, Arc::new(next))
    }

    /// Start journaling live changes. Call before reading the store.
    pub fn begin_rebuild(&self) -> RebuildTicket {
        let mut guard = self.write();
        guard.generation += 1;
        guard.journal = Some(Vec::new());
        RebuildTicket(guard.generation)
    }

    /// Replay journaled changes onto `rebuilt` and swap it in.
    ///
    /// Returns `None` when a newer rebuild started in the meantime; the
    /// caller's result is then stale and nothing is swapped.
    pub fn finish_rebuild(
        &self,
        ticket: RebuildTicket,
        rebuilt: RankedQueue,
        now: DateTime<Utc>,
    ) -> Option<Arc<RankedQueue>> {
        let mut guard = self.write();
        if guard.generation != ticket.0 {
            return None;
        }
        let journal = guard.journal.take().unwrap_or_default();
        let mut queue = rebuilt;
        for change in journal {
            queue = match change {
                IndexChange::Upsert(entry) => queue.with_entry(entry, now),
                IndexChange::Remove(order_id) => queue.without(order_id),
            };
        }
        let queue = Arc::new(queue);
        guard.current = queue.clone();
        Some(queue)
    }

    /// Stop journaling without touching the live ranking.
    pub fn abort_rebuild(&self, ticket: RebuildTicket) {
        let mut guard = self.write();
        if guard.generation == ticket.0 {
            guard.journal = None;
        }
    }

    /// Copy-on-write insert (or re-insert) of one order scored at `now`.
    pub fn upsert(&self, order: &Order, now: DateTime<Utc>) {
        self.upsert_entry(RankedEntry::from_order(order, now), now);
    }

    fn upsert_entry(&self, entry: RankedEntry, now: DateTime<Utc>) {
        let mut guard = self.write();
        let next = guard.current.with_entry(entry.clone(), now);
        guard.current = Arc::new(next);
        guard.record(IndexChange::Upsert(entry));
    }

    /// Copy-on-write removal. Returns whether the order was present.
    pub fn remove(&self, order_id: OrderId) -> bool {
        let mut guard = self.write();
        guard.record(IndexChange::Remove(order_id));
        if !guard.current.contains(order_id) {
            return false;
        }
        let next = guard.current.without(order_id);
        guard.current = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn slot(&self, order_id: OrderId) -> Option<QueueSlot> {
        self.snapshot().slot(order_id)
    }

    pub fn simulate(&self, normalized_amount: f64, urgent: bool, now: DateTime<Utc>) -> QueueSlot {
        simulated_slot(&self.snapshot(), normalized_amount, urgent, now)
    }
}
