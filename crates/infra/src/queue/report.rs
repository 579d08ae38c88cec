//! Periodic snapshot of queue health.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use augur_core::Clock;
use augur_orders::{Order, OrderStatus};

use super::index::PriorityIndex;
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::error::{QueueError, StoreError};
use crate::orders::OrderStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueReport {
    pub generated_at: DateTime<Utc>,
    /// Orders currently ranked.
    pub queue_length: usize,
    pub order_stats: BTreeMap<OrderStatus, usize>,
    /// Mean hours from creation to reply over the recent completions, two decimals.
    pub avg_wait_hours: f64,
    /// Completions the average was taken over.
    pub wait_sample: usize,
}

/// Mean creation-to-reply time in hours, rounded to two decimals. Zero for no orders.
pub fn average_wait_hours(completed: &[Order]) -> f64 {
    let waits: Vec<f64> = completed
        .iter()
        .filter_map(|o| o.replied_at().map(|at| at - o.created_at()))
        .map(|wait| wait.num_seconds() as f64 / 3600.0)
        .collect();
    if waits.is_empty() {
        return 0.0;
    }
    let mean = waits.iter().sum::<f64>() / waits.len() as f64;
    (mean * 100.0).round() / 100.0
}

pub trait ReportStore: Send + Sync + 'static {
    fn put(&self, report: &QueueReport) -> Result<(), StoreError>;

    fn latest(&self) -> Result<Option<QueueReport>, StoreError>;

    /// Drop reports generated before `cutoff`.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

impl<S> ReportStore for Arc<S>
where
    S: ReportStore + ?Sized,
{
    fn put(&self, report: &QueueReport) -> Result<(), StoreError> {
        (**self).put(report)
    }

    fn latest(&self) -> Result<Option<QueueReport>, StoreError> {
        (**self).latest()
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).purge_before(cutoff)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    reports: Mutex<Vec<QueueReport>>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportStore for InMemoryReportStore {
    fn put(&self, report: &QueueReport) -> Result<(), StoreError> {
        let mut reports = self.reports.lock().map_err(|_| StoreError::poisoned("reports"))?;
        reports.push(report.clone());
        Ok(())
    }

    fn latest(&self) -> Result<Option<QueueReport>, StoreError> {
        let reports = self.reports.lock().map_err(|_| StoreError::poisoned("reports"))?;
        Ok(reports.iter().max_by_key(|r| r.generated_at).cloned())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut reports = self.reports.lock().map_err(|_| StoreError::poisoned("reports"))?;
        let before = reports.len();
        reports.retain(|r| r.generated_at >= cutoff);
        Ok(before - reports.len())
    }
}

/// Builds, stores and ages out queue reports.
pub struct QueueReporter {
    orders: Arc<dyn OrderStore>,
    reports: Arc<dyn ReportStore>,
    index: Arc<PriorityIndex>,
    clock: Arc<dyn Clock>,
    config: Arc<PipelineConfig>,
}

impl QueueReporter {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            orders: ctx.orders.clone(),
            reports: ctx.reports.clone(),
            index: ctx.index.clone(),
            clock: ctx.clock.clone(),
            config: ctx.config.clone(),
        }
    }

    pub fn generate(&self) -> Result<QueueReport, QueueError> {
        let now = self.clock.now();
        let since = now - Duration::days(self.config.report.wait_window_days);
        let completed = self
            .orders
            .recently_completed(since, self.config.report.wait_sample_size)?;

        let report = QueueReport {
            generated_at: now,
            queue_length: self.index.len(),
            order_stats: self.orders.count_by_status()?,
            avg_wait_hours: average_wait_hours(&completed),
            wait_sample: completed.len(),
        };
        self.reports.put(&report)?;

        let purged = self.reports.purge_before(now - self.config.report_retention())?;
        if purged > 0 {
            debug!(purged, "expired queue reports dropped");
        }
        info!(
            queue_length = report.queue_length,
            avg_wait_hours = report.avg_wait_hours,
            wait_sample = report.wait_sample,
            "queue report generated"
        );
        Ok(report)
    }
}
