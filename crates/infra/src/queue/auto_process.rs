//! Automatic pickup of the queue head.
//!
//! When the operator switch is on, the top-ranked order moves from `Queued`
//! to `Processing`. At most one order is started per run, and nothing happens
//! while the head is already being processed.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use augur_core::{Clock, OrderId};
use augur_orders::{OrderCommand, OrderStatus, StartProcessing};

use super::index::PriorityIndex;
use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::orders::{Dispatched, OrderDispatcher};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "order_id", rename_all = "snake_case")]
pub enum AutoProcessOutcome {
    Disabled,
    EmptyQueue,
    AlreadyProcessing(OrderId),
    Started(OrderId),
    /// The ranked head is gone or no longer active; the next rebuild drops it.
    StaleHead(OrderId),
}

pub struct AutoProcessor {
    settings: Arc<dyn SettingsStore>,
    index: Arc<PriorityIndex>,
    clock: Arc<dyn Clock>,
    dispatcher: OrderDispatcher,
}

impl AutoProcessor {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            settings: ctx.settings.clone(),
            index: ctx.index.clone(),
            clock: ctx.clock.clone(),
            dispatcher: ctx.dispatcher(),
        }
    }

    pub fn run(&self) -> Result<AutoProcessOutcome, QueueError> {
        if !self.settings.load()?.is_enabled {
            info!("queue disabled, skipping auto processing");
            return Ok(AutoProcessOutcome::Disabled);
        }

        let Some(order_id) = self.index.snapshot().order_ids().next() else {
            return Ok(AutoProcessOutcome::EmptyQueue);
        };

        let now = self.clock.now();
        let started = self.dispatcher.dispatch_if(order_id, |order| {
            (order.status() == OrderStatus::Queued).then(|| {
                OrderCommand::StartProcessing(StartProcessing {
                    order_id,
                    occurred_at: now,
                })
            })
        });

        match started {
            Ok(Dispatched::Applied(..)) => {
                info!(order_id = %order_id, "queue head moved to processing");
                Ok(AutoProcessOutcome::Started(order_id))
            }
            Ok(Dispatched::Declined(order)) if order.status() == OrderStatus::Processing => {
                Ok(AutoProcessOutcome::AlreadyProcessing(order_id))
            }
            Ok(Dispatched::Declined(order)) => {
                warn!(order_id = %order_id, status = %order.status(), "ranked head is no longer queued");
                Ok(AutoProcessOutcome::StaleHead(order_id))
            }
            Err(QueueError::NotFound) => {
                warn!(order_id = %order_id, "ranked head not found in the order store");
                Ok(AutoProcessOutcome::StaleHead(order_id))
            }
            Err(e) => Err(e),
        }
    }
}
