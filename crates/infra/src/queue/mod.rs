//! Priority ranking of active orders.
//!
//! - `PriorityIndex`: the live, swappable ranking
//! - `IndexRebuilder`: periodic full recomputation from the order store
//! - `SimulationQuota`: per-caller budget for "where would I land" queries
//! - `QueueReporter`: periodic status counts and wait estimate
//! - `AutoProcessor`: moves the queue head to processing

pub mod auto_process;
pub mod index;
pub mod rebuild;
pub mod report;
pub mod simulation;

pub use auto_process::{AutoProcessOutcome, AutoProcessor};

pub use index::{simulated_slot, PriorityIndex, RankedEntry, RankedQueue, RebuildTicket};
pub use rebuild::{IndexRebuilder, RebuildReport};
pub use report::{average_wait_hours, InMemoryReportStore, QueueReport, QueueReporter, ReportStore};
pub use simulation::SimulationQuota;
