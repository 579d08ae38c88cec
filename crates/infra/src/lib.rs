//! Infrastructure layer: stores, ranking, enrichment scheduling, background ticks.
//!
//! Everything is wired through a [`PipelineContext`]; [`QueueService`] is the
//! synchronous entry point, [`workers::Workers`] runs the periodic tasks.

pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod orders;
pub mod postgres;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_counters;
pub mod service;
pub mod settings;
pub mod sweeper;
pub mod workers;

pub use config::{ConfigError, PipelineConfig, StorageBackend, StorageConfig};
pub use context::{PipelineContext, StoreSet};
pub use error::{QueueError, SetupError, StoreError};
pub use service::{ModificationReceipt, PipelineStats, QueueService};
pub use settings::{InMemorySettingsStore, QueueSettings, SettingsStore, SettingsUpdate};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use workers::{TickTask, WorkerHandle, Workers};
