//! Enrichment jobs with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `EnrichmentJob`: one summarization attempt chain per order
//! - `JobStore`: job persistence, one active job per order
//! - `DeadLetterStore`: bounded store of jobs that could not complete
//! - `RetryScheduler`: dispatch ticks, dead-letter replay and cleanup

pub mod scheduler;
pub mod store;
pub mod types;

pub use scheduler::{CleanupReport, DispatchReport, ReplayReport, RetryScheduler};
pub use store::{DeadLetterStore, InMemoryDeadLetterStore, InMemoryJobStore, JobStats, JobStore};
pub use types::{DeadLetterEntry, EnrichmentJob, FailureClass, JobStatus, RetryPolicy};
