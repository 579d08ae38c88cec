//! Infrastructure and service error taxonomy.

use chrono::Duration;
use thiserror::Error;

use augur_ai::{CounterError, FailureKind};
use augur_core::DomainError;

use crate::config::ConfigError;

/// Errors returned by store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Stale write (optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Storage(format!("{what} lock poisoned"))
    }
}

/// Errors surfaced to `QueueService` callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded, retry after {}s", .retry_after.num_seconds())]
    RateLimitExceeded { retry_after: Duration },

    #[error("enrichment service unavailable: {0}")]
    TransientService(String),

    #[error("enrichment service rejected the request: {0}")]
    PermanentService(String),

    #[error("order not found")]
    NotFound,

    /// The order exists but is not Queued/Processing.
    #[error("order is not in the queue")]
    NotInQueue,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("modification limit reached ({limit} edits allowed)")]
    ModificationLimitReached { limit: u32 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Failures while wiring the pipeline at startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Counters(#[from] CounterError),

    #[error("model client setup failed: {0}")]
    Client(#[from] FailureKind),
}

impl From<DomainError> for QueueError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => QueueError::Validation(msg),
            DomainError::InvariantViolation(msg) | DomainError::InvalidTransition(msg) => {
                QueueError::InvalidState(msg)
            }
            DomainError::ModificationLimitReached { limit } => {
                QueueError::ModificationLimitReached { limit }
            }
            DomainError::NotFound => QueueError::NotFound,
            DomainError::Conflict(msg) => QueueError::Conflict(msg),
        }
    }
}

impl From<StoreError> for QueueError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => QueueError::NotFound,
            StoreError::Conflict(msg) | StoreError::AlreadyExists(msg) => QueueError::Conflict(msg),
            StoreError::Storage(msg) => QueueError::Storage(msg),
        }
    }
}

impl From<CounterError> for StoreError {
    fn from(value: CounterError) -> Self {
        StoreError::Storage(value.0)
    }
}

impl From<CounterError> for QueueError {
    fn from(value: CounterError) -> Self {
        QueueError::Storage(value.to_string())
    }
}

impl From<FailureKind> for QueueError {
    fn from(value: FailureKind) -> Self {
        match value {
            FailureKind::RateLimited { retry_after } => QueueError::RateLimitExceeded {
                retry_after: retry_after.unwrap_or_else(Duration::zero),
            },
            FailureKind::Transient(msg) => QueueError::TransientService(msg),
            FailureKind::Permanent(msg) => QueueError::PermanentService(msg),
        }
    }
}
