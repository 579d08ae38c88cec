use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Short keyword summary of an order's text.
///
/// Always non-empty and at most [`crate::MAX_KEYWORD_CHARS`] characters; build
/// one through [`crate::clean_keyword`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keyword(String);

impl Keyword {
    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for Keyword {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Keyword {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why a summarize call did not produce a keyword.
///
/// The retry scheduler branches on the variant:
/// - `RateLimited`: upstream asked us to slow down; reschedule without spending a retry.
/// - `Transient`: worth retrying with backoff.
/// - `Permanent`: retrying cannot help; dead-letter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FailureKind {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Permanent(_))
    }
}

/// One external summarization call.
///
/// Implementations must not retry internally; the caller owns retry policy.
pub trait Summarizer: Send + Sync + 'static {
    fn summarize(&self, text: &str) -> Result<Keyword, FailureKind>;
}

impl<S> Summarizer for Arc<S>
where
    S: Summarizer + ?Sized,
{
    fn summarize(&self, text: &str) -> Result<Keyword, FailureKind> {
        (**self).summarize(text)
    }
}
