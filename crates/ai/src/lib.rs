//! `augur-ai`
//!
//! **Responsibility:** enrichment boundary for the external text model.
//!
//! This crate does not know about orders or jobs:
//! - It turns free text into a short [`Keyword`] or a classified [`FailureKind`].
//! - It owns the model wire format and the HTTP client.
//! - It budgets outbound calls through a dual-window [`RateLimiter`].
//!
//! Retrying, scheduling and persistence live in `augur-infra`.

pub mod client;
pub mod health;
pub mod keyword;
pub mod rate_limit;
pub mod result;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;
pub mod single_flight;

pub use client::{classify_response, ClientConfig, HttpSummarizer};
pub use health::{check_health, SummarizerHealth, HEALTH_CHECK_TEXT};
pub use keyword::{clean_keyword, prepare_text, MAX_INPUT_CHARS, MAX_KEYWORD_CHARS};
pub use rate_limit::{
    AcquireOutcome, CounterError, CounterSlot, CounterStatus, CounterStore, InMemoryCounterStore, RateDecision,
    RateLimitStatus, RateLimiter, RateLimits, WindowStatus,
};
pub use result::{FailureKind, Keyword, Summarizer};
#[cfg(any(test, feature = "test-support"))]
pub use scripted::ScriptedSummarizer;
pub use single_flight::SingleFlight;
