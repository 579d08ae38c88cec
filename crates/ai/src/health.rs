//! End-to-end check of the summarizer.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rate_limit::{RateDecision, RateLimitStatus, RateLimiter};
use crate::result::Summarizer;

/// Fixed input so that successive checks are comparable.
pub const HEALTH_CHECK_TEXT: &str =
    "A short sample question, used only to check that keyword generation works.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummarizerHealth {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds, two decimals. Absent when no call was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_secs: Option<f64>,
    /// Budget after the check; absent when the counters could not be read.
    pub rate_limit_status: Option<RateLimitStatus>,
}

/// Run one budgeted call on [`HEALTH_CHECK_TEXT`].
///
/// The call counts against the same budget as real enrichment. A denied or
/// failed budget check is reported without calling the model.
pub fn check_health(summarizer: &dyn Summarizer, limiter: &RateLimiter, now: DateTime<Utc>) -> SummarizerHealth {
    let mut health = SummarizerHealth {
        success: false,
        keyword: None,
        error: None,
        response_time_secs: None,
        rate_limit_status: None,
    };

    match limiter.allow(now) {
        Ok(RateDecision::Allowed) => {
            let started = Instant::now();
            let result = summarizer.summarize(HEALTH_CHECK_TEXT);
            let elapsed = started.elapsed().as_secs_f64();
            health.response_time_secs = Some((elapsed * 100.0).round() / 100.0);
            match result {
                Ok(keyword) => {
                    health.success = true;
                    health.keyword = Some(keyword.as_str().to_string());
                }
                Err(kind) => health.error = Some(kind.to_string()),
            }
        }
        Ok(RateDecision::Denied { retry_after }) => {
            health.error = Some(format!(
                "call budget exhausted, retry after {}s",
                retry_after.num_seconds()
            ));
        }
        Err(e) => health.error = Some(e.to_string()),
    }

    match limiter.status(now) {
        Ok(status) => health.rate_limit_status = Some(status),
        Err(e) => tracing::warn!(error = %e, "rate limit status unavailable for health check"),
    }
    tracing::info!(success = health.success, response_time_secs = ?health.response_time_secs, "summarizer health checked");
    health
}
