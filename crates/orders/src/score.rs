//! Priority scoring.
//!
//! `score = normalized_amount × (urgent ? 2 : 1) × (1 + age_hours × 0.1)`
//!
//! Older, larger, urgent orders rank higher. The score depends on `now`, so a
//! ranking computed at one instant drifts; the queue index rebuilds
//! periodically to absorb that.

use chrono::{DateTime, Utc};

pub const URGENT_MULTIPLIER: f64 = 2.0;

/// Score growth per hour waited, relative to the base.
pub const AGE_FACTOR_PER_HOUR: f64 = 0.1;

/// Fractional hours between `created_at` and `now`, clamped at zero.
pub fn age_hours(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - created_at).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}

pub fn priority_score(
    normalized_amount: f64,
    urgent: bool,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let multiplier = if urgent { URGENT_MULTIPLIER } else { 1.0 };
    normalized_amount * multiplier * (1.0 + age_hours(created_at, now) * AGE_FACTOR_PER_HOUR)
}
