//! Per-caller budget for position simulations (rolling window).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use augur_core::OwnerId;

#[derive(Debug)]
pub struct SimulationQuota {
    max_per_window: usize,
    window: Duration,
    hits: Mutex<HashMap<OwnerId, VecDeque<DateTime<Utc>>>>,
}

impl SimulationQuota {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window as usize,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record one query for `caller`, or return how long until one is allowed.
    pub fn check(&self, caller: OwnerId, now: DateTime<Utc>) -> Result<(), Duration> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let recent = hits.entry(caller).or_default();

        let horizon = now - self.window;
        while recent.front().is_some_and(|t| *t <= horizon) {
            recent.pop_front();
        }

        if recent.len() >= self.max_per_window {
            let retry_after = recent
                .front()
                .map(|oldest| *oldest + self.window - now)
                .unwrap_or(self.window);
            return Err(retry_after.max(Duration::zero()));
        }

        recent.push_back(now);
        Ok(())
    }

    /// Forget callers with no hits inside the window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let horizon = now - self.window;
        let before = hits.len();
        hits.retain(|_, recent| recent.back().is_some_and(|t| *t > horizon));
        before - hits.len()
    }
}
