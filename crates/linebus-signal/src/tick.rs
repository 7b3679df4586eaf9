//! ---
//! lb_section: "02-signal-bus"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "Station signal bus: model, wire codec, and socket managers."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Fixed-period tick source for the manager loops.
///
/// A late tick delays the schedule instead of bursting to catch up, so a slow
/// connect phase never causes back-to-back broadcasts.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub(crate) fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub(crate) async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_are_spaced_by_period() {
        let mut limiter = RateLimiter::new(Duration::from_millis(20));
        let first = limiter.tick().await;
        let second = limiter.tick().await;
        assert!(second.duration_since(first) >= Duration::from_millis(15));
    }
}
