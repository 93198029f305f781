use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Ticks on a fixed period, matching §4.D's `heartbeat_frequency_ms` sleep and §4.C's pool
/// maintenance sweep: `sleep for the period minus elapsed, never less than the floor`.
pub(crate) struct Interval {
    inner: tokio::time::Interval,
}

impl Interval {
    pub(crate) fn new(period: Duration) -> Self {
        let mut inner = tokio::time::interval(period);
        // A slow tick (e.g. after the process is suspended) should not cause a burst of
        // immediate catch-up ticks; the monitor only ever wants "as soon as possible, once".
        inner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { inner }
    }

    pub(crate) async fn tick(&mut self) -> Instant {
        self.inner.tick().await
    }
}
