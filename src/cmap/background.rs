//! The pool's background maintenance task (§4.C: "a background thread ... closes connections
//! that have been idle ... and tops the pool up to `min_pool_size`").

use std::{sync::Arc, sync::Weak, time::Duration};

use crate::{cmap::ConnectionPool, runtime::Interval, RUNTIME};

const DEFAULT_MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(60_000);

/// Spawns the maintenance loop for `pool`. Holds only a [`Weak`] reference so the background
/// task doesn't keep the pool (and its server) alive after the topology drops it.
pub(crate) fn start(pool: &Arc<ConnectionPool>) {
    let weak = Arc::downgrade(pool);
    RUNTIME.spawn(run(weak));
}

async fn run(pool: Weak<ConnectionPool>) {
    let mut interval = Interval::new(DEFAULT_MAINTENANCE_FREQUENCY);
    loop {
        interval.tick().await;
        match pool.upgrade() {
            Some(pool) => pool.do_maintenance().await,
            None => return,
        }
    }
}
