//! The per-server connection pool (§3 `Pool`, §4.C).

pub(crate) mod conn;
mod options;
mod status;
mod wait_queue;

pub(crate) mod background;

pub use options::ConnectionPoolOptions;
pub(crate) use status::PoolGenerationSubscriber;

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::{Mutex, Notify};

use crate::{
    cmap::conn::Connection,
    error::{ErrorKind, Result},
    event::{
        cmap::{
            ConnectionCheckedInEvent, ConnectionCheckedOutEvent, ConnectionCheckoutFailedEvent,
            ConnectionCheckoutFailedReason, ConnectionCheckoutStartedEvent, ConnectionClosedEvent,
            ConnectionClosedReason, ConnectionCreatedEvent, ConnectionReadyEvent, PoolClearedEvent,
            PoolClosedEvent, PoolCreatedEvent, PoolReadyEvent,
        },
        EventBus,
    },
    options::ServerAddress,
};

/// The pool's generation counter (§4.C `generation`). A non-load-balanced pool has a single
/// counter shared by every connection; a load-balanced one keeps a separate counter per backend
/// `service_id` so clearing one backend's connections never invalidates another's (§9 Open
/// Question 1: "load-balanced mode... clears only matching `service_id`").
#[derive(Debug, Clone)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<u32, u32>),
}

impl PoolGeneration {
    /// The generation a connection for `service_id` should be compared against. `service_id` is
    /// ignored in `Normal` mode; in `LoadBalanced` mode a backend that's never been cleared is
    /// implicitly generation 0.
    pub(crate) fn value_for(&self, service_id: Option<u32>) -> u32 {
        match self {
            PoolGeneration::Normal(gen) => *gen,
            PoolGeneration::LoadBalanced(by_service) => service_id.and_then(|id| by_service.get(&id).copied()).unwrap_or(0),
        }
    }

    /// Bumps the generation for `service_id` (`clear`'s `None` always means "the whole pool").
    /// Returns whether this clear applies pool-wide and should therefore pause checkout until
    /// `ready()` is called again — true for `Normal`, false for a service-scoped `LoadBalanced`
    /// bump, since that only ever affects one backend behind the balancer.
    fn bump(&mut self, service_id: Option<u32>) -> bool {
        match self {
            PoolGeneration::Normal(gen) => {
                *gen += 1;
                true
            }
            PoolGeneration::LoadBalanced(by_service) => {
                if let Some(id) = service_id {
                    *by_service.entry(id).or_insert(0) += 1;
                }
                false
            }
        }
    }
}

/// Mutable pool bookkeeping guarded by a single lock. `total` is always `available.len() +
/// in_use + pending`, the invariant named in §4.C.
struct PoolState {
    available: VecDeque<Connection>,
    total: u32,
    pending: u32,
    in_use: u32,
    generation: PoolGeneration,
    /// Set by `clear` when the pool is paused (CSFLE/load-balanced rolling clear, §4.C); while
    /// set, checkout fails fast instead of creating new connections.
    cleared: bool,
}

/// A server's connection pool. One instance lives per member of the topology for the lifetime
/// of the client (§3 `Pool`).
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    options: ConnectionPoolOptions,
    state: Mutex<PoolState>,
    wait_queue: wait_queue::WaitQueue,
    /// Notified whenever a connection is checked back in or a pending creation finishes, so a
    /// waiter blocked because the pool was at `max_pool_size` can recheck.
    checkin_notify: Notify,
    generation_publisher: status::PoolGenerationPublisher,
    generation_subscriber: status::PoolGenerationSubscriber,
    events: Option<EventBus>,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: ConnectionPoolOptions, events: Option<EventBus>) -> Arc<Self> {
        let (generation_publisher, generation_subscriber) = status::channel();
        generation_publisher.publish_ready(true);

        if let Some(events) = &events {
            events.cmap(PoolCreatedEvent { address: address.clone() });
            events.cmap(PoolReadyEvent { address: address.clone() });
        }

        let generation = if options.load_balanced {
            PoolGeneration::LoadBalanced(HashMap::new())
        } else {
            PoolGeneration::Normal(0)
        };

        Arc::new(Self {
            wait_queue: wait_queue::WaitQueue::new(address.clone(), options.max_pool_size()),
            address,
            options,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                total: 0,
                pending: 0,
                in_use: 0,
                generation,
                cleared: false,
            }),
            checkin_notify: Notify::new(),
            generation_publisher,
            generation_subscriber,
            events,
        })
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn generation_subscriber(&self) -> status::PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }

    /// Checks a connection out, creating one if the pool isn't at `max_pool_size` and none is
    /// available, or waiting in FIFO order otherwise (§4.C `checkout`).
    pub(crate) async fn checkout(&self) -> Result<Connection> {
        if let Some(events) = &self.events {
            events.cmap(ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            });
        }

        match self.checkout_inner().await {
            Ok(conn) => {
                if let Some(events) = &self.events {
                    events.cmap(ConnectionCheckedOutEvent {
                        address: self.address.clone(),
                        connection_id: conn.id,
                    });
                }
                Ok(conn)
            }
            Err(err) => {
                if let Some(events) = &self.events {
                    let reason = if matches!(*err.kind, ErrorKind::WaitQueueTimeout { .. }) {
                        ConnectionCheckoutFailedReason::Timeout
                    } else if matches!(*err.kind, ErrorKind::ConnectionPoolCleared { .. }) {
                        ConnectionCheckoutFailedReason::PoolClosed
                    } else {
                        ConnectionCheckoutFailedReason::ConnectionError
                    };
                    events.cmap(ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                    });
                }
                Err(err)
            }
        }
    }

    async fn checkout_inner(&self) -> Result<Connection> {
        let timeout = self.options.wait_queue_timeout;
        let permit = self.wait_queue.wait_for_turn(timeout).await?;

        loop {
            {
                let mut state = self.state.lock().await;
                if state.cleared {
                    return Err(ErrorKind::ConnectionPoolCleared {
                        address: self.address.clone(),
                        message: "pool is paused".to_string(),
                    }
                    .into());
                }

                if let Some(mut conn) = self.pop_reusable(&mut state) {
                    conn.mark_checked_out();
                    state.in_use += 1;
                    drop(state);
                    drop(permit);
                    return Ok(conn);
                }

                if state.total < self.options.max_pool_size() && state.pending < self.options.max_connecting() {
                    state.total += 1;
                    state.pending += 1;
                    let generation = state.generation.clone();
                    drop(state);

                    let result = Connection::establish(
                        self.address.clone(),
                        generation,
                        self.options.connect_timeout,
                        self.options.app_name.as_deref(),
                    )
                    .await;

                    let mut state = self.state.lock().await;
                    state.pending -= 1;
                    match result {
                        Ok((mut conn, _server_description)) => {
                            if let Some(events) = &self.events {
                                events.cmap(ConnectionCreatedEvent {
                                    address: self.address.clone(),
                                    connection_id: conn.id,
                                });
                                events.cmap(ConnectionReadyEvent {
                                    address: self.address.clone(),
                                    connection_id: conn.id,
                                });
                            }
                            conn.mark_checked_out();
                            state.in_use += 1;
                            drop(state);
                            drop(permit);
                            return Ok(conn);
                        }
                        Err(err) => {
                            state.total -= 1;
                            drop(state);
                            drop(permit);
                            return Err(err);
                        }
                    }
                }
            }

            // Pool is at capacity with nothing to reuse: wait for a checkin or a pending
            // creation to finish, then loop back around and recheck (still holding `permit`,
            // which keeps this waiter's place in line ahead of anyone still queued behind it).
            let notified = self.checkin_notify.notified();
            match timeout {
                Some(timeout) => {
                    if crate::RUNTIME.timeout(timeout, async { notified.await; Ok(()) }).await.is_err() {
                        return Err(ErrorKind::WaitQueueTimeout {
                            address: self.address.clone(),
                        }
                        .into());
                    }
                }
                None => notified.await,
            }
        }
    }

    fn pop_reusable(&self, state: &mut PoolState) -> Option<Connection> {
        while let Some(mut conn) = state.available.pop_front() {
            if conn.is_stale(&state.generation) {
                state.total -= 1;
                self.emit_closed(conn.id, ConnectionClosedReason::Stale);
                continue;
            }
            if conn.is_idle(self.options.max_idle_time) {
                state.total -= 1;
                self.emit_closed(conn.id, ConnectionClosedReason::Idle);
                continue;
            }
            conn.mark_checked_out();
            return Some(conn);
        }
        None
    }

    /// Returns a connection to the pool, or discards it if it's closed or stale (§4.C
    /// `checkin`).
    pub(crate) async fn checkin(&self, mut conn: Connection) {
        let mut state = self.state.lock().await;
        state.in_use = state.in_use.saturating_sub(1);

        if conn.is_closed() {
            state.total -= 1;
            drop(state);
            self.emit_closed(conn.id, ConnectionClosedReason::Error);
        } else if conn.is_stale(&state.generation) {
            state.total -= 1;
            drop(state);
            self.emit_closed(conn.id, ConnectionClosedReason::Stale);
        } else {
            conn.mark_checked_in();
            let connection_id = conn.id;
            state.available.push_back(conn);
            drop(state);
            if let Some(events) = &self.events {
                events.cmap(ConnectionCheckedInEvent {
                    address: self.address.clone(),
                    connection_id,
                });
            }
        }

        self.checkin_notify.notify_waiters();
    }

    /// Invalidates every connection checked out before now by bumping the pool's generation
    /// (§4.C `clear`). Connections already available are dropped immediately; in-use ones are
    /// discarded on their next checkin instead of being reused.
    ///
    /// Returns whether this clear affects the whole pool (`service_id` was `None`) as opposed to
    /// a single backend behind a load balancer — the caller uses this to decide whether to also
    /// `pause()` the pool (§9 Open Question 1: a service-scoped clear must not halt checkout for
    /// every other backend sharing this pool).
    pub(crate) async fn clear(&self, service_id: Option<u32>) -> bool {
        let mut state = self.state.lock().await;
        let pool_wide = state.generation.bump(service_id);

        // A pool backing a load-balanced deployment only clears the connections for the given
        // `service_id`'s backend (§9.1 load-balanced mode); a non-load-balanced pool has no
        // per-service connections, so `service_id` is ignored there.
        let stale: Vec<Connection> = if service_id.is_some() {
            let mut kept = VecDeque::new();
            let mut stale = Vec::new();
            while let Some(conn) = state.available.pop_front() {
                if conn.service_id == service_id {
                    stale.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            state.available = kept;
            stale
        } else {
            state.available.drain(..).collect()
        };
        state.total -= stale.len() as u32;

        self.generation_publisher.publish_generation(state.generation.value_for(service_id));
        drop(state);

        for conn in stale {
            self.emit_closed(conn.id, ConnectionClosedReason::Stale);
        }

        if let Some(events) = &self.events {
            events.cmap(PoolClearedEvent {
                address: self.address.clone(),
                service_id,
            });
        }

        self.checkin_notify.notify_waiters();

        pool_wide
    }

    /// Marks the pool ready again after a `clear` (§3 `Pool::ready`), letting checkout create
    /// connections once the monitor has re-confirmed the server.
    pub(crate) async fn mark_ready(&self) {
        let mut state = self.state.lock().await;
        state.cleared = false;
        drop(state);
        self.generation_publisher.publish_ready(true);
        if let Some(events) = &self.events {
            events.cmap(PoolReadyEvent {
                address: self.address.clone(),
            });
        }
    }

    /// Pauses the pool: checkout fails immediately instead of creating connections, until
    /// `mark_ready` is called again.
    pub(crate) async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.cleared = true;
        drop(state);
        self.generation_publisher.publish_ready(false);
    }

    /// Drops every connection and makes the pool permanently unusable (§4.C `close`).
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.cleared = true;
        let drained: Vec<Connection> = state.available.drain(..).collect();
        state.total -= drained.len() as u32;
        drop(state);

        for conn in drained {
            self.emit_closed(conn.id, ConnectionClosedReason::PoolClosed);
        }

        self.checkin_notify.notify_waiters();

        if let Some(events) = &self.events {
            events.cmap(PoolClosedEvent {
                address: self.address.clone(),
            });
        }
    }

    fn emit_closed(&self, connection_id: u32, reason: ConnectionClosedReason) {
        if let Some(events) = &self.events {
            events.cmap(ConnectionClosedEvent {
                address: self.address.clone(),
                connection_id,
                reason,
            });
        }
    }

    /// Reaps idle connections and tops the pool up to `min_pool_size`, run periodically by
    /// [`background`] (§4.C "background thread").
    pub(crate) async fn do_maintenance(&self) {
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.cleared {
                return;
            }
            let mut kept = VecDeque::new();
            while let Some(conn) = state.available.pop_front() {
                if conn.is_stale(&state.generation) {
                    state.total -= 1;
                    to_close.push((conn.id, ConnectionClosedReason::Stale));
                } else if conn.is_idle(self.options.max_idle_time) {
                    state.total -= 1;
                    to_close.push((conn.id, ConnectionClosedReason::Idle));
                } else {
                    kept.push_back(conn);
                }
            }
            state.available = kept;
        }
        for (connection_id, reason) in to_close {
            self.emit_closed(connection_id, reason);
        }

        let min_size = match self.options.min_pool_size {
            Some(min) if min > 0 => min,
            _ => return,
        };

        loop {
            let (should_create, generation) = {
                let state = self.state.lock().await;
                if state.total >= min_size || state.pending >= self.options.max_connecting() {
                    (false, state.generation.clone())
                } else {
                    (true, state.generation.clone())
                }
            };
            if !should_create {
                return;
            }

            {
                let mut state = self.state.lock().await;
                if state.total >= min_size || state.pending >= self.options.max_connecting() {
                    return;
                }
                state.total += 1;
                state.pending += 1;
            }

            let result = Connection::establish(
                self.address.clone(),
                generation,
                self.options.connect_timeout,
                self.options.app_name.as_deref(),
            )
            .await;

            let mut state = self.state.lock().await;
            state.pending -= 1;
            match result {
                Ok((conn, _)) => {
                    if conn.is_stale(&state.generation) {
                        state.total -= 1;
                        continue;
                    }
                    if let Some(events) = &self.events {
                        events.cmap(ConnectionCreatedEvent {
                            address: self.address.clone(),
                            connection_id: conn.id,
                        });
                        events.cmap(ConnectionReadyEvent {
                            address: self.address.clone(),
                            connection_id: conn.id,
                        });
                    }
                    state.available.push_back(conn);
                }
                Err(_) => {
                    state.total -= 1;
                    // The next monitor heartbeat will notice the server is down and clear the
                    // pool; min-size top-up just backs off until then rather than retrying in a
                    // tight loop.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool_options(max_pool_size: u32) -> ConnectionPoolOptions {
        ConnectionPoolOptions::builder().max_pool_size(Some(max_pool_size)).build()
    }

    fn load_balanced_pool_options(max_pool_size: u32) -> ConnectionPoolOptions {
        ConnectionPoolOptions::builder()
            .max_pool_size(Some(max_pool_size))
            .load_balanced(true)
            .build()
    }

    /// Pushes `n` already-handshaken connections straight into `available`, bypassing
    /// `Connection::establish` (and thus any real socket) the way a pool restored from a
    /// warm-start snapshot would.
    async fn seed_available(pool: &ConnectionPool, n: u32) {
        let mut state = pool.state.lock().await;
        let generation = state.generation.value_for(None);
        for _ in 0..n {
            state.available.push_back(Connection::new_for_test(pool.address.clone(), generation, 17));
            state.total += 1;
        }
    }

    /// Testable property #1 (§8): `total = available + in_use + pending` holds across a
    /// checkout/checkin cycle.
    #[tokio::test]
    async fn checkout_and_checkin_preserve_the_total_invariant() {
        let pool = ConnectionPool::new(ServerAddress::parse("a:27017").unwrap(), pool_options(2), None);
        seed_available(&pool, 2).await;

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();

        {
            let state = pool.state.lock().await;
            assert_eq!(state.total, state.available.len() as u32 + state.in_use + state.pending);
            assert_eq!(state.in_use, 2);
        }

        pool.checkin(a).await;
        pool.checkin(b).await;

        let state = pool.state.lock().await;
        assert_eq!(state.total, state.available.len() as u32 + state.in_use + state.pending);
        assert_eq!(state.available.len(), 2);
    }

    /// §4.C `clear`: generation bumps, every available connection is dropped immediately.
    #[tokio::test]
    async fn clear_bumps_generation_and_drops_available_connections() {
        let pool = ConnectionPool::new(ServerAddress::parse("a:27017").unwrap(), pool_options(5), None);
        seed_available(&pool, 3).await;

        let pool_wide = pool.clear(None).await;

        assert!(pool_wide);
        let state = pool.state.lock().await;
        assert_eq!(state.generation.value_for(None), 1);
        assert_eq!(state.available.len(), 0);
        assert_eq!(state.total, 0);
    }

    /// §4.C `checkin`: a connection from a generation that's been superseded by a `clear` in the
    /// meantime is discarded instead of being reused (S5 in §8 relies on this).
    #[tokio::test]
    async fn checkin_discards_a_connection_from_a_stale_generation() {
        let address = ServerAddress::parse("a:27017").unwrap();
        let pool = ConnectionPool::new(address.clone(), pool_options(5), None);
        let conn = Connection::new_for_test(address, 0, 17);
        {
            let mut state = pool.state.lock().await;
            state.total += 1;
            state.in_use += 1;
        }

        pool.clear(None).await; // bumps generation to 1; `conn` is still generation 0.
        pool.checkin(conn).await;

        let state = pool.state.lock().await;
        assert_eq!(state.available.len(), 0);
        assert_eq!(state.total, 0);
    }

    /// A service-scoped `clear` (load-balanced mode, §9 Open Question 1) only drops connections
    /// for the matching `service_id`, leaving the rest of the pool untouched.
    #[tokio::test]
    async fn service_scoped_clear_only_drops_matching_connections() {
        let address = ServerAddress::parse("a:27017").unwrap();
        let pool = ConnectionPool::new(address.clone(), load_balanced_pool_options(5), None);
        {
            let mut state = pool.state.lock().await;
            let mut a = Connection::new_for_test(address.clone(), 0, 17);
            a.service_id = Some(1);
            let mut b = Connection::new_for_test(address.clone(), 0, 17);
            b.service_id = Some(2);
            state.available.push_back(a);
            state.available.push_back(b);
            state.total += 2;
        }

        let pool_wide = pool.clear(Some(1)).await;

        assert!(!pool_wide);
        let state = pool.state.lock().await;
        assert_eq!(state.available.len(), 1);
        assert_eq!(state.available[0].service_id, Some(2));
        assert_eq!(state.total, 1);
    }

    /// The bug this guards against: a service-scoped `clear` must only bump *that* service's
    /// generation. An in-use connection for an unrelated `service_id` that gets checked in
    /// afterwards must not be discarded as stale — only a connection for the cleared service
    /// should be (§9 Open Question 1; `PoolGeneration::LoadBalanced` keyed by `service_id`).
    #[tokio::test]
    async fn load_balanced_clear_only_invalidates_the_cleared_services_generation() {
        let address = ServerAddress::parse("a:27017").unwrap();
        let pool = ConnectionPool::new(address.clone(), load_balanced_pool_options(5), None);

        let mut conn_for_service_1 = Connection::new_for_test(address.clone(), 0, 17);
        conn_for_service_1.service_id = Some(1);
        let mut conn_for_service_2 = Connection::new_for_test(address.clone(), 0, 17);
        conn_for_service_2.service_id = Some(2);
        {
            let mut state = pool.state.lock().await;
            state.total += 2;
            state.in_use += 2;
        }

        let pool_wide = pool.clear(Some(1)).await;
        assert!(!pool_wide);

        pool.checkin(conn_for_service_1).await;
        pool.checkin(conn_for_service_2).await;

        let state = pool.state.lock().await;
        assert_eq!(state.available.len(), 1);
        assert_eq!(state.available[0].service_id, Some(2));
        // The service-1 connection was discarded as stale, the service-2 one wasn't.
        assert_eq!(state.total, 1);
    }
}
