//! The `Topology` coordinator (§4.E): owns the single [`TopologyDescription`], one
//! [`ConnectionPool`] per known server, and the monitor for each — and serializes every mutation
//! behind one lock so the selector (§4.F) and executor (§4.I) always see a consistent snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant},
};

use bson::Document;
use uuid::Uuid;

use crate::{
    cmap::{background, ConnectionPool, ConnectionPoolOptions},
    error::{Error, Result},
    event::{
        sdam::{
            ServerClosedEvent, ServerDescriptionChangedEvent, ServerOpeningEvent,
            TopologyClosedEvent, TopologyDescriptionChangedEvent, TopologyDescriptionSummary,
            TopologyOpeningEvent,
        },
        EventBus,
    },
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::{ServerDescription, ServerType, TopologyDescription, TopologyType},
        message_manager::{TopologyMessageManager, TopologyMessageSubscriber},
        monitor::{Monitor, DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
        selection,
    },
    selection_criteria::SelectionCriteria,
};

/// Whether a deployment's current topology supports transactions (§4.H). `Unknown` means at
/// least one more round of server selection is needed before the caller can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSupportStatus {
    Supported,
    Unsupported,
    Unknown,
}

struct TopologyState {
    description: TopologyDescription,
    pools: HashMap<ServerAddress, Arc<ConnectionPool>>,
    /// The highest `$clusterTime` observed on any reply across every session (§4.G: "the highest
    /// observed value is gossiped on every outgoing command"). Shared cluster-wide, unlike
    /// `operation_time`, which is per-session.
    cluster_time: Option<Document>,
}

/// Owns the topology description, the per-server pools, and the monitors that feed them. Created
/// once per client and shared via `Arc` with every monitor it starts.
pub struct Topology {
    id: Uuid,
    options: ClientOptions,
    events: Option<EventBus>,
    message_manager: TopologyMessageManager,
    state: RwLock<TopologyState>,
    closed: AtomicBool,
}

impl Topology {
    pub fn new(options: ClientOptions, events: Option<EventBus>) -> Arc<Self> {
        let load_balanced = options.load_balanced.unwrap_or(false);
        let direct_connection = options.direct_connection.unwrap_or(false);
        let description = TopologyDescription::new(&options.hosts, options.repl_set_name.clone(), direct_connection, load_balanced);
        let id = Uuid::new_v4();
        let addresses: Vec<ServerAddress> = description.servers().keys().cloned().collect();

        if let Some(events) = &events {
            events.sdam(TopologyOpeningEvent { topology_id: id });
        }

        let mut pools = HashMap::new();
        for address in &addresses {
            let pool = ConnectionPool::new(address.clone(), ConnectionPoolOptions::from_client_options(&options), events.clone());
            background::start(&pool);
            pools.insert(address.clone(), pool);
            if let Some(events) = &events {
                events.sdam(ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: id,
                });
            }
        }

        let topology = Arc::new(Self {
            id,
            message_manager: TopologyMessageManager::new(),
            state: RwLock::new(TopologyState {
                description,
                pools,
                cluster_time: None,
            }),
            closed: AtomicBool::new(false),
            options,
            events,
        });

        if load_balanced {
            // Load-balanced deployments never run SDAM monitoring (§9.1): there is exactly one
            // seed, and it's always treated as reachable with a synthetic `LoadBalancer`
            // description rather than one derived from a hello reply.
            let mut state = topology.state.write().expect("topology state lock poisoned");
            for address in &addresses {
                let synthetic = ServerDescription {
                    server_type: ServerType::LoadBalancer,
                    round_trip_time: Some(Duration::ZERO),
                    ..ServerDescription::unknown(address.clone())
                };
                state.description.apply_server_description_changed(synthetic);
            }
        } else {
            for address in addresses {
                Monitor::start(address, Arc::clone(&topology), topology.options.clone());
            }
        }

        topology
    }

    /// A topology with no pools and no monitors, for exercising code that needs an `Arc<Topology>`
    /// but never actually selects a server (e.g. session/executor unit tests).
    #[cfg(test)]
    pub(crate) fn new_for_test(options: ClientOptions) -> Arc<Self> {
        let load_balanced = options.load_balanced.unwrap_or(false);
        let direct_connection = options.direct_connection.unwrap_or(false);
        let description = TopologyDescription::new(&options.hosts, options.repl_set_name.clone(), direct_connection, load_balanced);
        Arc::new(Self {
            id: Uuid::new_v4(),
            message_manager: TopologyMessageManager::new(),
            state: RwLock::new(TopologyState {
                description,
                pools: HashMap::new(),
                cluster_time: None,
            }),
            closed: AtomicBool::new(false),
            options,
            events: None,
        })
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.state.read().expect("topology state lock poisoned").description.servers().get(address).cloned()
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.state.read().expect("topology state lock poisoned").description.clone()
    }

    pub(crate) fn logical_session_timeout_minutes(&self) -> Option<i64> {
        self.state
            .read()
            .expect("topology state lock poisoned")
            .description
            .logical_session_timeout_minutes()
    }

    pub(crate) fn compatibility_result(&self) -> Result<()> {
        self.state.read().expect("topology state lock poisoned").description.compatibility_result()
    }

    /// Whether the current topology is one where a transaction can be started (§4.H); `Unknown`
    /// if the topology hasn't discovered enough to say yet.
    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        let state = self.state.read().expect("topology state lock poisoned");
        let description = &state.description;

        match description.topology_type() {
            TopologyType::Unknown | TopologyType::ReplicaSetNoPrimary => TransactionSupportStatus::Unknown,
            TopologyType::Single => TransactionSupportStatus::Unsupported,
            TopologyType::LoadBalanced => TransactionSupportStatus::Supported,
            TopologyType::ReplicaSetWithPrimary => {
                match description.servers().values().find(|s| s.server_type == ServerType::RSPrimary) {
                    Some(primary) if primary.max_wire_version >= 7 => TransactionSupportStatus::Supported,
                    Some(_) => TransactionSupportStatus::Unsupported,
                    None => TransactionSupportStatus::Unknown,
                }
            }
            TopologyType::Sharded => {
                let mongoses: Vec<_> = description.servers().values().filter(|s| s.server_type == ServerType::Mongos).collect();
                if mongoses.is_empty() {
                    TransactionSupportStatus::Unknown
                } else if mongoses.iter().all(|s| s.max_wire_version >= 8) {
                    TransactionSupportStatus::Supported
                } else {
                    TransactionSupportStatus::Unsupported
                }
            }
        }
    }

    pub(crate) fn cluster_time(&self) -> Option<Document> {
        self.state.read().expect("topology state lock poisoned").cluster_time.clone()
    }

    /// Gossips `new` as the highest observed `$clusterTime` if it's newer than what's already
    /// known (§4.G: `advance_cluster_time(t)` is a no-op if `t ≤ current`).
    pub(crate) fn advance_cluster_time(&self, new: &Document) {
        let mut state = self.state.write().expect("topology state lock poisoned");
        if crate::session::cluster_time::is_greater(new, state.cluster_time.as_ref()) {
            state.cluster_time = Some(new.clone());
        }
    }

    pub(crate) fn subscribe_to_check_requests(&self) -> TopologyMessageSubscriber {
        self.message_manager.subscribe_to_check_requests()
    }

    pub(crate) fn request_topology_check(&self) {
        self.message_manager.request_topology_check();
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        self.message_manager.change_subscriber_count() > 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn pool_for(&self, address: &ServerAddress) -> Option<Arc<ConnectionPool>> {
        self.state.read().expect("topology state lock poisoned").pools.get(address).cloned()
    }

    /// Applies one fresh `ServerDescription` (from a monitor heartbeat or a direct handshake,
    /// §4.D step 3) and reconciles the pool/monitor set against whatever membership change
    /// resulted (§4.E: "arriving hosts ... added ...; hosts not listed are removed").
    pub async fn update_server(self: &Arc<Self>, new: ServerDescription) {
        let address = new.address.clone();
        let load_balanced = {
            let state = self.state.read().expect("topology state lock poisoned");
            state.description.topology_type() == TopologyType::LoadBalanced
        };

        struct Reconciliation {
            previous_summary: TopologyDescriptionSummary,
            new_summary: TopologyDescriptionSummary,
            previous_server: Option<ServerDescription>,
            new_server: Option<ServerDescription>,
            to_start: Vec<ServerAddress>,
            to_stop: Vec<(ServerAddress, Arc<ConnectionPool>)>,
            ready_pool: Option<Arc<ConnectionPool>>,
        }

        let reconciliation = {
            let mut state = self.state.write().expect("topology state lock poisoned");

            let before: HashSet<ServerAddress> = state.description.servers().keys().cloned().collect();
            let previous_server = state.description.servers().get(&address).cloned();
            let previous_summary = TopologyDescriptionSummary::from(&state.description);

            state.description.apply_server_description_changed(new.clone());

            let after: HashSet<ServerAddress> = state.description.servers().keys().cloned().collect();
            let new_summary = TopologyDescriptionSummary::from(&state.description);
            let new_server = state.description.servers().get(&address).cloned();

            let to_start: Vec<ServerAddress> = after.difference(&before).cloned().collect();
            for addr in &to_start {
                let pool = ConnectionPool::new(addr.clone(), ConnectionPoolOptions::from_client_options(&self.options), self.events.clone());
                background::start(&pool);
                state.pools.insert(addr.clone(), pool);
            }

            let to_stop: Vec<(ServerAddress, Arc<ConnectionPool>)> = before
                .difference(&after)
                .filter_map(|addr| state.pools.remove(addr).map(|pool| (addr.clone(), pool)))
                .collect();

            let should_ready = new_server
                .as_ref()
                .map(|s| s.server_type.is_data_bearing() || s.server_type == ServerType::LoadBalancer || state.description.topology_type() == TopologyType::Single)
                .unwrap_or(false);
            let ready_pool = if should_ready { state.pools.get(&address).cloned() } else { None };

            Reconciliation {
                previous_summary,
                new_summary,
                previous_server,
                new_server,
                to_start,
                to_stop,
                ready_pool,
            }
        };

        if !load_balanced {
            for addr in reconciliation.to_start.iter().cloned() {
                if let Some(events) = &self.events {
                    events.sdam(ServerOpeningEvent {
                        address: addr.clone(),
                        topology_id: self.id,
                    });
                }
                Monitor::start(addr, Arc::clone(self), self.options.clone());
            }
        }

        for (addr, pool) in reconciliation.to_stop {
            pool.close().await;
            if let Some(events) = &self.events {
                events.sdam(ServerClosedEvent {
                    address: addr,
                    topology_id: self.id,
                });
            }
        }

        if let Some(pool) = reconciliation.ready_pool {
            pool.mark_ready().await;
        }

        if let Some(events) = &self.events {
            if let (Some(previous), Some(current)) = (reconciliation.previous_server, reconciliation.new_server) {
                events.sdam(ServerDescriptionChangedEvent {
                    address,
                    topology_id: self.id,
                    previous_description: previous,
                    new_description: current,
                });
            }
            if reconciliation.previous_summary != reconciliation.new_summary {
                events.sdam(TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: reconciliation.previous_summary,
                    new_description: reconciliation.new_summary,
                });
            }
        }

        self.message_manager.notify_topology_changed();
    }

    /// A monitor failed to reach its server (§4.D "On failure"): mark it `Unknown`, clear and
    /// pause its pool, and let anything waiting on selection retry against the rest of the
    /// topology.
    pub(crate) async fn handle_monitor_error(self: &Arc<Self>, address: &ServerAddress, error: Error) {
        // Monitors never run against a load-balanced deployment (§4.D), so a heartbeat failure
        // always clears and pauses the whole pool.
        self.mark_unknown_and_clear(address, None, Some(error)).await;
    }

    /// An in-flight operation's reply indicated a state change or network failure (§4.I step 4,
    /// S5 in §8): same remediation as a failed heartbeat, triggered out of band instead of
    /// waiting for the next one. `service_id` scopes the remediation to one backend behind a
    /// load balancer (§9 Open Question 1): a single backend's failure must not invalidate
    /// connections routed to a different backend through the same load balancer.
    pub(crate) async fn handle_application_error(self: &Arc<Self>, address: &ServerAddress, service_id: Option<u32>, error: &Error) {
        if error.is_network_error() || error.is_state_change_error() {
            self.mark_unknown_and_clear(address, service_id, Some(error.clone())).await;
        }
    }

    async fn mark_unknown_and_clear(self: &Arc<Self>, address: &ServerAddress, service_id: Option<u32>, error: Option<Error>) {
        let pool = {
            let mut state = self.state.write().expect("topology state lock poisoned");
            state.description.mark_server_unknown(address, error);
            state.pools.get(address).cloned()
        };

        self.message_manager.notify_topology_changed();
        self.message_manager.request_topology_check();

        if let Some(pool) = pool {
            // `clear` reports whether it bumped the pool-wide generation; a service-scoped clear
            // (load-balanced mode) must not pause the pool, since unrelated backends behind the
            // same balancer are still healthy.
            if pool.clear(service_id).await {
                pool.pause().await;
            }
        }
    }

    /// Selects a server for `criteria` (§4.F), retrying against topology-change notifications and
    /// a polling floor until `timeout` elapses.
    pub async fn select_server(self: &Arc<Self>, criteria: &SelectionCriteria, timeout: Duration) -> Result<Arc<ConnectionPool>> {
        let deadline = Instant::now() + timeout;
        let mut change_subscriber = self.message_manager.subscribe_to_changes();

        loop {
            {
                let state = self.state.read().expect("topology state lock poisoned");
                state.description.compatibility_result()?;

                let heartbeat_frequency = self.options.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
                let local_threshold = self.options.local_threshold.unwrap_or_else(selection::default_local_threshold);

                let candidates = selection::suitable_servers(&state.description, criteria, heartbeat_frequency, local_threshold)?;
                if let Some(chosen) = selection::choose(&candidates) {
                    if let Some(pool) = state.pools.get(&chosen.address) {
                        return Ok(Arc::clone(pool));
                    }
                }
            }

            self.message_manager.request_topology_check();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let state = self.state.read().expect("topology state lock poisoned");
                return Err(selection::server_selection_timeout_error(&state.description, criteria, timeout.as_millis() as u64));
            }

            change_subscriber.wait(remaining.min(MIN_HEARTBEAT_FREQUENCY)).await;
        }
    }

    /// Closes every pool and marks the topology closed so its monitors exit on their next
    /// iteration (§4.D: the monitor loop runs "until the topology it belongs to is dropped").
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<ConnectionPool>> = {
            let state = self.state.read().expect("topology state lock poisoned");
            state.pools.values().cloned().collect()
        };
        for pool in pools {
            pool.close().await;
        }
        if let Some(events) = &self.events {
            events.sdam(TopologyClosedEvent { topology_id: self.id });
        }
        self.message_manager.notify_topology_changed();
    }
}
