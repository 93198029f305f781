//! The per-server monitor loop (§4.D): runs `hello`/`isMaster` on an interval, folding the
//! reply into a fresh [`ServerDescription`] and handing it to the topology.

use std::{sync::Arc, time::Duration};

use crate::{
    cmap::conn::{handshake, Connection},
    error::Error,
    options::ClientOptions,
    sdam::{
        description::{ServerDescription, ServerType},
        message_manager::TopologyMessageSubscriber,
        state::Topology,
    },
    RUNTIME,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Runs the monitor loop for one address until the topology it belongs to is dropped.
pub(crate) struct Monitor {
    address: crate::options::ServerAddress,
    topology: Arc<Topology>,
    options: ClientOptions,
    connection: Option<Connection>,
    check_requests: TopologyMessageSubscriber,
}

impl Monitor {
    pub(crate) fn start(address: crate::options::ServerAddress, topology: Arc<Topology>, options: ClientOptions) {
        let check_requests = topology.subscribe_to_check_requests();
        let monitor = Self {
            address,
            topology,
            options,
            connection: None,
            check_requests,
        };
        RUNTIME.spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.options.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while Arc::strong_count(&self.topology) > 1 || self.topology.has_subscribers() {
            self.check_server().await;

            RUNTIME.delay_for(MIN_HEARTBEAT_FREQUENCY).await;
            let remaining = heartbeat_frequency.saturating_sub(MIN_HEARTBEAT_FREQUENCY);
            self.check_requests.wait(remaining).await;

            if self.topology.is_closed() {
                return;
            }
        }
    }

    /// Runs one `hello`, retrying once immediately on a network error if the server was
    /// previously reachable (§4.D: no exponential backoff, minHeartbeatFrequency is the floor).
    async fn check_server(&mut self) {
        let previous_was_available = self
            .topology
            .server_description(&self.address)
            .map(|s| s.server_type != ServerType::Unknown)
            .unwrap_or(false);

        let mut result = self.perform_hello().await;
        if let Err(ref e) = result {
            if e.is_network_error() && previous_was_available {
                self.connection = None;
                result = self.perform_hello().await;
            }
        }

        match result {
            Ok(description) => self.topology.update_server(description).await,
            Err(e) => {
                self.connection = None;
                self.topology.handle_monitor_error(&self.address, e).await;
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<ServerDescription, Error> {
        if self.connection.is_none() {
            let (connection, description) = Connection::establish(
                self.address.clone(),
                crate::cmap::PoolGeneration::Normal(0),
                self.options.connect_timeout,
                self.options.app_name.as_deref(),
            )
            .await?;
            self.connection = Some(connection);
            return Ok(description);
        }

        let conn = self.connection.as_mut().expect("checked above");
        let topology_version = self
            .topology
            .server_description(&self.address)
            .and_then(|s| s.topology_version);
        let command = handshake::build_monitoring_command(self.options.app_name.as_deref(), topology_version);
        let start = std::time::Instant::now();
        let reply = conn.run_command("admin", command, self.options.connect_timeout, None).await?;
        let rtt = start.elapsed();
        let (stream_description, mut description) = handshake::parse_hello_reply(&self.address, &reply, rtt)?;
        conn.stream_description = stream_description;
        description.round_trip_time = Some(ServerDescription::updated_round_trip_time(
            self.topology.server_description(&self.address).and_then(|s| s.round_trip_time),
            rtt,
        ));
        Ok(description)
    }
}
