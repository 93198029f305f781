//! The server selector (§4.F): eligibility filtering, max-staleness, tag sets, and the
//! latency-window random choice.

use std::time::Duration;

use rand::{seq::SliceRandom, SeedableRng};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    read_preference::{Mode, ReadPreference},
    sdam::description::{ServerDescription, ServerType, TopologyDescription, TopologyType},
    selection_criteria::SelectionCriteria,
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// A borrowed, read-only view of one server handed to a [`crate::selection_criteria::Predicate`]
/// (§4.F). Keeps the predicate from depending on the topology's internal `ServerDescription`
/// representation directly.
#[derive(Clone, Copy)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    pub fn tags(&self) -> &std::collections::HashMap<String, String> {
        &self.description.tags
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.description.round_trip_time
    }
}

/// `max_staleness` must be at least `max(90s, heartbeat_frequency + 10s)` (§4.F edge case).
pub(crate) fn verify_max_staleness(max_staleness: Duration, heartbeat_frequency: Duration) -> Result<()> {
    let smallest = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency.checked_add(IDLE_WRITE_PERIOD).unwrap_or(Duration::MAX),
    );
    if max_staleness < smallest {
        return Err(Error::invalid_argument(format!(
            "max staleness must be at least {} seconds",
            smallest.as_secs()
        )));
    }
    Ok(())
}

/// Returns every server in `topology` that satisfies `criteria`, narrowed to the latency window
/// (§4.F). An empty result (rather than an error) means selection should keep retrying until the
/// deadline; [`TopologyDescription::compatibility_result`] is checked by the caller first.
pub(crate) fn suitable_servers<'a>(
    topology: &'a TopologyDescription,
    criteria: &SelectionCriteria,
    heartbeat_frequency: Duration,
    local_threshold: Duration,
) -> Result<Vec<&'a ServerDescription>> {
    let mut candidates = match criteria {
        SelectionCriteria::ReadPreference(read_pref) => {
            suitable_servers_for_read_preference(topology, read_pref, heartbeat_frequency)?
        }
        SelectionCriteria::Predicate(filter) => topology
            .servers()
            .values()
            .filter(|s| {
                (topology.topology_type() == TopologyType::Single || s.server_type.is_data_bearing())
                    && filter(&ServerInfo::new(s))
            })
            .collect(),
    };

    retain_within_latency_window(&mut candidates, local_threshold);
    Ok(candidates)
}

fn suitable_servers_for_read_preference<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    heartbeat_frequency: Duration,
) -> Result<Vec<&'a ServerDescription>> {
    let servers = match topology.topology_type() {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single | TopologyType::LoadBalanced => topology.servers().values().collect(),
        TopologyType::Sharded => servers_with_type(topology, &[ServerType::Mongos]),
        TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
            suitable_servers_in_replica_set(topology, read_preference, heartbeat_frequency)?
        }
    };
    Ok(servers)
}

fn servers_with_type<'a>(topology: &'a TopologyDescription, types: &[ServerType]) -> Vec<&'a ServerDescription> {
    topology
        .servers()
        .values()
        .filter(|s| types.contains(&s.server_type))
        .collect()
}

fn suitable_servers_in_replica_set<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    heartbeat_frequency: Duration,
) -> Result<Vec<&'a ServerDescription>> {
    let tag_sets = read_preference.tag_sets();
    let max_staleness = read_preference.max_staleness;

    let servers = match &read_preference.mode {
        Mode::Primary => servers_with_type(topology, &[ServerType::RSPrimary]),
        Mode::Secondary(_) => {
            filtered_for_preference(topology, &[ServerType::RSSecondary], tag_sets, max_staleness, heartbeat_frequency)?
        }
        Mode::PrimaryPreferred(_) => {
            let primary = servers_with_type(topology, &[ServerType::RSPrimary]);
            if primary.is_empty() {
                filtered_for_preference(topology, &[ServerType::RSSecondary], tag_sets, max_staleness, heartbeat_frequency)?
            } else {
                primary
            }
        }
        Mode::SecondaryPreferred(_) => {
            let secondaries =
                filtered_for_preference(topology, &[ServerType::RSSecondary], tag_sets, max_staleness, heartbeat_frequency)?;
            if secondaries.is_empty() {
                servers_with_type(topology, &[ServerType::RSPrimary])
            } else {
                secondaries
            }
        }
        Mode::Nearest(_) => filtered_for_preference(
            topology,
            &[ServerType::RSPrimary, ServerType::RSSecondary],
            tag_sets,
            max_staleness,
            heartbeat_frequency,
        )?,
    };

    Ok(servers)
}

fn filtered_for_preference<'a>(
    topology: &'a TopologyDescription,
    types: &[ServerType],
    tag_sets: Option<&[std::collections::HashMap<String, String>]>,
    max_staleness: Option<Duration>,
    heartbeat_frequency: Duration,
) -> Result<Vec<&'a ServerDescription>> {
    if let Some(max_staleness) = max_staleness {
        verify_max_staleness(max_staleness, heartbeat_frequency)?;
    }

    let mut servers = servers_with_type(topology, types);

    if let Some(max_staleness) = max_staleness {
        if max_staleness > Duration::ZERO {
            filter_by_max_staleness(topology, &mut servers, max_staleness, heartbeat_frequency);
        }
    }

    if let Some(tag_sets) = tag_sets {
        filter_by_tag_sets(&mut servers, tag_sets);
    }

    Ok(servers)
}

/// §4.F step 4: the tag sets are tried in order; the *first* one with at least one matching
/// server wins, and only that set's matches survive. A later tag set is never consulted once an
/// earlier one has matched, even if it would also match other servers.
fn filter_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[std::collections::HashMap<String, String>]) {
    if tag_sets.is_empty() {
        return;
    }
    let matches = |server: &&ServerDescription, set: &std::collections::HashMap<String, String>| {
        set.iter().all(|(k, v)| server.tags.get(k) == Some(v))
    };
    let winning_set = tag_sets.iter().find(|set| servers.iter().any(|s| matches(s, set)));
    match winning_set {
        Some(set) => servers.retain(|server| matches(server, set)),
        None => servers.clear(),
    }
}

fn filter_by_max_staleness(
    topology: &TopologyDescription,
    servers: &mut Vec<&ServerDescription>,
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) {
    let max_staleness_ms = max_staleness.as_millis() as i64;
    let heartbeat_frequency_ms = heartbeat_frequency.as_millis() as i64;

    match topology.primary() {
        Some(primary) => {
            servers.retain(|server| {
                staleness_with_primary(server, primary, heartbeat_frequency_ms)
                    .map(|staleness| staleness <= max_staleness_ms)
                    .unwrap_or(false)
            });
        }
        None => {
            let max_write_date = topology
                .servers()
                .values()
                .filter(|s| s.server_type == ServerType::RSSecondary)
                .filter_map(|s| s.last_write_date)
                .map(|d| d.timestamp_millis())
                .max();

            let Some(max_write_date) = max_write_date else {
                return;
            };

            servers.retain(|server| {
                staleness_without_primary(server, max_write_date, heartbeat_frequency_ms)
                    .map(|staleness| staleness <= max_staleness_ms)
                    .unwrap_or(false)
            });
        }
    }
}

fn staleness_with_primary(secondary: &ServerDescription, primary: &ServerDescription, heartbeat_frequency_ms: i64) -> Option<i64> {
    let primary_last_update = primary.last_update_time.timestamp_millis();
    let primary_last_write = primary.last_write_date?.timestamp_millis();
    let secondary_last_update = secondary.last_update_time.timestamp_millis();
    let secondary_last_write = secondary.last_write_date?.timestamp_millis();

    Some((secondary_last_update - secondary_last_write) - (primary_last_update - primary_last_write) + heartbeat_frequency_ms)
}

fn staleness_without_primary(secondary: &ServerDescription, max_last_write_date_ms: i64, heartbeat_frequency_ms: i64) -> Option<i64> {
    let secondary_last_write = secondary.last_write_date?.timestamp_millis();
    Some(max_last_write_date_ms - secondary_last_write + heartbeat_frequency_ms)
}

fn retain_within_latency_window(servers: &mut Vec<&ServerDescription>, local_threshold: Duration) {
    let shortest = servers
        .iter()
        .filter_map(|s| s.round_trip_time)
        .fold(None, |min: Option<Duration>, curr| Some(min.map_or(curr, |m| m.min(curr))));

    let Some(shortest) = shortest else {
        // Nobody has an RTT yet (e.g. a load balancer, which never runs SDAM): keep everything
        // and let the caller pick.
        return;
    };

    let max_within_window = shortest.checked_add(local_threshold).unwrap_or(Duration::MAX);
    servers.retain(|s| match s.round_trip_time {
        Some(rtt) => rtt <= max_within_window,
        None => s.server_type == ServerType::LoadBalancer,
    });
}

/// Random choice among the latency window (§4.F: "drivers MUST randomly select a server..."),
/// using `max(2, ...)` candidates to halve the chance of always landing on the same server when
/// the window has more than one choice.
pub(crate) fn choose<'a>(servers: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
    match servers.len() {
        0 => None,
        1 => Some(servers[0]),
        _ => {
            let mut rng = rand::rngs::SmallRng::from_entropy();
            servers.choose(&mut rng).copied()
        }
    }
}

pub(crate) fn default_local_threshold() -> Duration {
    DEFAULT_LOCAL_THRESHOLD
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use function_name::named;

    use super::*;
    use crate::options::ServerAddress;

    fn server(address: &str, server_type: ServerType, rtt_ms: u64) -> ServerDescription {
        let mut desc = ServerDescription::unknown(ServerAddress::parse(address).unwrap());
        desc.server_type = server_type;
        desc.round_trip_time = Some(Duration::from_millis(rtt_ms));
        desc.set_name = Some("rs0".to_string());
        desc.max_wire_version = 17;
        desc
    }

    fn replica_set(servers: Vec<ServerDescription>) -> TopologyDescription {
        let addrs: Vec<_> = servers.iter().map(|s| s.address.clone()).collect();
        let mut topology = TopologyDescription::new(&addrs, Some("rs0".to_string()), false, false);
        for s in servers {
            topology.apply_server_description_changed(s);
        }
        topology
    }

    /// §8 S1 — `{A: RSPrimary(rtt=5), B: RSSecondary(rtt=7), C: RSSecondary(rtt=30)}`,
    /// `localThresholdMS=15`, mode `secondary`: eligible is `{B, C}`, but the latency window
    /// (`min(7,30)+15 = 22`) excludes C, leaving only B.
    #[test]
    #[named]
    fn s1_secondary_selection_applies_the_latency_window() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RSPrimary, 5),
            server("b:27017", ServerType::RSSecondary, 7),
            server("c:27017", ServerType::RSSecondary, 30),
        ]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::secondary(None));
        let candidates = suitable_servers(&topology, &criteria, Duration::from_secs(10), Duration::from_millis(15))
            .unwrap_or_else(|e| panic!("{}: selection failed: {e}", function_name!()));

        assert_eq!(candidates.len(), 1, "{}: expected only B within the latency window", function_name!());
        assert_eq!(candidates[0].address, ServerAddress::parse("b:27017").unwrap());
    }

    /// Table-driven sanity check that every read-preference mode at least returns the primary
    /// when it's the only data-bearing server and no secondary matches.
    #[test]
    #[named]
    fn every_mode_falls_back_to_primary_when_no_secondary_is_eligible() {
        let modes = [
            ReadPreference::primary(),
            ReadPreference::primary_preferred(None),
            ReadPreference::secondary_preferred(None),
            ReadPreference::nearest(None),
        ];

        for read_preference in modes {
            let topology = replica_set(vec![server("a:27017", ServerType::RSPrimary, 5)]);
            let criteria = SelectionCriteria::ReadPreference(read_preference.clone());
            let candidates = suitable_servers(&topology, &criteria, Duration::from_secs(10), Duration::from_millis(15)).unwrap_or_else(|e| {
                panic!("{} ({:?}): selection failed: {e}", function_name!(), read_preference.mode)
            });
            assert_eq!(
                candidates.len(),
                1,
                "{} ({:?}): expected the lone primary to be selected",
                function_name!(),
                read_preference.mode
            );
        }
    }

    /// Tag-set filtering (§4.F step 4): the first tag set with at least one matching server wins.
    #[test]
    fn first_matching_tag_set_wins() {
        let mut with_tag = server("b:27017", ServerType::RSSecondary, 7);
        with_tag.tags = HashMap::from([("region".to_string(), "east".to_string())]);
        let without_tag = server("c:27017", ServerType::RSSecondary, 7);

        let topology = replica_set(vec![server("a:27017", ServerType::RSPrimary, 5), with_tag, without_tag]);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::secondary(Some(vec![
            crate::tag_set! { "region" => "east" },
            crate::tag_set! {},
        ])));
        let candidates = suitable_servers(&topology, &criteria, Duration::from_secs(10), Duration::from_millis(15)).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, ServerAddress::parse("b:27017").unwrap());
    }

    #[test]
    fn max_staleness_below_the_floor_is_rejected() {
        let err = verify_max_staleness(Duration::from_secs(10), Duration::from_secs(10));
        assert!(err.is_err());
    }
}

pub(crate) fn server_selection_timeout_error(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
    duration_ms: u64,
) -> Error {
    let message = if topology.servers().is_empty() {
        "no servers are known to the topology".to_string()
    } else {
        format!("no server matched criteria {:?}; topology: {:?}", criteria, topology.servers().keys().collect::<Vec<_>>())
    };
    ErrorKind::ServerSelectionTimeout { message, duration_ms }.into()
}
