//! `ServerDescription` and `ServerType` (§3).

use std::collections::HashMap;

use bson::{oid::ObjectId, DateTime, Document};

use crate::{error::Error, options::ServerAddress};

/// The monitor's classification of one server (§3 `ServerDescription::type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    Mongos,
    RSPrimary,
    RSSecondary,
    RSArbiter,
    RSOther,
    RSGhost,
    LoadBalancer,
}

impl ServerType {
    /// Whether a server of this type can hold user data, and thus participates in
    /// `logical_session_timeout_minutes` and the compatibility check (§3 invariants).
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RSPrimary
                | ServerType::RSSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerType::RSPrimary
                | ServerType::RSSecondary
                | ServerType::RSArbiter
                | ServerType::RSOther
                | ServerType::RSGhost
        )
    }
}

/// The monitor's view of one server (§3). Created on first check, mutated only by processing a
/// hello reply or a disconnect, destroyed when the server is removed from the topology.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub round_trip_time: Option<std::time::Duration>,
    /// Wall-clock time this description was produced, used to compute staleness against
    /// `last_write_date` (§4.F max-staleness filter), which is also wall-clock.
    pub last_update_time: DateTime,
    pub last_write_date: Option<DateTime>,
    pub max_wire_version: i32,
    pub tags: HashMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<ServerAddress>,
    /// Hosts listed by a primary/mongos reply, used by the topology to discover new members
    /// (§4.E: "Arriving hosts listed by the primary are added").
    pub hosts: Vec<ServerAddress>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub hello_ok: bool,
    pub topology_version: Option<Document>,
    pub service_id: Option<u32>,
    pub error: Option<Error>,
}

impl ServerDescription {
    /// A server nobody has contacted yet (or one the monitor lost contact with); every field
    /// besides `address` and `last_update_time` defaults away, matching the "Unknown" state a
    /// newly-discovered host starts in (§4.E: "hosts ... are added with Unknown type").
    pub(crate) fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            last_update_time: DateTime::now(),
            last_write_date: None,
            max_wire_version: 0,
            tags: HashMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            hosts: Vec::new(),
            logical_session_timeout_minutes: None,
            hello_ok: false,
            topology_version: None,
            service_id: None,
            error: None,
        }
    }

    /// Rewrites this description back to `Unknown` in place, keeping the address but dropping
    /// every other observation (§4.E: "the server description is rewritten to Unknown",
    /// §4.I: "mark the server Unknown in the topology").
    pub(crate) fn to_unknown_with_error(&self, error: Option<Error>) -> Self {
        let mut unknown = Self::unknown(self.address.clone());
        unknown.error = error;
        unknown
    }

    /// Applies the EWMA update described in §4.D step 2: `α·sample + (1-α)·prev`, or the sample
    /// itself on the first observation.
    pub(crate) fn updated_round_trip_time(previous: Option<std::time::Duration>, sample: std::time::Duration) -> std::time::Duration {
        const ALPHA: f64 = 0.2;
        match previous {
            None => sample,
            Some(previous) => {
                let weighted = ALPHA * sample.as_secs_f64() + (1.0 - ALPHA) * previous.as_secs_f64();
                std::time::Duration::from_secs_f64(weighted.max(0.0))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    /// §4.D step 2: the first observation is taken as-is, with no smoothing applied yet.
    #[test]
    fn first_observation_is_used_unsmoothed() {
        let rtt = ServerDescription::updated_round_trip_time(None, Duration::from_millis(50));
        assert_eq!(rtt, Duration::from_millis(50));
    }

    /// §4.D step 2: `α·sample + (1-α)·prev` with α = 0.2.
    #[test]
    fn subsequent_observations_are_exponentially_weighted() {
        let updated = ServerDescription::updated_round_trip_time(Some(Duration::from_millis(100)), Duration::from_millis(200));
        approx::assert_relative_eq!(updated.as_secs_f64(), Duration::from_millis(120).as_secs_f64(), epsilon = 1e-6);
    }
}
