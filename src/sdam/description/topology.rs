//! `TopologyDescription` and the SDAM state-transition rules (§3, §4.E).

use std::collections::HashMap;

use crate::{
    error::{Error, ErrorKind},
    options::ServerAddress,
    sdam::description::server::{ServerDescription, ServerType},
    MIN_SUPPORTED_WIRE_VERSION,
};

/// The cluster-level classification (§3 `TopologyDescription::type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
}

/// The in-memory cluster state the topology manager (§4.E) owns and serializes mutation of.
/// Readers get an immutable snapshot via [`crate::sdam::TopologyDescription::clone`] (cheap:
/// `ServerDescription` has no interior mutability, so a snapshot is a true point-in-time copy).
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    set_name: Option<String>,
    max_set_version: Option<i32>,
    max_election_id: Option<bson::oid::ObjectId>,
    servers: HashMap<ServerAddress, ServerDescription>,
    compatibility_error: Option<String>,
    load_balanced: bool,
}

impl TopologyDescription {
    /// Builds the initial topology from a seed list (§6 connection string rules / §B
    /// `directConnection`/single-seed handling). A single seed with no `replicaSet` option and
    /// `direct_connection` unset starts as `Single` once that one server replies, but the
    /// *description* itself starts `Unknown` either way until the first hello comes back, except
    /// for the direct-connection and load-balanced cases, which commit to `Single`/`LoadBalanced`
    /// up front because there is no discovery to do.
    pub(crate) fn new(seeds: &[ServerAddress], set_name: Option<String>, direct_connection: bool, load_balanced: bool) -> Self {
        let topology_type = if load_balanced {
            TopologyType::LoadBalanced
        } else if direct_connection || (seeds.len() == 1 && set_name.is_none()) {
            TopologyType::Single
        } else if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = seeds
            .iter()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr.clone())))
            .collect();

        Self {
            topology_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            servers,
            compatibility_error: None,
            load_balanced,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn servers(&self) -> &HashMap<ServerAddress, ServerDescription> {
        &self.servers
    }

    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// `min` over every data-bearing server's `logicalSessionTimeoutMinutes`; `None` if any such
    /// server lacks the field, which disables sessions cluster-wide (§3 invariant).
    pub fn logical_session_timeout_minutes(&self) -> Option<i64> {
        let data_bearing: Vec<_> = self
            .servers
            .values()
            .filter(|s| s.server_type.is_data_bearing())
            .collect();

        if data_bearing.is_empty() {
            return None;
        }

        data_bearing
            .iter()
            .map(|s| s.logical_session_timeout_minutes)
            .fold(Some(i64::MAX), |acc, v| match (acc, v) {
                (Some(acc), Some(v)) => Some(acc.min(v)),
                _ => None,
            })
    }

    /// Exactly one `RSPrimary` when `type == ReplicaSetWithPrimary` (§3 invariant, testable
    /// property #2).
    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers.values().find(|s| s.server_type == ServerType::RSPrimary)
    }

    fn primary_address(&self) -> Option<ServerAddress> {
        self.primary().map(|s| s.address.clone())
    }

    /// Applies one `ServerDescriptionChanged` event following the rules in §4.E. Idempotent
    /// (testable property #5): applying the same `new` twice in a row with no interleaving
    /// update leaves the topology unchanged after the first application, because the second
    /// application compares against state that already reflects it.
    pub(crate) fn apply_server_description_changed(&mut self, new: ServerDescription) {
        if !self.servers.contains_key(&new.address) {
            // The server was removed from the topology (e.g. no longer listed by the primary)
            // between the monitor starting this check and it completing; drop the stale update.
            return;
        }

        if self.load_balanced {
            // Load-balanced topologies don't run SDAM transitions; every server description is
            // accepted as-is (open question §9.1: precise service-id-scoped clearing rules are
            // left to the pool, not the topology).
            self.servers.insert(new.address.clone(), new);
            return;
        }

        self.update_max_wire_version_compatibility();

        match self.topology_type {
            TopologyType::Unknown => self.apply_to_unknown_topology(new),
            TopologyType::Single => {
                // A direct connection never changes topology type regardless of what it learns.
                self.servers.insert(new.address.clone(), new);
            }
            TopologyType::Sharded => self.apply_to_sharded_topology(new),
            TopologyType::ReplicaSetNoPrimary => self.apply_to_rs_no_primary(new),
            TopologyType::ReplicaSetWithPrimary => self.apply_to_rs_with_primary(new),
            TopologyType::LoadBalanced => unreachable!("handled above"),
        }

        self.update_max_wire_version_compatibility();
    }

    fn apply_to_unknown_topology(&mut self, new: ServerDescription) {
        match new.server_type {
            ServerType::Standalone => {
                if self.servers.len() == 1 {
                    self.topology_type = TopologyType::Single;
                    self.servers.insert(new.address.clone(), new);
                } else {
                    // A standalone showing up in a multi-seed topology is removed (it can't be
                    // part of a replica set or sharded cluster).
                    self.servers.remove(&new.address);
                }
            }
            ServerType::Mongos => {
                self.topology_type = TopologyType::Sharded;
                self.servers.insert(new.address.clone(), new);
            }
            ServerType::RSPrimary => {
                self.set_name = new.set_name.clone();
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.record_max_election_tuple(&new);
                self.sync_replica_set_membership(&new);
                self.servers.insert(new.address.clone(), new);
            }
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.set_name = new.set_name.clone();
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.sync_replica_set_membership(&new);
                self.servers.insert(new.address.clone(), new);
            }
            ServerType::Unknown | ServerType::RSGhost | ServerType::LoadBalancer => {
                self.servers.insert(new.address.clone(), new);
            }
        }
    }

    fn apply_to_sharded_topology(&mut self, new: ServerDescription) {
        match new.server_type {
            ServerType::Unknown | ServerType::Mongos => {
                self.servers.insert(new.address.clone(), new);
            }
            // Anything that isn't a mongos (or unknown) doesn't belong in a sharded topology.
            _ => {
                self.servers.remove(&new.address);
            }
        }
    }

    fn apply_to_rs_no_primary(&mut self, new: ServerDescription) {
        match new.server_type {
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&new.address);
                return;
            }
            ServerType::RSPrimary => {
                if !self.set_name_matches(&new) {
                    self.servers.remove(&new.address);
                    return;
                }
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.record_max_election_tuple(&new);
                self.sync_replica_set_membership(&new);
                self.servers.insert(new.address.clone(), new);
                return;
            }
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                if !self.set_name_matches(&new) {
                    self.servers.remove(&new.address);
                    return;
                }
                if self.set_name.is_none() {
                    self.set_name = new.set_name.clone();
                }
                self.sync_replica_set_membership(&new);
            }
            ServerType::Unknown | ServerType::RSGhost | ServerType::LoadBalancer => {}
        }
        self.servers.insert(new.address.clone(), new);
    }

    fn apply_to_rs_with_primary(&mut self, new: ServerDescription) {
        if !self.set_name_matches(&new) {
            // "Any server whose set_name disagrees with the topology's is removed" (§4.E).
            self.servers.remove(&new.address);
            self.check_if_primary_still_present();
            return;
        }

        match new.server_type {
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&new.address);
                self.check_if_primary_still_present();
            }
            ServerType::RSPrimary => {
                let is_current_primary = self.primary_address().as_ref() == Some(&new.address);
                if !is_current_primary && !self.is_newer_primary(&new) {
                    // Stale primary: reject it and rewrite it to Unknown, keep the existing
                    // primary (§4.E, S2 in §8).
                    let rewritten = new.to_unknown_with_error(None);
                    self.servers.insert(rewritten.address.clone(), rewritten);
                    return;
                }

                // Supersede: any other server currently claiming RSPrimary is stale.
                for (addr, desc) in self.servers.iter_mut() {
                    if *addr != new.address && desc.server_type == ServerType::RSPrimary {
                        *desc = desc.to_unknown_with_error(None);
                    }
                }

                self.record_max_election_tuple(&new);
                self.sync_replica_set_membership(&new);
                self.servers.insert(new.address.clone(), new);
            }
            ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                self.servers.insert(new.address.clone(), new);
                self.check_if_primary_still_present();
            }
            ServerType::Unknown | ServerType::RSGhost => {
                self.servers.insert(new.address.clone(), new);
                self.check_if_primary_still_present();
            }
            ServerType::LoadBalancer => {
                self.servers.insert(new.address.clone(), new);
            }
        }
    }

    fn check_if_primary_still_present(&mut self) {
        if self.primary().is_none() {
            self.topology_type = TopologyType::ReplicaSetNoPrimary;
        }
    }

    fn set_name_matches(&self, desc: &ServerDescription) -> bool {
        match (&self.set_name, &desc.set_name) {
            (Some(topology_set), Some(server_set)) => topology_set == server_set,
            // A server that hasn't reported a set name yet (Unknown) is never rejected on this
            // basis; the type-specific match arms handle it.
            (_, None) => true,
            (None, Some(_)) => true,
        }
    }

    /// Lexicographic `(set_version, election_id)` comparison (§4.E: "supersedes the old one only
    /// if (set_version, election_id) is newer").
    fn is_newer_primary(&self, new: &ServerDescription) -> bool {
        match (self.max_set_version, new.set_version) {
            (Some(current), Some(incoming)) if incoming < current => false,
            (Some(current), Some(incoming)) if incoming > current => true,
            _ => match (&self.max_election_id, &new.election_id) {
                (Some(current), Some(incoming)) => incoming > current,
                (None, Some(_)) => true,
                _ => false,
            },
        }
    }

    fn record_max_election_tuple(&mut self, new: &ServerDescription) {
        if let Some(v) = new.set_version {
            self.max_set_version = Some(self.max_set_version.map_or(v, |cur| cur.max(v)));
        }
        if let Some(id) = new.election_id {
            self.max_election_id = Some(match self.max_election_id {
                Some(cur) if cur > id => cur,
                _ => id,
            });
        }
    }

    /// Adds hosts the primary/config lists that the topology doesn't know about yet, each
    /// starting `Unknown` so a monitor will spin up for it; removes servers no longer listed
    /// (§4.E: "hosts not listed are removed").
    fn sync_replica_set_membership(&mut self, authoritative: &ServerDescription) {
        if authoritative.hosts.is_empty() {
            return;
        }
        let listed: std::collections::HashSet<_> = authoritative.hosts.iter().cloned().collect();

        for host in &listed {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::unknown(host.clone()));
        }

        self.servers.retain(|addr, _| listed.contains(addr));
    }

    /// Recomputes `compatibility_error` (§3 invariant): any data-bearing server with
    /// `max_wire_version` below [`MIN_SUPPORTED_WIRE_VERSION`] blocks the whole topology.
    fn update_max_wire_version_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .filter(|s| s.server_type.is_data_bearing())
            .find(|s| s.max_wire_version < MIN_SUPPORTED_WIRE_VERSION)
            .map(|s| {
                format!(
                    "server at {} reports wire version {}, but this driver requires at least {}",
                    s.address, s.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
                )
            });
    }

    pub(crate) fn compatibility_result(&self) -> Result<(), Error> {
        match &self.compatibility_error {
            Some(message) => Err(ErrorKind::IncompatibleServer {
                // Any data-bearing address is informative here; the message already names one.
                address: self.servers.keys().next().cloned().unwrap_or_default(),
                message: message.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Marks a server `Unknown` after a network/state-change error (§4.I steps on reply
    /// classification, S5 in §8). No-op if the server has already been removed.
    pub(crate) fn mark_server_unknown(&mut self, address: &ServerAddress, error: Option<Error>) {
        if let Some(existing) = self.servers.get(address) {
            let rewritten = existing.to_unknown_with_error(error);
            self.apply_server_description_changed(rewritten);
        }
    }

    pub(crate) fn remove_server(&mut self, address: &ServerAddress) {
        self.servers.remove(address);
    }
}

#[cfg(test)]
mod test {
    use bson::oid::ObjectId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn primary_desc(address: &ServerAddress, set_version: i32, election_id: ObjectId) -> ServerDescription {
        let mut desc = ServerDescription::unknown(address.clone());
        desc.server_type = ServerType::RSPrimary;
        desc.set_name = Some("rs0".to_string());
        desc.set_version = Some(set_version);
        desc.election_id = Some(election_id);
        desc.max_wire_version = 17;
        desc
    }

    /// §8 S1 setup / §8 S2: a fresh `RSPrimary` reply establishes `ReplicaSetWithPrimary` and
    /// exactly one server has type `RSPrimary` (testable property #2).
    #[test]
    fn first_primary_reply_establishes_replica_set_with_primary() {
        let a = addr("a:27017");
        let mut topology = TopologyDescription::new(&[a.clone()], Some("rs0".to_string()), false, false);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);

        let oid = ObjectId::parse_str("000000000000000000000001").unwrap();
        topology.apply_server_description_changed(primary_desc(&a, 1, oid));

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        let primaries: Vec<_> = topology.servers().values().filter(|s| s.server_type == ServerType::RSPrimary).collect();
        assert_eq!(primaries.len(), 1);
    }

    /// §8 S2 — stale primary rejection: a new description with an older `(set_version,
    /// election_id)` is rewritten to `Unknown`; the topology keeps its existing primary and stays
    /// `ReplicaSetWithPrimary`.
    #[test]
    fn stale_primary_is_rewritten_to_unknown() {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let mut topology = TopologyDescription::new(&[a.clone(), b.clone()], Some("rs0".to_string()), false, false);

        let newer_oid = ObjectId::parse_str("000000000000000000000002").unwrap();
        topology.apply_server_description_changed(primary_desc(&a, 2, newer_oid));
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.primary().unwrap().address, a);

        let older_oid = ObjectId::parse_str("000000000000000000000001").unwrap();
        topology.apply_server_description_changed(primary_desc(&b, 1, older_oid));

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.primary().unwrap().address, a);
        assert_eq!(topology.servers().get(&b).unwrap().server_type, ServerType::Unknown);
    }

    /// Testable property #5 — idempotence: applying the same change twice leaves the topology
    /// unchanged after the first application.
    #[test]
    fn reapplying_the_same_primary_description_is_idempotent() {
        let a = addr("a:27017");
        let mut topology = TopologyDescription::new(&[a.clone()], Some("rs0".to_string()), false, false);
        let oid = ObjectId::parse_str("000000000000000000000001").unwrap();

        topology.apply_server_description_changed(primary_desc(&a, 1, oid));
        let after_first = topology.servers().get(&a).unwrap().server_type;

        topology.apply_server_description_changed(primary_desc(&a, 1, oid));
        let after_second = topology.servers().get(&a).unwrap().server_type;

        assert_eq!(after_first, after_second);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    /// §3 invariant: a data-bearing server below the minimum supported wire version sets
    /// `compatibility_error` and the topology rejects operations.
    #[test]
    fn incompatible_wire_version_sets_compatibility_error() {
        let a = addr("a:27017");
        let mut topology = TopologyDescription::new(&[a.clone()], None, true, false);

        let mut desc = ServerDescription::unknown(a.clone());
        desc.server_type = ServerType::Standalone;
        desc.max_wire_version = MIN_SUPPORTED_WIRE_VERSION - 1;
        topology.apply_server_description_changed(desc);

        assert!(topology.compatibility_error().is_some());
        assert!(topology.compatibility_result().is_err());
    }

    /// A server whose `set_name` disagrees with the topology's is removed (§4.E).
    #[test]
    fn mismatched_set_name_removes_the_server() {
        let a = addr("a:27017");
        let b = addr("b:27017");
        let mut topology = TopologyDescription::new(&[a.clone(), b.clone()], Some("rs0".to_string()), false, false);

        let oid = ObjectId::parse_str("000000000000000000000001").unwrap();
        topology.apply_server_description_changed(primary_desc(&a, 1, oid));

        let mut wrong_set = ServerDescription::unknown(b.clone());
        wrong_set.server_type = ServerType::RSSecondary;
        wrong_set.set_name = Some("different-rs".to_string());
        topology.apply_server_description_changed(wrong_set);

        assert!(!topology.servers().contains_key(&b));
    }

    /// Arriving hosts listed by the primary are discovered; hosts no longer listed are dropped
    /// (§4.E).
    #[test]
    fn primary_host_list_drives_membership_sync() {
        let a = addr("a:27017");
        let c = addr("c:27017");
        let mut topology = TopologyDescription::new(&[a.clone()], Some("rs0".to_string()), false, false);

        let oid = ObjectId::parse_str("000000000000000000000001").unwrap();
        let mut primary = primary_desc(&a, 1, oid);
        primary.hosts = vec![a.clone(), c.clone()];
        topology.apply_server_description_changed(primary);

        assert!(topology.servers().contains_key(&c));
        assert_eq!(topology.servers().get(&c).unwrap().server_type, ServerType::Unknown);
    }
}

