//! Server Discovery and Monitoring (§4.D–§4.F): the per-server monitor loop, the topology
//! description and its SDAM transition rules, the server selector, and the [`state::Topology`]
//! coordinator that ties them to the per-server connection pools.

pub(crate) mod description;
pub(crate) mod message_manager;
pub(crate) mod monitor;
pub(crate) mod selection;
pub(crate) mod state;

pub use description::{ServerDescription, ServerType, TopologyDescription, TopologyType};
pub use selection::ServerInfo;
pub use state::{Topology, TransactionSupportStatus};
