//! The data model of §3: `ServerDescription` and `TopologyDescription`, plus the SDAM
//! transition rules of §4.E.

pub(crate) mod server;
pub(crate) mod topology;

pub use server::{ServerDescription, ServerType};
pub use topology::{TopologyDescription, TopologyType};
