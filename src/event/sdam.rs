//! Server Discovery and Monitoring events (§4.J).

use crate::{
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription, TopologyType},
};

#[derive(Clone, Debug)]
pub struct TopologyOpeningEvent {
    pub topology_id: uuid::Uuid,
}

#[derive(Clone, Debug)]
pub struct ServerOpeningEvent {
    pub address: ServerAddress,
    pub topology_id: uuid::Uuid,
}

#[derive(Clone, Debug)]
pub struct ServerDescriptionChangedEvent {
    pub address: ServerAddress,
    pub topology_id: uuid::Uuid,
    pub previous_description: ServerDescription,
    pub new_description: ServerDescription,
}

#[derive(Clone, Debug)]
pub struct ServerClosedEvent {
    pub address: ServerAddress,
    pub topology_id: uuid::Uuid,
}

#[derive(Clone, Debug)]
pub struct TopologyDescriptionChangedEvent {
    pub topology_id: uuid::Uuid,
    pub previous_description: TopologyDescriptionSummary,
    pub new_description: TopologyDescriptionSummary,
}

/// A cheap summary used in events, rather than cloning the full server map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyDescriptionSummary {
    pub topology_type: TopologyType,
    pub server_addresses: Vec<ServerAddress>,
}

impl From<&TopologyDescription> for TopologyDescriptionSummary {
    fn from(desc: &TopologyDescription) -> Self {
        Self {
            topology_type: desc.topology_type(),
            server_addresses: desc.servers().keys().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TopologyClosedEvent {
    pub topology_id: uuid::Uuid,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SdamEvent {
    TopologyOpening(TopologyOpeningEvent),
    ServerOpening(ServerOpeningEvent),
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyClosed(TopologyClosedEvent),
}

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for SdamEvent {
            fn from(event: $ty) -> Self {
                SdamEvent::$variant(event)
            }
        }
    };
}

impl_from!(TopologyOpening, TopologyOpeningEvent);
impl_from!(ServerOpening, ServerOpeningEvent);
impl_from!(ServerClosed, ServerClosedEvent);
impl_from!(TopologyClosed, TopologyClosedEvent);

impl From<ServerDescriptionChangedEvent> for SdamEvent {
    fn from(event: ServerDescriptionChangedEvent) -> Self {
        SdamEvent::ServerDescriptionChanged(Box::new(event))
    }
}

impl From<TopologyDescriptionChangedEvent> for SdamEvent {
    fn from(event: TopologyDescriptionChangedEvent) -> Self {
        SdamEvent::TopologyDescriptionChanged(Box::new(event))
    }
}

pub trait SdamEventHandler: Send + Sync {
    fn handle(&self, event: SdamEvent);
}
