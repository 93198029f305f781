//! Connection-pool events (§4.J).

use crate::options::ServerAddress;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolCreatedEvent {
    pub address: ServerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolReadyEvent {
    pub address: ServerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolClearedEvent {
    pub address: ServerAddress,
    pub service_id: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolClosedEvent {
    pub address: ServerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionCreatedEvent {
    pub address: ServerAddress,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionReadyEvent {
    pub address: ServerAddress,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    Stale,
    Idle,
    Error,
    Dropped,
    PoolClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClosedEvent {
    pub address: ServerAddress,
    pub connection_id: u32,
    pub reason: ConnectionClosedReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionCheckoutStartedEvent {
    pub address: ServerAddress,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionCheckoutFailedReason {
    PoolClosed,
    Timeout,
    ConnectionError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionCheckoutFailedEvent {
    pub address: ServerAddress,
    pub reason: ConnectionCheckoutFailedReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionCheckedOutEvent {
    pub address: ServerAddress,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionCheckedInEvent {
    pub address: ServerAddress,
    pub connection_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! impl_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for CmapEvent {
            fn from(event: $ty) -> Self {
                CmapEvent::$variant(event)
            }
        }
    };
}

impl_from!(PoolCreated, PoolCreatedEvent);
impl_from!(PoolReady, PoolReadyEvent);
impl_from!(PoolCleared, PoolClearedEvent);
impl_from!(PoolClosed, PoolClosedEvent);
impl_from!(ConnectionCreated, ConnectionCreatedEvent);
impl_from!(ConnectionReady, ConnectionReadyEvent);
impl_from!(ConnectionClosed, ConnectionClosedEvent);
impl_from!(ConnectionCheckoutStarted, ConnectionCheckoutStartedEvent);
impl_from!(ConnectionCheckoutFailed, ConnectionCheckoutFailedEvent);
impl_from!(ConnectionCheckedOut, ConnectionCheckedOutEvent);
impl_from!(ConnectionCheckedIn, ConnectionCheckedInEvent);

pub trait CmapEventHandler: Send + Sync {
    fn handle(&self, event: CmapEvent);
}
