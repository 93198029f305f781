//! The event bus (§4.J): a fan-out publisher for command-monitoring and SDAM events.
//!
//! Subscribers are trait objects registered on an [`EventBus`], which a caller hands to
//! [`Client::with_options_and_events`](crate::Client::with_options_and_events); each publish call
//! invokes every registered handler in turn and in the order published, so a single subscriber
//! never sees events out of order even though many publishers (the executor, each server monitor,
//! each pool) may be calling into the bus concurrently.

pub mod cmap;
pub mod command;
pub mod sdam;

use std::sync::Arc;

pub use cmap::CmapEventHandler;
pub use command::CommandEventHandler;
pub use sdam::SdamEventHandler;

/// Holds the handlers registered for one client and fans events out to them.
#[derive(Clone, Default)]
pub struct EventBus {
    command_handlers: Vec<Arc<dyn CommandEventHandler>>,
    cmap_handlers: Vec<Arc<dyn CmapEventHandler>>,
    sdam_handlers: Vec<Arc<dyn SdamEventHandler>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("command_handlers", &self.command_handlers.len())
            .field("cmap_handlers", &self.cmap_handlers.len())
            .field("sdam_handlers", &self.sdam_handlers.len())
            .finish()
    }
}

impl EventBus {
    pub fn register_command_handler(&mut self, handler: Arc<dyn CommandEventHandler>) {
        self.command_handlers.push(handler);
    }

    pub fn register_cmap_handler(&mut self, handler: Arc<dyn CmapEventHandler>) {
        self.cmap_handlers.push(handler);
    }

    pub fn register_sdam_handler(&mut self, handler: Arc<dyn SdamEventHandler>) {
        self.sdam_handlers.push(handler);
    }

    pub(crate) fn command_started(&self, event: command::CommandStartedEvent) {
        for handler in &self.command_handlers {
            handler.handle_command_started_event(event.clone());
        }
    }

    pub(crate) fn command_succeeded(&self, event: command::CommandSucceededEvent) {
        for handler in &self.command_handlers {
            handler.handle_command_succeeded_event(event.clone());
        }
    }

    pub(crate) fn command_failed(&self, event: command::CommandFailedEvent) {
        for handler in &self.command_handlers {
            handler.handle_command_failed_event(event.clone());
        }
    }

    pub(crate) fn cmap<E: Into<cmap::CmapEvent>>(&self, event: E) {
        let event = event.into();
        for handler in &self.cmap_handlers {
            handler.handle(event.clone());
        }
    }

    pub(crate) fn sdam<E: Into<sdam::SdamEvent>>(&self, event: E) {
        let event = event.into();
        for handler in &self.sdam_handlers {
            handler.handle(event.clone());
        }
    }
}
