//! Command-monitoring events, emitted around every wire exchange (§4.I).

use std::time::Duration;

use bson::Document;

use crate::{error::Error, options::ServerAddress};

/// A command whose payload has been redacted because it carries credentials.
const REDACTED_COMMANDS: &[&str] = &["saslstart", "saslcontinue", "authenticate", "getnonce"];

pub(crate) fn redact(command_name: &str, command: &Document) -> Document {
    if REDACTED_COMMANDS.contains(&command_name.to_ascii_lowercase().as_str()) {
        Document::new()
    } else {
        command.clone()
    }
}

/// Information identifying the connection a command ran on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub address: ServerAddress,
    pub connection_id: u32,
}

#[derive(Clone, Debug)]
pub struct CommandStartedEvent {
    pub command: Document,
    pub db: String,
    pub command_name: String,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

#[derive(Clone, Debug)]
pub struct CommandSucceededEvent {
    pub duration: Duration,
    pub reply: Document,
    pub command_name: String,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

#[derive(Clone, Debug)]
pub struct CommandFailedEvent {
    pub duration: Duration,
    pub command_name: String,
    pub failure: Error,
    pub request_id: i32,
    pub connection: ConnectionInfo,
}

/// Implemented by applications that want to observe the commands a client sends.
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}
