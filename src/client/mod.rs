//! The public client facade (§3 `Client`).

pub(crate) mod executor;

use std::sync::Arc;

use bson::Document;

use crate::{
    error::Result,
    event::EventBus,
    operation::Operation,
    options::{ClientOptions, SessionOptions},
    session::ClientSession,
};

use executor::Executor;

/// The entry point for talking to a MongoDB deployment (§3 `Client`). Cheap to clone: it's a
/// thin handle around an `Arc<Executor>`, which owns the topology and session pool shared by
/// every clone.
#[derive(Clone)]
pub struct Client {
    executor: Arc<Executor>,
}

impl Client {
    /// Parses `uri` (§6) and connects (§4.D starts monitoring every seed immediately, in the
    /// background).
    pub fn with_uri_str(uri: &str) -> Result<Self> {
        Self::with_options(ClientOptions::parse(uri)?)
    }

    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.hosts.first().ok_or_else(|| crate::error::Error::invalid_argument("no hosts configured"))?;
        Ok(Self::with_options_and_events(options, None))
    }

    /// Like [`Client::with_options`], additionally wiring up an [`EventBus`] so command and SDAM
    /// events (§4.J) reach the handlers registered on it.
    pub fn with_options_and_events(options: ClientOptions, events: Option<EventBus>) -> Self {
        Self {
            executor: Executor::new(options, events),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        self.executor.options()
    }

    /// Starts an explicit logical session (§3 `Session`, §4.G). Causally consistent by default;
    /// pass `options` to request a snapshot session or override the defaults applied to
    /// transactions started on it.
    pub async fn start_session(&self, options: Option<SessionOptions>) -> ClientSession {
        self.executor.start_session(options).await
    }

    /// Runs an ad hoc command against `db`, optionally scoped to `session` (§4.I). Building a
    /// CRUD/aggregation surface in terms of this is an external collaborator's job (§1); this is
    /// the low-level escape hatch every such surface would be built on.
    pub async fn run_command(&self, db: &str, command: Document, session: Option<&mut ClientSession>) -> Result<Document> {
        let name = command.iter().next().map(|(k, _)| k.clone()).unwrap_or_else(|| "unknown".to_string());
        self.execute(Operation::new(name, db, command), session).await
    }

    /// Runs a fully-described [`Operation`] (§3, §4.I): the general entry point `run_command`
    /// is a convenience wrapper around.
    pub async fn execute(&self, operation: Operation, session: Option<&mut ClientSession>) -> Result<Document> {
        self.executor.execute(operation, session).await
    }

    /// Closes every connection pool and stops every monitor (§4.D: a monitor loop runs "until
    /// the topology it belongs to is dropped").
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("options", self.options()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_options_rejects_empty_host_list() {
        let options = ClientOptions {
            hosts: Vec::new(),
            ..Default::default()
        };
        assert!(Client::with_options(options).is_err());
    }
}
