//! A single authenticated, stream-bound channel that issues one command at a time (§4.B).

pub(crate) mod handshake;
pub(crate) mod wire;

pub(crate) use handshake::StreamDescription;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use bson::Document;
use tokio::io::BufStream;

use crate::{
    cmap::PoolGeneration,
    error::{Error, ErrorKind, Result},
    event::command::{redact, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent, ConnectionInfo},
    event::EventBus,
    options::ServerAddress,
    runtime::AsyncStream,
    sdam::ServerDescription,
    RUNTIME,
};

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

/// The lifecycle states named in §4.B. `Pending` only exists logically (a [`Connection`] value
/// is never observed in that state by anything outside [`Connection::establish`]); the rest are
/// tracked so the pool and the executor can tell what's safe to do with a given instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Available,
    InUse,
    Closed,
}

/// An authenticated connection to one server, bound to a single byte stream (§3 `Connection`,
/// §4.B). Never multiplexes: a caller must have exclusive access, enforced by the pool's
/// checkout/checkin discipline rather than by any lock inside this type.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) service_id: Option<u32>,
    stream: BufStream<AsyncStream>,
    pub(crate) stream_description: StreamDescription,
    created_at: Instant,
    last_used_at: Instant,
    state: ConnectionState,
}

impl Connection {
    /// Opens a socket, negotiates TLS if configured (external collaborator, §1), and exchanges
    /// a `hello` to populate this connection's [`StreamDescription`] and the fresh
    /// [`ServerDescription`] the monitor will publish. Authentication (SCRAM/X.509, also an
    /// external collaborator) runs after the hello and before this returns.
    pub(crate) async fn establish(
        address: ServerAddress,
        generation: PoolGeneration,
        connect_timeout: Option<Duration>,
        app_name: Option<&str>,
    ) -> Result<(Self, ServerDescription)> {
        let stream = AsyncStream::connect(&address, connect_timeout).await.map_err(|e| {
            Error::from(ErrorKind::Handshake {
                message: format!("failed to connect to {address}: {e}"),
            })
        })?;
        let mut stream = BufStream::new(stream);

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        let (stream_description, server_description) =
            handshake::perform_handshake(&mut stream, &address, app_name).await?;

        // Credential exchange (SCRAM-SHA-256/X.509) is an external collaborator (§1); a real
        // deployment configured with a credential would run it here, between hello and this
        // connection becoming Available.

        // The handshake is what reveals `service_id` (load-balanced mode only), so the
        // connection's generation is only known once it's resolved against the pool's snapshot.
        let service_id = server_description.service_id;
        let generation = generation.value_for(service_id);

        let now = Instant::now();
        Ok((
            Self {
                id,
                address,
                generation,
                service_id,
                stream,
                stream_description,
                created_at: now,
                last_used_at: now,
                state: ConnectionState::Available,
            },
            server_description,
        ))
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(address: ServerAddress, generation: u32, max_wire_version: i32) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            address,
            generation,
            service_id: None,
            stream: BufStream::new(AsyncStream::null()),
            stream_description: StreamDescription {
                max_wire_version,
                max_bson_object_size: 16 * 1024 * 1024,
                max_message_size_bytes: 48 * 1024 * 1024,
                max_write_batch_size: 100_000,
                logical_session_timeout_minutes: Some(30),
            },
            created_at: now,
            last_used_at: now,
            state: ConnectionState::Available,
        }
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(crate) fn is_stale(&self, current_generation: &PoolGeneration) -> bool {
        self.generation != current_generation.value_for(self.service_id)
    }

    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match max_idle_time {
            Some(max_idle) => self.last_used_at.elapsed() >= max_idle,
            None => false,
        }
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.state = ConnectionState::InUse;
    }

    pub(crate) fn mark_checked_in(&mut self) {
        self.state = ConnectionState::Available;
        self.last_used_at = Instant::now();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub(crate) fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Runs exactly one command and returns its raw reply document. The caller is responsible
    /// for classifying the reply (command error vs. success) and for treating any `Err` here as
    /// fatal to the connection (§4.B: "Network errors are fatal to the connection").
    pub(crate) async fn run_command(
        &mut self,
        db: &str,
        mut command: Document,
        timeout: Option<Duration>,
        events: Option<&EventBus>,
    ) -> Result<Document> {
        command.insert("$db", db);
        let command_name = command
            .iter()
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| "unknown".to_string());

        // Generated up front so the same id appears in the Started event and in whichever of
        // Succeeded/Failed follows (§4.I: command-monitoring events must correlate by request id).
        let request_id = wire::next_request_id();
        let request = wire::Request::from_command(command.clone()).with_request_id(request_id);
        let started = Instant::now();

        if let Some(events) = events {
            events.command_started(CommandStartedEvent {
                command: redact(&command_name, &command),
                db: db.to_string(),
                command_name: command_name.clone(),
                request_id,
                connection: self.info(),
            });
        }

        let result = self.exchange(request, timeout).await;

        match result {
            Ok((request_id, reply)) => {
                if crate::bson_util::reply_is_ok(&reply) {
                    if let Some(events) = events {
                        events.command_succeeded(CommandSucceededEvent {
                            duration: started.elapsed(),
                            reply: redact(&command_name, &reply),
                            command_name: command_name.clone(),
                            request_id,
                            connection: self.info(),
                        });
                    }
                    Ok(reply)
                } else {
                    let err: Error = crate::error::command_error_from_reply(&reply, self.stream_description.max_wire_version);
                    if let Some(events) = events {
                        events.command_failed(CommandFailedEvent {
                            duration: started.elapsed(),
                            command_name: command_name.clone(),
                            failure: err.clone(),
                            request_id,
                            connection: self.info(),
                        });
                    }
                    Err(err)
                }
            }
            Err(err) => {
                if let Some(events) = events {
                    events.command_failed(CommandFailedEvent {
                        duration: started.elapsed(),
                        command_name,
                        failure: err.clone(),
                        request_id,
                        connection: self.info(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn exchange(&mut self, request: wire::Request, timeout: Option<Duration>) -> Result<(i32, Document)> {
        let fut = async {
            let request_id = request.write_to(&mut self.stream).await?;
            let reply = wire::Reply::read_from(&mut self.stream).await?;
            if reply.response_to != request_id {
                return Err(Error::from(ErrorKind::InvalidResponse {
                    message: format!(
                        "reply responseTo {} did not match request id {}",
                        reply.response_to, request_id
                    ),
                }));
            }
            Ok((request_id, reply.command_document()?))
        };

        match timeout {
            Some(timeout) => RUNTIME.timeout(timeout, fut).await,
            None => fut.await,
        }
    }
}
