//! The `hello` handshake a fresh connection runs before it becomes usable (§4.B step 1, §6).

use std::time::Instant;

use bson::{doc, Bson, Document};
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    cmap::conn::wire,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{ServerDescription, ServerType},
};

lazy_static! {
    /// The static part of the handshake's `client` metadata field (§6: `client: {driver: {...},
    /// os: {...}, platform: "..."}`). `appName`, when set, is layered on per-client.
    static ref BASE_CLIENT_METADATA: Document = doc! {
        "driver": {
            "name": "mongo-core-driver",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "os": {
            "type": std::env::consts::OS,
            "architecture": std::env::consts::ARCH,
        },
        "platform": format!("rustc"),
    };
}

/// Capabilities a connection learned about its server during the handshake (§3 `Connection`
/// caches these so later commands don't need to re-derive them from the last hello reply).
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamDescription {
    pub(crate) max_wire_version: i32,
    pub(crate) max_bson_object_size: i64,
    pub(crate) max_message_size_bytes: i64,
    pub(crate) max_write_batch_size: i64,
    pub(crate) logical_session_timeout_minutes: Option<i64>,
}

impl Default for StreamDescription {
    fn default() -> Self {
        Self {
            max_wire_version: 0,
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: 48 * 1024 * 1024,
            max_write_batch_size: 100_000,
            logical_session_timeout_minutes: None,
        }
    }
}

fn build_hello_command(app_name: Option<&str>, legacy: bool) -> Document {
    let mut metadata = BASE_CLIENT_METADATA.clone();
    if let Some(app_name) = app_name {
        metadata.insert("application", doc! { "name": app_name });
    }

    let command_name = if legacy { "isMaster" } else { "hello" };
    doc! {
        command_name: 1,
        "client": metadata,
        "helloOk": true,
        "compression": Bson::Array(Vec::new()),
    }
}

/// Runs the `hello` (falling back to legacy `isMaster`) exchange described in §4.B/§4.D step 1
/// and builds both the connection's cached [`StreamDescription`] and the fresh
/// [`ServerDescription`] the monitor (or, for a non-monitoring connection, the pool) publishes.
pub(crate) async fn perform_handshake<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
    address: &ServerAddress,
    app_name: Option<&str>,
) -> Result<(StreamDescription, ServerDescription)> {
    let start = Instant::now();
    let mut command = build_hello_command(app_name, false);
    command.insert("$db", "admin");
    let request = wire::Request::from_command(command.clone());

    let request_id = request.write_to(stream).await.map_err(|e| handshake_err(address, e))?;
    let reply = wire::Reply::read_from(stream).await.map_err(|e| handshake_err(address, e))?;
    if reply.response_to != request_id {
        return Err(ErrorKind::Handshake {
            message: format!("hello reply responseTo did not match request id for {address}"),
        }
        .into());
    }
    let reply_doc = reply.command_document().map_err(|e| handshake_err(address, e))?;

    if !crate::bson_util::reply_is_ok(&reply_doc) {
        return Err(ErrorKind::Handshake {
            message: format!("hello command failed for {address}: {reply_doc:?}"),
        }
        .into());
    }

    let rtt = start.elapsed();
    parse_hello_reply(address, &reply_doc, rtt)
}

/// Builds the periodic monitoring `hello` (§4.D step 1). When a `topology_version` from a
/// previous reply is supplied, it's echoed back with `maxAwaitTimeMS` so a server that supports
/// the streaming protocol holds the response open until something actually changes instead of
/// replying immediately every heartbeat.
pub(crate) fn build_monitoring_command(app_name: Option<&str>, topology_version: Option<Document>) -> Document {
    let mut command = build_hello_command(app_name, false);
    command.insert("$db", "admin");
    if let Some(topology_version) = topology_version {
        command.insert("topologyVersion", topology_version);
        command.insert("maxAwaitTimeMS", 10_000i64);
    }
    command
}

fn handshake_err(address: &ServerAddress, cause: Error) -> Error {
    ErrorKind::Handshake {
        message: format!("handshake with {address} failed: {cause}"),
    }
    .into()
}

/// Parses a `hello`/legacy `isMaster` reply into a [`StreamDescription`] and a fresh
/// [`ServerDescription`] (§4.D step 3). Shared by the handshake path and the monitor's
/// heartbeat loop, since both consume the same reply shape.
pub(crate) fn parse_hello_reply(
    address: &ServerAddress,
    reply: &Document,
    round_trip_time: std::time::Duration,
) -> Result<(StreamDescription, ServerDescription)> {
    let max_wire_version = reply.get_i32("maxWireVersion").unwrap_or(0);
    // The compatibility check itself (§3 `TopologyDescription::compatibility_error`) lives in
    // sdam, since it depends on comparing every data-bearing server, not just this one.

    let stream_description = StreamDescription {
        max_wire_version,
        max_bson_object_size: reply.get_i64("maxBsonObjectSize").unwrap_or(16 * 1024 * 1024),
        max_message_size_bytes: reply.get_i64("maxMessageSizeBytes").unwrap_or(48 * 1024 * 1024),
        max_write_batch_size: reply.get_i64("maxWriteBatchSize").unwrap_or(100_000),
        logical_session_timeout_minutes: reply.get_i64("logicalSessionTimeoutMinutes").ok(),
    };

    let server_type = classify_server_type(reply);

    let hosts = reply
        .get_array("hosts")
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| ServerAddress::parse(s).ok())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let tags = reply
        .get_document("tags")
        .map(|doc| {
            doc.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let primary = reply
        .get_str("primary")
        .ok()
        .and_then(|s| ServerAddress::parse(s).ok());

    let service_id = reply.get_object_id("serviceId").ok().map(|oid| {
        // Collapsed to a small hashable id for the pool's generation map (§3 `service_id`); the
        // ObjectId's bytes are stable for the lifetime of the backend mongos.
        u32::from_be_bytes(oid.bytes()[0..4].try_into().unwrap())
    });

    Ok((
        stream_description,
        ServerDescription {
            address: address.clone(),
            server_type,
            round_trip_time: Some(round_trip_time),
            last_update_time: bson::DateTime::now(),
            last_write_date: reply
                .get_document("lastWrite")
                .ok()
                .and_then(|d| d.get_datetime("lastWriteDate").ok())
                .copied(),
            max_wire_version,
            tags,
            set_name: reply.get_str("setName").ok().map(|s| s.to_string()),
            set_version: reply.get_i32("setVersion").ok(),
            election_id: reply.get_object_id("electionId").ok(),
            primary,
            hosts,
            logical_session_timeout_minutes: reply.get_i64("logicalSessionTimeoutMinutes").ok(),
            hello_ok: reply.get_bool("helloOk").unwrap_or(false),
            topology_version: reply.get_document("topologyVersion").ok().cloned(),
            service_id,
            error: None,
        },
    ))
}

fn classify_server_type(reply: &Document) -> ServerType {
    if reply.get_bool("isreplicaset").unwrap_or(false) {
        return ServerType::RSGhost;
    }
    if let Ok(msg) = reply.get_str("msg") {
        if msg == "isdbgrid" {
            return ServerType::Mongos;
        }
    }
    if reply.get_str("setName").is_ok() {
        if reply.get_bool("ismaster").unwrap_or(false) || reply.get_bool("isWritablePrimary").unwrap_or(false) {
            return ServerType::RSPrimary;
        }
        if reply.get_bool("hidden").unwrap_or(false) {
            return ServerType::RSOther;
        }
        if reply.get_bool("secondary").unwrap_or(false) {
            return ServerType::RSSecondary;
        }
        if reply.get_bool("arbiterOnly").unwrap_or(false) {
            return ServerType::RSArbiter;
        }
        return ServerType::RSOther;
    }
    ServerType::Standalone
}
