//! Exercises the public `Client` surface end to end against a fake TCP server that speaks just
//! enough OP_MSG to complete a handshake and answer a command. Grounded in the teacher's
//! `tests/` layout (`tests/client/`, `tests/cmap/`), simplified here since the JSON spec-test
//! corpus those directories run is explicitly out of scope (spec §1: "extensive spec-conformance
//! tests" is bundled, not core).
//!
//! This crate's wire codec (`cmap::conn::wire`) is `pub(crate)`, so this test speaks OP_MSG at
//! the byte level itself rather than reusing it — the same boundary a real driver's integration
//! tests cross when they drive a fake `mongod` over a raw socket.

use std::time::Duration;

use bson::{doc, Document};
use mongo_core_driver::{Client, ClientOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OP_MSG: i32 = 2013;

async fn read_request(stream: &mut TcpStream) -> (i32, Document) {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.unwrap();
    let length = i32::from_le_bytes(header[0..4].try_into().unwrap());
    let request_id = i32::from_le_bytes(header[4..8].try_into().unwrap());
    let op_code = i32::from_le_bytes(header[12..16].try_into().unwrap());
    assert_eq!(op_code, OP_MSG);

    let mut rest = vec![0u8; (length - 16) as usize];
    stream.read_exact(&mut rest).await.unwrap();

    // flagBits(4) + kind byte(1) + one BSON document; good enough for the single-section
    // commands this fake server needs to understand.
    let doc_bytes = &rest[5..];
    let document = Document::from_reader(doc_bytes).unwrap();
    (request_id, document)
}

async fn write_reply(stream: &mut TcpStream, response_to: i32, document: &Document) {
    let mut doc_bytes = Vec::new();
    document.to_writer(&mut doc_bytes).unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // flagBits
    body.push(0u8); // section kind 0
    body.extend_from_slice(&doc_bytes);

    let length = 16 + body.len() as i32;
    let mut frame = Vec::with_capacity(length as usize);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&1i32.to_le_bytes()); // requestID
    frame.extend_from_slice(&response_to.to_le_bytes());
    frame.extend_from_slice(&OP_MSG.to_le_bytes());
    frame.extend_from_slice(&body);

    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();
}

fn hello_reply() -> Document {
    doc! {
        "ok": 1.0,
        "ismaster": true,
        "isWritablePrimary": true,
        "maxWireVersion": 17,
        "maxBsonObjectSize": 16_777_216i64,
        "maxMessageSizeBytes": 48_000_000i64,
        "maxWriteBatchSize": 100_000i64,
        "logicalSessionTimeoutMinutes": 30i64,
        "helloOk": true,
        "localTime": bson::DateTime::now(),
    }
}

/// Accepts one connection and answers every command on it with a canned reply, looping until
/// the client disconnects. Standalone deployments only ever need one connection for this test
/// (min_pool_size defaults to 0), but the loop tolerates more than one being opened.
async fn run_fake_server(listener: TcpListener) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let (request_id, command) = read_request(&mut stream).await;
                let is_hello = command.contains_key("hello") || command.contains_key("isMaster");
                let reply = if is_hello { hello_reply() } else { doc! { "ok": 1.0 } };
                write_reply(&mut stream, request_id, &reply).await;
            }
        });
    }
}

async fn start_fake_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_fake_server(listener));
    addr
}

#[tokio::test]
async fn run_command_round_trips_against_a_fake_standalone() {
    let addr = start_fake_server().await;

    let mut options = ClientOptions::parse(&format!("mongodb://{}:{}/?directConnection=true", addr.ip(), addr.port())).unwrap();
    options.server_selection_timeout = Duration::from_secs(5);
    let client = Client::with_options(options).unwrap();

    let reply = client.run_command("admin", doc! { "ping": 1 }, None).await.unwrap();
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    client.shutdown().await;
}

#[tokio::test]
async fn explicit_session_commands_carry_a_lsid() {
    let addr = start_fake_server().await;

    let mut options = ClientOptions::parse(&format!("mongodb://{}:{}/?directConnection=true", addr.ip(), addr.port())).unwrap();
    options.server_selection_timeout = Duration::from_secs(5);
    let client = Client::with_options(options).unwrap();

    let mut session = client.start_session(None).await;
    let reply = client
        .run_command("admin", doc! { "ping": 1 }, Some(&mut session))
        .await
        .unwrap();
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);

    client.shutdown().await;
}
