//! Small BSON helpers shared by the options types and the wire codec.
//!
//! Encoding/decoding of user-facing document *types* is out of scope for this crate (it's a
//! collaborator layered on top); what lives here is just enough BSON plumbing for the wire
//! codec to frame command/reply documents and for options structs to serialize durations the
//! way the server expects them.

use std::time::Duration;

use bson::{Bson, Document};
use serde::{Deserialize, Deserializer, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

pub(crate) fn serialize_duration_as_i64_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) => serializer.serialize_i64(duration.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_from_u64_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// The number of bytes a document occupies on the wire, including its own length prefix.
/// Used to keep bulk write payloads under `maxBsonObjectSize`/`maxMessageSizeBytes`.
pub fn doc_size_bytes(doc: &Document) -> usize {
    4 + doc
        .iter()
        .map(|(key, val)| 1 + key.len() + 1 + size_bytes(val))
        .sum::<usize>()
        + 1
}

pub fn size_bytes(val: &Bson) -> usize {
    match val {
        Bson::Double(_) => 8,
        Bson::String(s) => 4 + s.len() + 1,
        Bson::Array(arr) => doc_size_bytes(&arr.iter().cloned().enumerate().fold(
            Document::new(),
            |mut d, (i, v)| {
                d.insert(i.to_string(), v);
                d
            },
        )),
        Bson::Document(d) => doc_size_bytes(d),
        Bson::Boolean(_) => 1,
        Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey => 0,
        Bson::RegularExpression(re) => re.pattern.len() + 1 + re.options.len() + 1,
        Bson::JavaScriptCode(s) => 4 + s.len() + 1,
        Bson::JavaScriptCodeWithScope(code) => 4 + 4 + code.code.len() + 1 + doc_size_bytes(&code.scope),
        Bson::Int32(_) => 4,
        Bson::Int64(_) => 8,
        Bson::Timestamp(_) => 8,
        Bson::Binary(b) => 4 + 1 + b.bytes.len(),
        Bson::ObjectId(_) => 12,
        Bson::DateTime(_) => 8,
        Bson::Symbol(s) => 4 + s.len() + 1,
        Bson::Decimal128(_) => 16,
        Bson::DbPointer(_) => 12 + 4,
    }
}

/// Whether a command reply's `ok` field is truthy. The server represents it as a double, an
/// int32, or (rarely) a bool depending on driver/version quirks; this accepts all three.
pub fn reply_is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(d)) => *d == 1.0,
        Some(Bson::Int32(i)) => *i == 1,
        Some(Bson::Int64(i)) => *i == 1,
        Some(Bson::Boolean(b)) => *b,
        _ => false,
    }
}

/// Reads one length-prefixed BSON document from an async byte stream, the way a wire-protocol
/// section body is framed: a leading `i32` length followed by `length - 4` more bytes.
pub(crate) async fn decode_document<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Document> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let length = i32::from_le_bytes(len_bytes);

    let mut bytes = Vec::with_capacity(length.max(4) as usize);
    bytes.extend_from_slice(&len_bytes);
    let remaining = (length - 4).max(0) as usize;
    let mut rest = vec![0u8; remaining];
    reader.read_exact(&mut rest).await?;
    bytes.extend_from_slice(&rest);

    Ok(Document::from_reader(&mut bytes.as_slice())?)
}

pub(crate) async fn encode_document<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    document: &Document,
) -> Result<()> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
