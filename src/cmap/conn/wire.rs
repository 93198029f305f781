//! The OP_MSG wire codec (§4.A). Pure and synchronous in the sense the spec asks for: framing
//! is computed in memory, with the actual byte transfer left to whatever `AsyncRead`/`AsyncWrite`
//! the connection hands in. One request/reply pair is one logical command.

use std::sync::atomic::{AtomicI32, Ordering};

use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    bson_util,
    error::{ErrorKind, Result},
};

const OP_MSG: i32 = 2013;
const HEADER_LEN: i32 = 16;

const CHECKSUM_PRESENT: u32 = 0b001;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Every command gets a fresh, monotonically increasing request id (§4.B: "maintains a
/// monotonic request_id counter").
pub(crate) fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Header {
    length: i32,
    request_id: i32,
    response_to: i32,
    op_code: i32,
}

impl Header {
    async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.length.to_le_bytes()).await?;
        writer.write_all(&self.request_id.to_le_bytes()).await?;
        writer.write_all(&self.response_to.to_le_bytes()).await?;
        writer.write_all(&self.op_code.to_le_bytes()).await?;
        Ok(())
    }

    async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;
        let length = i32::from_le_bytes(buf);
        reader.read_exact(&mut buf).await?;
        let request_id = i32::from_le_bytes(buf);
        reader.read_exact(&mut buf).await?;
        let response_to = i32::from_le_bytes(buf);
        reader.read_exact(&mut buf).await?;
        let op_code = i32::from_le_bytes(buf);
        if op_code != OP_MSG {
            return Err(ErrorKind::InvalidResponse {
                message: format!("unknown wire protocol opcode {op_code}"),
            }
            .into());
        }
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

/// One section of an OP_MSG body: kind 0 carries the command document itself, kind 1 carries a
/// named sequence of documents (used to offload a bulk write's payload array, §4.A).
#[derive(Debug, Clone)]
pub(crate) enum Section {
    Body(Document),
    DocumentSequence { identifier: String, documents: Vec<Document> },
}

/// A fully-assembled OP_MSG request, ready to be written to a connection's stream.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) sections: Vec<Section>,
    request_id: Option<i32>,
    response_to: i32,
}

impl Request {
    pub(crate) fn from_command(command: Document) -> Self {
        Self {
            sections: vec![Section::Body(command)],
            request_id: None,
            response_to: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn responding_to(mut self, response_to: i32) -> Self {
        self.response_to = response_to;
        self
    }

    /// Pins this request to a caller-chosen id instead of one `write_to` would generate, so the
    /// caller can use the same id in a `CommandStartedEvent` emitted before the bytes go out
    /// (§4.I command-monitoring: start/end events must carry matching `request_id`s).
    pub(crate) fn with_request_id(mut self, request_id: i32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub(crate) fn with_document_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sections.push(Section::DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    /// Encodes this request and writes it to `writer`, returning the request id used (so the
    /// caller can match it against the reply's `response_to`).
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(&self, writer: &mut W) -> Result<i32> {
        let request_id = self.request_id.unwrap_or_else(next_request_id);

        let mut body = Vec::new();
        for section in &self.sections {
            match section {
                Section::Body(doc) => {
                    body.push(0u8);
                    let mut buf = Vec::new();
                    doc.to_writer(&mut buf)?;
                    body.extend_from_slice(&buf);
                }
                Section::DocumentSequence { identifier, documents } => {
                    body.push(1u8);
                    let mut payload = Vec::new();
                    payload.extend_from_slice(identifier.as_bytes());
                    payload.push(0);
                    for doc in documents {
                        let mut buf = Vec::new();
                        doc.to_writer(&mut buf)?;
                        payload.extend_from_slice(&buf);
                    }
                    let size = 4 + payload.len() as i32;
                    body.extend_from_slice(&size.to_le_bytes());
                    body.extend_from_slice(&payload);
                }
            }
        }

        let flag_bits = 0u32;
        let length = HEADER_LEN + 4 /* flag bits */ + body.len() as i32;
        let header = Header {
            length,
            request_id,
            response_to: self.response_to,
            op_code: OP_MSG,
        };

        header.write_to(writer).await?;
        writer.write_all(&flag_bits.to_le_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(request_id)
    }
}

/// A decoded OP_MSG reply. The codec guarantees `sections` contains at least one kind-0 body
/// (§4.A: "at least one kind-0 section"); callers fetch it with [`Reply::command_document`].
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) sections: Vec<Section>,
}

impl Reply {
    /// The primary command-reply document: the first kind-0 section, falling back to the first
    /// document of a kind-1 sequence if (unusually) the server sent only that.
    pub(crate) fn command_document(self) -> Result<Document> {
        for section in self.sections {
            match section {
                Section::Body(doc) => return Ok(doc),
                Section::DocumentSequence { documents, .. } => {
                    if let Some(doc) = documents.into_iter().next() {
                        return Ok(doc);
                    }
                }
            }
        }
        Err(ErrorKind::InvalidResponse {
            message: "server reply contained no command document".into(),
        }
        .into())
    }

    /// Decodes one OP_MSG reply from `reader`. Verifies the declared length matches the bytes
    /// actually consumed and that at least one kind-0 section was present (§4.A contract).
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        let mut remaining = header.length - HEADER_LEN;

        let mut flag_buf = [0u8; 4];
        reader.read_exact(&mut flag_buf).await?;
        let flags = u32::from_le_bytes(flag_buf);
        remaining -= 4;

        let mut sections = Vec::new();
        let checksum_len = if flags & CHECKSUM_PRESENT != 0 { 4 } else { 0 };

        while remaining > checksum_len {
            let mut kind_buf = [0u8; 1];
            reader.read_exact(&mut kind_buf).await?;
            remaining -= 1;

            match kind_buf[0] {
                0 => {
                    let doc = bson_util::decode_document(reader).await?;
                    remaining -= bson_util::doc_size_bytes(&doc) as i32;
                    sections.push(Section::Body(doc));
                }
                1 => {
                    let mut size_buf = [0u8; 4];
                    reader.read_exact(&mut size_buf).await?;
                    let size = i32::from_le_bytes(size_buf);
                    let mut body_remaining = size - 4;
                    remaining -= size;

                    let mut identifier = Vec::new();
                    loop {
                        let mut byte = [0u8; 1];
                        reader.read_exact(&mut byte).await?;
                        body_remaining -= 1;
                        if byte[0] == 0 {
                            break;
                        }
                        identifier.push(byte[0]);
                    }
                    let identifier = String::from_utf8(identifier).map_err(|e| ErrorKind::InvalidResponse {
                        message: format!("document sequence identifier was not valid UTF-8: {e}"),
                    })?;

                    let mut documents = Vec::new();
                    while body_remaining > 0 {
                        let doc = bson_util::decode_document(reader).await?;
                        body_remaining -= bson_util::doc_size_bytes(&doc) as i32;
                        documents.push(doc);
                    }
                    sections.push(Section::DocumentSequence { identifier, documents });
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("unknown OP_MSG section kind {other}"),
                    }
                    .into());
                }
            }
        }

        if checksum_len > 0 {
            let mut checksum_buf = [0u8; 4];
            reader.read_exact(&mut checksum_buf).await?;
            remaining -= 4;
        }

        if remaining != 0 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "declared message length did not match bytes read (off by {remaining})"
                ),
            }
            .into());
        }

        if !sections.iter().any(|s| matches!(s, Section::Body(_))) {
            return Err(ErrorKind::InvalidResponse {
                message: "OP_MSG reply contained no kind-0 section".into(),
            }
            .into());
        }

        Ok(Self {
            response_to: header.response_to,
            sections,
        })
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn round_trips_a_simple_command() {
        let (mut client, mut server) = duplex(4096);

        let request = Request::from_command(doc! { "ping": 1 });
        let request_id = request.write_to(&mut client).await.unwrap();

        // Read the request back out as if we were the server, then reply to it.
        let decoded_request = Reply::read_from(&mut server).await.unwrap();
        assert_eq!(decoded_request.clone().command_document().unwrap(), doc! { "ping": 1 });

        let reply = Request::from_command(doc! { "ok": 1.0 }).responding_to(request_id);
        reply.write_to(&mut server).await.unwrap();

        let decoded_reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(decoded_reply.response_to, request_id);
        assert_eq!(decoded_reply.command_document().unwrap(), doc! { "ok": 1.0 });
    }

    #[tokio::test]
    async fn round_trips_a_document_sequence() {
        let (mut a, mut b) = duplex(8192);
        let request = Request::from_command(doc! { "insert": "coll" }).with_document_sequence(
            "documents",
            vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
        );
        request.write_to(&mut a).await.unwrap();

        let decoded = Reply::read_from(&mut b).await.unwrap();
        assert_eq!(decoded.sections.len(), 2);
        match &decoded.sections[1] {
            Section::DocumentSequence { identifier, documents } => {
                assert_eq!(identifier, "documents");
                assert_eq!(documents.len(), 2);
            }
            _ => panic!("expected a document sequence section"),
        }
    }

    #[tokio::test]
    async fn rejects_a_frame_whose_declared_length_overruns_the_body() {
        let (mut a, mut b) = duplex(4096);

        // A header claiming the frame is 1000 bytes long, followed by a single kind-0 section
        // that is actually much shorter: the codec must notice the shortfall rather than block
        // forever or silently accept a partial document.
        let mut doc_bytes = Vec::new();
        doc! { "ping": 1 }.to_writer(&mut doc_bytes).unwrap();

        let header = Header {
            length: 1000,
            request_id: 7,
            response_to: 0,
            op_code: OP_MSG,
        };
        header.write_to(&mut a).await.unwrap();
        a.write_all(&0u32.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8]).await.unwrap();
        a.write_all(&doc_bytes).await.unwrap();
        drop(a);

        let err = Reply::read_from(&mut b).await.unwrap_err();
        assert!(err.is_network_error() || matches!(*err.kind, ErrorKind::InvalidResponse { .. }));
    }
}
