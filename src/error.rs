//! The [`Error`] and [`Result`] types used throughout this crate.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::options::ServerAddress;

/// Added to an error when it is safe to retry the write that produced it.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Added to a network error or server selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Added when it is unknown whether a `commitTransaction` satisfied its write concern.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";
/// Added to a retryable write error when the server guarantees no writes were performed.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// Codes that indicate a primary has stepped down, is recovering, or is shutting down.
/// A state-change code forces the server's description to `Unknown` and the server's pool
/// to be cleared, in addition to whatever retry behavior its label set implies.
const NOT_WRITABLE_PRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const NODE_IS_RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTDOWN_CODES: [i32; 2] = [11600, 91];

const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];
const UNKNOWN_TRANSACTION_COMMIT_RESULT_CODES: [i32; 3] = [50, 64, 91];

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the driver core. The inner [`ErrorKind`] is wrapped in an `Arc`-free
/// box; [`Error`] itself is cheap to clone because its fields are small, which matters because
/// the same error is often reported to both a waiting caller and a command-monitoring event.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.into_iter().collect(),
            wire_version: None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn pool_cleared(address: &ServerAddress, cause: &Error) -> Self {
        ErrorKind::ConnectionPoolCleared {
            address: address.clone(),
            message: format!("connection pool for {} cleared because of: {}", address, cause),
        }
        .into()
    }

    /// Labels attached to this error. Retry logic and the transaction FSM consult these, never
    /// raw codes, except for the closed set of state-change codes in [`Error::state_change_code`].
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub(crate) fn with_wire_version(mut self, wire_version: i32) -> Self {
        self.wire_version = Some(wire_version);
        self
    }

    /// The server code carried by this error, if it originated at the server.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(c) => Some(c.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(wc)) => Some(wc.code),
            _ => None,
        }
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_command_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Command(_))
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelectionTimeout { .. })
    }

    /// Whether this is one of the closed set of codes that indicate a replica set state
    /// change (step-down, recovery, shutdown). These force a topology update independent of
    /// whatever error label set is present (see §7 of the design).
    pub(crate) fn state_change_code(&self) -> Option<i32> {
        self.code().filter(|code| {
            NOT_WRITABLE_PRIMARY_CODES.contains(code)
                || NODE_IS_RECOVERING_CODES.contains(code)
                || SHUTDOWN_CODES.contains(code)
        })
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.state_change_code().is_some()
    }

    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        self.code()
            .map(|code| RETRYABLE_READ_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// Whether a `RetryableWriteError` label should be attached. Servers with wire version > 8
    /// only add the label for network errors (the rest is covered server-side); older servers
    /// also retry on the legacy code list.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        self.code()
            .map(|code| RETRYABLE_WRITE_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return false;
        }
        if self.is_network_error()
            || self.is_server_selection_error()
            || self.contains_label(RETRYABLE_WRITE_ERROR)
        {
            return true;
        }
        self.code()
            .map(|code| UNKNOWN_TRANSACTION_COMMIT_RESULT_CODES.contains(&code))
            .unwrap_or(false)
    }
}

/// Builds a [`Error`] from a server reply with `ok: 0` (§4.I step 4, §7 `CommandError`).
/// Error labels are read from the reply's `errorLabels` array when present; otherwise they are
/// synthesized the way a server that predates label support would have the driver do it
/// (`should_add_retryable_write_label`/`should_add_unknown_transaction_commit_result_label`).
pub(crate) fn command_error_from_reply(reply: &bson::Document, max_wire_version: i32) -> Error {
    let command_error: CommandError = match bson::from_document(reply.clone()) {
        Ok(err) => err,
        Err(_) => CommandError {
            code: reply.get_i32("code").unwrap_or(-1),
            code_name: reply
                .get_str("codeName")
                .map(|s| s.to_string())
                .unwrap_or_default(),
            message: reply
                .get_str("errmsg")
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "unknown command error".to_string()),
        },
    };

    let labels: HashSet<String> = reply
        .get_array("errorLabels")
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut error = Error::new(ErrorKind::Command(command_error), labels);

    if error.should_add_retryable_write_label(max_wire_version) {
        error.add_label(RETRYABLE_WRITE_ERROR);
    }
    if error.should_add_unknown_transaction_commit_result_label() {
        error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
    }

    error
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, None)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ErrorKind::OperationTimeout.into()
    }
}

impl From<bson::de::Error> for Error {
    fn from(err: bson::de::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: err.to_string(),
        }
        .into()
    }
}

impl From<bson::ser::Error> for Error {
    fn from(err: bson::ser::Error) -> Self {
        ErrorKind::InvalidResponse {
            message: err.to_string(),
        }
        .into()
    }
}

/// The error taxonomy described in §7: kinds, not a class hierarchy. Retry logic matches on
/// these variants or on [`Error::labels`], never on a vtable.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("handshake failed: {message}")]
    Handshake { message: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("server selection timed out after {duration_ms}ms: {message}")]
    ServerSelectionTimeout { message: String, duration_ms: u64 },

    #[error("timed out waiting for a connection from the pool")]
    WaitQueueTimeout { address: ServerAddress },

    #[error("connection pool for {address} cleared: {message}")]
    ConnectionPoolCleared {
        address: ServerAddress,
        message: String,
    },

    #[error("server at {address} does not support the wire protocol: {message}")]
    IncompatibleServer {
        address: ServerAddress,
        message: String,
    },

    #[error("invalid server response: {message}")]
    InvalidResponse { message: String },

    #[error("command failed: {0}")]
    Command(CommandError),

    #[error("write failed: {0}")]
    Write(WriteFailure),

    #[error("bulk write error: {0:?}")]
    BulkWrite(BulkWriteFailure),

    #[error("transaction error: {message}")]
    Transaction { message: String },

    #[error("operation timed out")]
    OperationTimeout,

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// A command error, i.e. a server reply with `ok: 0`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct CommandError {
    pub code: i32,
    #[serde(rename = "codeName", default)]
    pub code_name: String,
    #[serde(rename = "errmsg")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// A write-concern error nested in a reply.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct WriteConcernError {
    pub code: i32,
    #[serde(rename = "codeName", default)]
    pub code_name: String,
    #[serde(rename = "errmsg")]
    pub message: String,
}

/// A single-document write error as returned for `insert`/`update`/`delete`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct WriteError {
    pub code: i32,
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,
    #[serde(rename = "errmsg")]
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("{0:?}")]
    WriteError(WriteError),
    #[error("{0:?}")]
    WriteConcernError(WriteConcernError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkWriteFailure {
    pub write_errors: Option<Vec<(usize, WriteError)>>,
    pub write_concern_error: Option<WriteConcernError>,
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn command_error(code: i32) -> Error {
        Error::new(
            ErrorKind::Command(CommandError {
                code,
                code_name: "Test".to_string(),
                message: "boom".to_string(),
            }),
            None,
        )
    }

    /// A not-writable-primary/node-is-recovering/shutdown code is a state-change error
    /// regardless of wire version or label presence.
    #[test]
    fn state_change_codes_are_recognized_across_all_three_lists() {
        assert!(command_error(10107).is_state_change_error()); // not writable primary
        assert!(command_error(11602).is_state_change_error()); // interrupted due to repl state change
        assert!(command_error(91).is_state_change_error()); // shutdown in progress
        assert!(!command_error(2).is_state_change_error()); // bad value, not a state change
    }

    /// §7: on wire version > 8 the server already attaches the label itself for non-network
    /// errors, so the driver only synthesizes it for network errors.
    #[test]
    fn retryable_write_label_on_modern_servers_is_network_errors_only() {
        let network_error = Error::new(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))), None);
        assert!(network_error.should_add_retryable_write_label(9));

        let retryable_code_error = command_error(11600); // interrupted at shutdown, on the legacy list
        assert!(!retryable_code_error.should_add_retryable_write_label(9));
    }

    /// On legacy servers (wire version <= 8) the driver still synthesizes the label from the
    /// closed code list, since the server won't have added it itself.
    #[test]
    fn retryable_write_label_on_legacy_servers_falls_back_to_the_code_list() {
        let retryable_code_error = command_error(11600);
        assert!(retryable_code_error.should_add_retryable_write_label(6));

        let non_retryable = command_error(2);
        assert!(!non_retryable.should_add_retryable_write_label(6));
    }

    /// `UnknownTransactionCommitResult` is suppressed once `TransientTransactionError` is
    /// already present — the two labels are mutually exclusive outcomes of a commit attempt.
    #[test]
    fn unknown_transaction_commit_result_label_is_suppressed_by_transient_transaction_error() {
        let mut error = command_error(50); // MaxTimeMSExpired, on the commit-result code list
        error.add_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(!error.should_add_unknown_transaction_commit_result_label());
    }

    #[test]
    fn unknown_transaction_commit_result_label_applies_to_its_code_list() {
        let error = command_error(64); // WriteConcernFailed
        assert!(error.should_add_unknown_transaction_commit_result_label());

        let unrelated = command_error(2);
        assert!(!unrelated.should_add_unknown_transaction_commit_result_label());
    }

    /// §4.I step 4: `errorLabels` from the reply are honored, and a retryable-write label is
    /// synthesized on top for a network-ineligible, non-modern-server reply with a legacy
    /// retryable code.
    #[test]
    fn command_error_from_reply_merges_reply_labels_with_synthesized_ones() {
        let reply = doc! {
            "ok": 0.0,
            "code": 11_600,
            "codeName": "InterruptedAtShutdown",
            "errmsg": "shutting down",
            "errorLabels": ["SomeOtherLabel"],
        };

        let error = command_error_from_reply(&reply, 6);

        assert!(error.contains_label("SomeOtherLabel"));
        assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
        assert_eq!(error.code(), Some(11_600));
    }
}
