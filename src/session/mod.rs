//! Logical sessions and multi-document transactions (§3 `Session`, §4.G, §4.H).
//!
//! A [`ClientSession`] is the causally-consistent, optionally-transactional handle returned by
//! [`crate::Client::start_session`]. It owns a pooled [`pool::ServerSession`] for its lifetime
//! and holds an [`std::sync::Arc`] to the [`crate::client::executor::Executor`] it was started
//! from rather than the [`crate::Client`] itself — the executor is all a session ever needs to
//! run `commitTransaction`/`abortTransaction`, and holding it directly avoids a
//! `Client` → `ClientSession` → `Client` reference cycle (§9 Design Notes).

pub mod cluster_time;
pub(crate) mod pool;
pub(crate) mod transaction;

use std::sync::Arc;

use bson::{doc, Document, Timestamp};

use crate::{
    client::executor::Executor,
    error::{ErrorKind, Result},
    operation::{Operation, Retryability, ABORT_TRANSACTION_NAME, COMMIT_TRANSACTION_NAME},
    options::{ServerAddress, SessionOptions, TransactionOptions},
    session::{
        pool::ServerSession,
        transaction::{Transaction, TransactionState},
    },
};

/// A logical session (§3 `Session`). Causally consistent by default when explicitly started;
/// optionally scopes a multi-document transaction (§4.H).
pub struct ClientSession {
    executor: Arc<Executor>,
    /// `None` only in the brief window after `Drop` has taken it to hand off for checkin/abort.
    server_session: Option<ServerSession>,
    is_implicit: bool,
    options: Option<SessionOptions>,
    cluster_time: Option<Document>,
    operation_time: Option<Timestamp>,
    snapshot_time: Option<Timestamp>,
    transaction: Transaction,
}

impl ClientSession {
    pub(crate) fn new(executor: Arc<Executor>, server_session: ServerSession, options: Option<SessionOptions>, is_implicit: bool) -> Self {
        Self {
            executor,
            server_session: Some(server_session),
            is_implicit,
            options,
            cluster_time: None,
            operation_time: None,
            snapshot_time: None,
            transaction: Transaction::default(),
        }
    }

    /// The server-assigned `lsid` (§3 `Session::id`).
    pub fn id(&self) -> &Document {
        &self.server_session().id
    }

    pub fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether this session's reads should observe `$clusterTime`/`afterClusterTime` causal
    /// consistency (§4.G). A snapshot session is never causally consistent (§9 Open Question 2:
    /// the two are treated as mutually exclusive); otherwise this is the explicit
    /// `causal_consistency` option, defaulting to `true` for an explicit session and `false` for
    /// an implicit one.
    pub fn causal_consistency(&self) -> bool {
        if self.snapshot_enabled() {
            return false;
        }
        self.options.as_ref().and_then(|o| o.causal_consistency).unwrap_or(!self.is_implicit)
    }

    pub fn snapshot_enabled(&self) -> bool {
        self.options.as_ref().and_then(|o| o.snapshot).unwrap_or(false)
    }

    pub fn cluster_time(&self) -> Option<&Document> {
        self.cluster_time.as_ref()
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub fn snapshot_time(&self) -> Option<Timestamp> {
        self.snapshot_time
    }

    /// Gossips a `$clusterTime` observed on a reply into this session, if newer (§4.G).
    pub(crate) fn advance_cluster_time(&mut self, new: &Document) {
        if cluster_time::is_greater(new, self.cluster_time.as_ref()) {
            self.cluster_time = Some(new.clone());
        }
    }

    /// Advances `operationTime`, read from a reply, so later causally-consistent reads on this
    /// session observe it (§4.G).
    pub(crate) fn advance_operation_time(&mut self, new: Timestamp) {
        if self.operation_time.map(|current| new > current).unwrap_or(true) {
            self.operation_time = Some(new);
        }
    }

    pub(crate) fn set_snapshot_time(&mut self, time: Timestamp) {
        if self.snapshot_time.is_none() {
            self.snapshot_time = Some(time);
        }
    }

    fn server_session(&self) -> &ServerSession {
        self.server_session.as_ref().expect("ClientSession used after being dropped")
    }

    fn server_session_mut(&mut self) -> &mut ServerSession {
        self.server_session.as_mut().expect("ClientSession used after being dropped")
    }

    /// Marks the underlying server session dirty (§3 `Session::is_dirty`): it will be discarded
    /// on checkin rather than returned to the pool (§4.G). Used when a network error makes the
    /// session's state on the server unknown.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session_mut().dirty = true;
    }

    /// The `txnNumber` most recently assigned to this session, unchanged across retries of the
    /// same logical write (§4.I).
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session().txn_number
    }

    /// Assigns a fresh `txnNumber` for a new retryable write or a new transaction (§4.G, §4.H).
    pub(crate) fn advance_txn_number(&mut self) -> i64 {
        let session = self.server_session_mut();
        session.txn_number += 1;
        session.txn_number
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_active()
    }

    pub(crate) fn is_transaction_starting(&self) -> bool {
        self.transaction.state == TransactionState::Starting
    }

    pub(crate) fn mark_transaction_in_progress(&mut self) {
        self.transaction.mark_in_progress();
    }

    /// Reverts a `Committed`/`Aborted` transaction to `None` so the session is ready for a new
    /// one (§4.H). The executor calls this before running any operation that isn't itself the
    /// commit/abort (§4.I step 1's transaction-state reset).
    pub(crate) fn reset_finished_transaction(&mut self) {
        if matches!(self.transaction.state, TransactionState::Committed { .. } | TransactionState::Aborted) {
            self.transaction.reset();
        }
    }

    pub(crate) fn pinned_address(&self) -> Option<&ServerAddress> {
        self.transaction.pinned_address.as_ref()
    }

    pub(crate) fn pin(&mut self, address: ServerAddress) {
        self.transaction.pin(address);
    }

    pub(crate) fn transaction_options(&self) -> Option<&TransactionOptions> {
        self.transaction.options.as_ref()
    }

    /// Starts a new transaction on this session (§4.H `None → Starting`). `options` overrides
    /// the session's `default_transaction_options` for this transaction only.
    pub fn start_transaction(&mut self, options: Option<TransactionOptions>) -> Result<()> {
        if self.transaction.is_active() {
            return Err(ErrorKind::Transaction {
                message: "transaction already in progress".to_string(),
            }
            .into());
        }
        if self.snapshot_enabled() {
            return Err(ErrorKind::Transaction {
                message: "transactions are not supported in a snapshot session".to_string(),
            }
            .into());
        }

        let merged = options.or_else(|| self.options.as_ref().and_then(|o| o.default_transaction_options.clone()));
        self.advance_txn_number();
        self.transaction.start(merged);
        Ok(())
    }

    /// Runs `commitTransaction` (§4.H). Callable again after a successful commit — the command
    /// is still forwarded to the server rather than short-circuited, matching server semantics
    /// for a repeated commit.
    pub async fn commit_transaction(&mut self) -> Result<Document> {
        if !matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress | TransactionState::Committed { .. }
        ) {
            return Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into());
        }

        // A transaction with no operations sent (still `Starting`) has nothing to commit or
        // abort against the server; treat it as a no-op success, matching the FSM's `Starting`
        // state never having reached the server.
        if self.transaction.state == TransactionState::Starting {
            self.transaction.commit(true);
            return Ok(doc! { "ok": 1.0 });
        }

        let executor = Arc::clone(&self.executor);
        let write_concern = self
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone())
            .unwrap_or_default();
        let max_commit_time = self.transaction.options.as_ref().and_then(|o| o.max_commit_time);

        let mut command = doc! { "commitTransaction": 1 };
        if let Some(max_commit_time) = max_commit_time {
            command.insert("maxTimeMS", max_commit_time.as_millis() as i64);
        }

        let op = Operation::new(COMMIT_TRANSACTION_NAME, "admin", command)
            .with_retryability(Retryability::Write)
            .with_write_concern(write_concern);

        let result = executor.execute(op, Some(&mut *self)).await;
        self.transaction.commit(result.is_ok());
        result
    }

    /// Runs `abortTransaction` (§4.H). Errors are suppressed: the transaction is considered
    /// aborted on the client side regardless of whether the server is reachable.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        if !self.transaction.is_active() {
            return Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into());
        }

        if self.transaction.state == TransactionState::Starting {
            self.transaction.abort();
            return Ok(());
        }

        let executor = Arc::clone(&self.executor);
        let op = Operation::new(ABORT_TRANSACTION_NAME, "admin", doc! { "abortTransaction": 1 }).with_retryability(Retryability::Write);
        let _ = executor.execute(op, Some(&mut *self)).await;
        self.transaction.abort();
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.server_session.as_ref().map(|s| &s.id))
            .field("is_implicit", &self.is_implicit)
            .field("transaction_state", &self.transaction.state)
            .finish()
    }
}

impl Drop for ClientSession {
    /// An in-progress transaction is aborted by spinning up a throwaway `ClientSession` that owns
    /// the same server session and letting its own `Drop` (the non-transactional branch below)
    /// check the session back in once the abort completes.
    fn drop(&mut self) {
        let Some(server_session) = self.server_session.take() else {
            return;
        };

        if self.transaction.is_active() {
            let mut dropped = ClientSession {
                executor: Arc::clone(&self.executor),
                server_session: Some(server_session),
                is_implicit: self.is_implicit,
                options: self.options.clone(),
                cluster_time: self.cluster_time.clone(),
                operation_time: self.operation_time,
                snapshot_time: self.snapshot_time,
                transaction: std::mem::take(&mut self.transaction),
            };
            crate::RUNTIME.execute(async move {
                let _ = dropped.abort_transaction().await;
            });
        } else {
            let executor = Arc::clone(&self.executor);
            crate::RUNTIME.execute(async move {
                executor.check_in_session(server_session).await;
            });
        }
    }
}

fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<ClientSession>();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::ClientOptions;

    fn session_for_test(is_implicit: bool, options: Option<SessionOptions>) -> (Arc<Executor>, ClientSession) {
        let executor = Executor::new_for_test(ClientOptions::default());
        let server_session = ServerSession::new();
        let session = ClientSession::new(Arc::clone(&executor), server_session, options, is_implicit);
        (executor, session)
    }

    #[test]
    fn explicit_session_defaults_causally_consistent() {
        let (_executor, session) = session_for_test(false, None);
        assert!(session.causal_consistency());
    }

    #[test]
    fn implicit_session_defaults_not_causally_consistent() {
        let (_executor, session) = session_for_test(true, None);
        assert!(!session.causal_consistency());
    }

    #[test]
    fn snapshot_session_is_never_causally_consistent() {
        let options = SessionOptions::builder().snapshot(Some(true)).build();
        let (_executor, session) = session_for_test(false, Some(options));
        assert!(session.snapshot_enabled());
        assert!(!session.causal_consistency());
    }

    #[test]
    fn start_transaction_rejected_while_active() {
        let (_executor, mut session) = session_for_test(false, None);
        session.start_transaction(None).unwrap();
        assert!(session.in_transaction());
        assert!(session.start_transaction(None).is_err());
    }

    #[test]
    fn start_transaction_rejected_in_snapshot_session() {
        let options = SessionOptions::builder().snapshot(Some(true)).build();
        let (_executor, mut session) = session_for_test(false, Some(options));
        assert!(session.start_transaction(None).is_err());
    }

    #[test]
    fn advance_cluster_time_only_moves_forward() {
        let (_executor, mut session) = session_for_test(false, None);
        let low = doc! { "clusterTime": Timestamp { time: 1, increment: 0 }, "signature": {} };
        let high = doc! { "clusterTime": Timestamp { time: 5, increment: 0 }, "signature": {} };
        session.advance_cluster_time(&high);
        session.advance_cluster_time(&low);
        assert_eq!(session.cluster_time(), Some(&high));
    }

    #[tokio::test]
    async fn commit_with_no_operations_is_local_noop() {
        let (_executor, mut session) = session_for_test(false, None);
        session.start_transaction(None).unwrap();
        let result = session.commit_transaction().await;
        assert!(result.is_ok());
        assert!(!session.in_transaction());
    }
}
