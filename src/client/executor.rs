//! Composes D–H to run one logical operation with retries (§4.I), the main control loop of the
//! crate.

use std::sync::Arc;

use bson::{doc, Document};

use crate::{
    error::{self, Error, Result},
    event::EventBus,
    operation::{Operation, Retryability},
    options::{ClientOptions, SessionOptions},
    read_preference::ReadPreference,
    sdam::Topology,
    selection_criteria::SelectionCriteria,
    session::{pool::SessionPool, ClientSession},
};

/// Owns the topology and the session pool and is the sole way anything in this crate reaches
/// the network. A [`crate::Client`] is a thin, cloneable handle around an `Arc<Executor>`; a
/// [`ClientSession`] holds the same `Arc` directly rather than a `Client`, so the two never form
/// a reference cycle (§9 Design Notes).
pub struct Executor {
    topology: Arc<Topology>,
    session_pool: Arc<SessionPool>,
    options: ClientOptions,
    events: Option<EventBus>,
}

impl Executor {
    pub(crate) fn new(options: ClientOptions, events: Option<EventBus>) -> Arc<Self> {
        let topology = Topology::new(options.clone(), events.clone());
        Arc::new(Self {
            topology,
            session_pool: Arc::new(SessionPool::new()),
            options,
            events,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            topology: Topology::new_for_test(options.clone()),
            session_pool: Arc::new(SessionPool::new()),
            options,
            events: None,
        })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Allocates an explicit session from the registry (§4.G `checkout`).
    pub(crate) async fn start_session(self: &Arc<Self>, options: Option<SessionOptions>) -> ClientSession {
        self.start_session_inner(options, false).await
    }

    async fn start_implicit_session(self: &Arc<Self>) -> ClientSession {
        self.start_session_inner(None, true).await
    }

    async fn start_session_inner(self: &Arc<Self>, options: Option<SessionOptions>, is_implicit: bool) -> ClientSession {
        let timeout = self.logical_session_timeout();
        let server_session = self.session_pool.check_out(timeout).await;
        ClientSession::new(Arc::clone(self), server_session, options, is_implicit)
    }

    pub(crate) async fn check_in_session(&self, server_session: crate::session::pool::ServerSession) {
        let timeout = self.logical_session_timeout();
        self.session_pool.check_in(server_session, timeout).await;
    }

    fn logical_session_timeout(&self) -> Option<std::time::Duration> {
        self.topology
            .logical_session_timeout_minutes()
            .map(|minutes| std::time::Duration::from_secs((minutes.max(0) as u64) * 60))
    }

    /// Closes every pool and stops every monitor (§4.D).
    pub(crate) async fn shutdown(&self) {
        self.topology.close().await;
    }

    /// Resolves `session` (allocating an implicit one if needed, §4.I step 1) and runs the
    /// retry loop.
    pub(crate) async fn execute(self: &Arc<Self>, operation: Operation, session: Option<&mut ClientSession>) -> Result<Document> {
        let mut implicit_session = None;
        let session: Option<&mut ClientSession> = match session {
            Some(session) => Some(session),
            None => {
                if operation.acknowledged && self.topology.logical_session_timeout_minutes().is_some() {
                    implicit_session = Some(self.start_implicit_session().await);
                    implicit_session.as_mut()
                } else {
                    None
                }
            }
        };

        self.execute_with_session(operation, session).await
    }

    async fn execute_with_session(self: &Arc<Self>, operation: Operation, mut session: Option<&mut ClientSession>) -> Result<Document> {
        if let Some(session) = session.as_deref_mut() {
            if !operation.is_commit_transaction() && !operation.is_abort_transaction() {
                session.reset_finished_transaction();
            }
        }

        let in_transaction = session.as_deref().map(|s| s.in_transaction()).unwrap_or(false) || operation.is_commit_transaction() || operation.is_abort_transaction();

        // `commitTransaction` always gets its one retry regardless of `retry_writes` (§4.H);
        // `abortTransaction`'s errors are suppressed by the caller (§4.H), so it never needs one.
        let retryable = match operation.retryability {
            Retryability::None => false,
            Retryability::Read => self.options.retry_reads && !in_transaction,
            Retryability::Write => self.options.retry_writes && session.is_some() && !in_transaction,
        } || operation.is_commit_transaction();

        // A fresh `txnNumber` is assigned once per logical retryable write, not once per attempt
        // (§3 `Session::txn_number`); a transaction's own `txnNumber` was already assigned by
        // `start_transaction`.
        if operation.retryability == Retryability::Write && !in_transaction {
            if let Some(session) = session.as_deref_mut() {
                session.advance_txn_number();
            }
        }

        let mut first_error: Option<Error> = None;

        loop {
            let attempt_one = first_error.is_none();

            let selection_criteria = session
                .as_deref()
                .and_then(|s| s.pinned_address().cloned())
                .map(SelectionCriteria::from_address)
                .or_else(|| operation.selection_criteria.clone())
                .unwrap_or_else(|| SelectionCriteria::ReadPreference(ReadPreference::primary()));

            let pool = match self.topology.select_server(&selection_criteria, self.options.server_selection_timeout).await {
                Ok(pool) => pool,
                Err(err) => {
                    // §4.I step 5: a failed retry selection surfaces the original error, unless
                    // the original was a network error (in which case the newer failure is at
                    // least as informative).
                    return Err(match first_error {
                        Some(first) if !first.is_network_error() => first,
                        _ => err,
                    });
                }
            };

            let mut connection = match pool.checkout().await {
                Ok(connection) => connection,
                Err(err) => {
                    if attempt_one && retryable {
                        first_error = Some(err);
                        continue;
                    }
                    return Err(first_error.unwrap_or(err));
                }
            };

            let address = connection.address.clone();
            let command = self.build_command(&operation, session.as_deref(), in_transaction);

            let result = connection
                .run_command(&operation.database, command, self.options.socket_timeout, self.events.as_ref())
                .await;

            match result {
                Ok(reply) => {
                    if let Ok(cluster_time) = reply.get_document("$clusterTime") {
                        self.topology.advance_cluster_time(cluster_time);
                        if let Some(session) = session.as_deref_mut() {
                            session.advance_cluster_time(cluster_time);
                        }
                    }
                    if let Some(session) = session.as_deref_mut() {
                        if let Ok(operation_time) = reply.get_timestamp("operationTime") {
                            session.advance_operation_time(operation_time);
                        }
                        if in_transaction && session.is_transaction_starting() {
                            // §4.H: the server that ran the first operation of a sharded
                            // transaction is pinned for the rest of its lifetime.
                            if self.topology.description().topology_type() == crate::sdam::TopologyType::Sharded {
                                session.pin(address.clone());
                            }
                            session.mark_transaction_in_progress();
                        }
                    }

                    pool.checkin(connection).await;
                    return Ok(reply);
                }
                Err(mut err) => {
                    let should_clear_topology = !(err.is_network_error() && err.contains_label(error::NO_WRITES_PERFORMED));
                    if should_clear_topology {
                        self.topology.handle_application_error(&address, connection.service_id, &err).await;
                    }

                    if err.is_network_error() {
                        if let Some(session) = session.as_deref_mut() {
                            session.mark_dirty();
                        }
                        connection.close();
                        pool.checkin(connection).await;
                    } else {
                        pool.checkin(connection).await;
                    }

                    if in_transaction && !operation.is_commit_transaction() && !operation.is_abort_transaction() && (err.is_network_error() || err.is_server_selection_error()) {
                        err.add_label(error::TRANSIENT_TRANSACTION_ERROR);
                    }

                    // §4.H S4: a commit retries on a network error or `UnknownTransactionCommitResult`,
                    // not on every command error.
                    let err_is_retryable = if operation.is_commit_transaction() {
                        err.is_network_error() || err.contains_label(error::UNKNOWN_TRANSACTION_COMMIT_RESULT)
                    } else {
                        match operation.retryability {
                            Retryability::Read => err.is_read_retryable(),
                            Retryability::Write => err.is_network_error() || err.contains_label(error::RETRYABLE_WRITE_ERROR),
                            Retryability::None => false,
                        }
                    };

                    if attempt_one && retryable && err_is_retryable {
                        first_error = Some(err);
                        continue;
                    }

                    return Err(first_error.unwrap_or(err));
                }
            }
        }
    }

    /// Builds the wire command from the operation's base document plus session/transaction/
    /// cluster-time fields (§4.I step 3).
    fn build_command(&self, operation: &Operation, session: Option<&ClientSession>, in_transaction: bool) -> Document {
        let mut command = operation.command.clone();

        let cluster_time = crate::session::cluster_time::max(session.and_then(|s| s.cluster_time()), self.topology.cluster_time().as_ref()).cloned();
        if let Some(cluster_time) = &cluster_time {
            command.insert("$clusterTime", cluster_time.clone());
        }

        let Some(session) = session else {
            return command;
        };

        command.insert("lsid", session.id().clone());

        let is_transactional_command = in_transaction || operation.is_commit_transaction() || operation.is_abort_transaction();
        if is_transactional_command {
            command.insert("txnNumber", session.txn_number());
            command.insert("autocommit", false);
            if session.is_transaction_starting() && !operation.is_commit_transaction() && !operation.is_abort_transaction() {
                command.insert("startTransaction", true);
                if let Some(read_concern) = session.transaction_options().and_then(|o| o.read_concern.as_ref()) {
                    command.insert("readConcern", bson::to_document(read_concern).unwrap_or_default());
                }
            }
        } else if operation.retryability == Retryability::Write {
            command.insert("txnNumber", session.txn_number());
        }

        if !is_transactional_command {
            if let Some(read_concern) = &operation.read_concern {
                let mut rc = bson::to_document(read_concern).unwrap_or_default();
                if session.causal_consistency() {
                    if let Some(operation_time) = session.operation_time() {
                        rc.insert("afterClusterTime", operation_time);
                    }
                }
                command.insert("readConcern", rc);
            } else if session.causal_consistency() {
                if let Some(operation_time) = session.operation_time() {
                    command.insert("readConcern", doc! { "afterClusterTime": operation_time });
                }
            }
        }

        let write_concern_applies = !in_transaction || operation.is_commit_transaction() || operation.is_abort_transaction();
        if write_concern_applies {
            if let Some(write_concern) = &operation.write_concern {
                if !write_concern.is_empty() {
                    command.insert("writeConcern", bson::to_document(write_concern).unwrap_or_default());
                }
            }
        }

        command
    }
}

fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Executor>();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_command_attaches_lsid_and_txn_number() {
        let executor = Executor::new_for_test(ClientOptions::default());
        let server_session = crate::session::pool::ServerSession::new();
        let mut session = ClientSession::new(Arc::clone(&executor), server_session, None, false);
        session.advance_txn_number();

        let operation = Operation::new("find", "test", doc! { "find": "coll" }).with_retryability(Retryability::Read);
        let command = executor.build_command(&operation, Some(&session), false);
        assert!(command.contains_key("lsid"));
        assert!(!command.contains_key("txnNumber"));
    }

    #[test]
    fn build_command_omits_write_concern_inside_transaction() {
        let executor = Executor::new_for_test(ClientOptions::default());
        let server_session = crate::session::pool::ServerSession::new();
        let mut session = ClientSession::new(Arc::clone(&executor), server_session, None, false);
        session.start_transaction(None).unwrap();

        let operation = Operation::new("insert", "test", doc! { "insert": "coll" })
            .with_retryability(Retryability::Write)
            .with_write_concern(crate::concern::WriteConcern::majority());
        let command = executor.build_command(&operation, Some(&session), true);
        assert!(!command.contains_key("writeConcern"));
        assert_eq!(command.get_bool("startTransaction").unwrap(), true);
        assert_eq!(command.get_bool("autocommit").unwrap(), false);
    }
}
