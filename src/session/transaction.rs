//! The transaction state machine (§3 `Session::transaction_state`, §4.H).

use crate::{options::ServerAddress, options::TransactionOptions};

/// `None → Starting → InProgress → (Committed | Aborted) → (None | Starting)` (§4.H).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    /// Distinguishes "committed and nothing has been retried since" from "commit_transaction
    /// was called again after a successful commit", which the executor must still forward to
    /// the server rather than short-circuit (§4.H `commit_transaction` retry).
    Committed {
        data_committed: bool,
    },
    Aborted,
}

/// Per-session transaction bookkeeping: state, the options captured at `start_transaction`, and
/// the pinned address for a sharded transaction (§3 `Session::pinned_address`, §4.H).
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned_address: Option<ServerAddress>,
}

impl Transaction {
    pub(crate) fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.pinned_address = None;
    }

    pub(crate) fn mark_in_progress(&mut self) {
        self.state = TransactionState::InProgress;
    }

    pub(crate) fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    /// `abort_transaction` always lands here regardless of outcome (§4.H: "errors are
    /// suppressed").
    pub(crate) fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
        self.pinned_address = None;
    }

    /// Reverts a finished transaction to `None` so the session is ready to start a new one
    /// (§4.H: `(Committed | Aborted) → (None | Starting)`).
    pub(crate) fn reset(&mut self) {
        self.state = TransactionState::None;
        self.options = None;
        self.pinned_address = None;
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, TransactionState::Starting | TransactionState::InProgress)
    }

    pub(crate) fn pin(&mut self, address: ServerAddress) {
        self.pinned_address = Some(address);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut txn = Transaction::default();
        assert_eq!(txn.state, TransactionState::None);

        txn.start(None);
        assert_eq!(txn.state, TransactionState::Starting);
        assert!(txn.is_active());

        txn.pin(ServerAddress {
            host: "a".into(),
            port: Some(27017),
        });
        txn.mark_in_progress();
        assert_eq!(txn.state, TransactionState::InProgress);
        assert!(txn.pinned_address.is_some());

        txn.commit(true);
        assert_eq!(txn.state, TransactionState::Committed { data_committed: true });
        assert!(!txn.is_active());

        txn.reset();
        assert_eq!(txn.state, TransactionState::None);
        assert!(txn.pinned_address.is_none());
    }

    #[test]
    fn abort_clears_pin_and_options() {
        let mut txn = Transaction::default();
        txn.start(Some(TransactionOptions::builder().build()));
        txn.pin(ServerAddress {
            host: "a".into(),
            port: None,
        });
        txn.abort();
        assert_eq!(txn.state, TransactionState::Aborted);
        assert!(txn.pinned_address.is_none());
        assert!(txn.options.is_none());
    }
}
