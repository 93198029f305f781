//! A logical operation descriptor (§3 `Operation`) handed to the [`crate::client::executor::Executor`].
//!
//! Translating a specific CRUD/aggregation call into a command document is an external
//! collaborator's job (§1); this module only carries what the executor needs to run whatever
//! document it's given: where it goes, how it's retried, and what concerns apply.

use bson::Document;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// The name the server replies to `commitTransaction` under. Recognized by the executor so a
/// retry is attempted even when `retryWrites` is disabled (§4.H: "always retried once").
pub(crate) const COMMIT_TRANSACTION_NAME: &str = "commitTransaction";
/// Likewise for `abortTransaction` (§4.H).
pub(crate) const ABORT_TRANSACTION_NAME: &str = "abortTransaction";

/// Whether an operation may be retried once after a network error or a retryable server error
/// (§4.I step 2, §7). `None` means neither a retryable-read nor a retryable-write classification
/// applies — e.g. an unacknowledged write, or a command with no idempotent retry semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    None,
    Read,
    Write,
}

/// A request the executor (§4.I) resolves into a wire-protocol exchange. `command` is the
/// operation-specific base document — the executor layers in `lsid`, `txnNumber`,
/// `$clusterTime`, and the transaction-state fields before sending it (§4.I step 3); callers
/// never set those themselves.
#[derive(Clone, Debug)]
pub struct Operation {
    pub name: String,
    pub command: Document,
    pub database: String,
    pub selection_criteria: Option<SelectionCriteria>,
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub retryability: Retryability,
    /// An unacknowledged write never gets a reply to retry from and never carries session
    /// fields (§4.I, §4.G).
    pub acknowledged: bool,
}

impl Operation {
    pub fn new(name: impl Into<String>, database: impl Into<String>, command: Document) -> Self {
        Self {
            name: name.into(),
            command,
            database: database.into(),
            selection_criteria: None,
            read_concern: None,
            write_concern: None,
            retryability: Retryability::None,
            acknowledged: true,
        }
    }

    pub fn with_selection_criteria(mut self, criteria: SelectionCriteria) -> Self {
        self.selection_criteria = Some(criteria);
        self
    }

    pub fn with_retryability(mut self, retryability: Retryability) -> Self {
        self.retryability = retryability;
        self
    }

    pub fn with_read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = Some(read_concern);
        self
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    pub fn unacknowledged(mut self) -> Self {
        self.acknowledged = false;
        self.write_concern = Some(WriteConcern {
            w: Some(crate::concern::Acknowledgment::Nodes(0)),
            ..Default::default()
        });
        self
    }

    pub(crate) fn is_commit_transaction(&self) -> bool {
        self.name == COMMIT_TRANSACTION_NAME
    }

    pub(crate) fn is_abort_transaction(&self) -> bool {
        self.name == ABORT_TRANSACTION_NAME
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn unacknowledged_write_concern_is_nodes_zero() {
        let op = Operation::new("insert", "db", doc! {}).unacknowledged();
        assert!(!op.acknowledged);
        assert_eq!(op.write_concern.unwrap().w, Some(crate::concern::Acknowledgment::Nodes(0)));
    }

    #[test]
    fn builder_sets_retryability() {
        let op = Operation::new("find", "db", doc! {}).with_retryability(Retryability::Read);
        assert_eq!(op.retryability, Retryability::Read);
    }
}
