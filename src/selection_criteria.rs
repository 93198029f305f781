//! `SelectionCriteria` is what an [`crate::operation::Operation`] hands to the server selector
//! (§4.F): either a read preference, or a predicate pinning the operation to one address (used
//! by sharded transactions, §4.H, to keep every operation on the address the transaction started
//! on).

use std::{sync::Arc, time::Duration};

use crate::{options::ServerAddress, read_preference::ReadPreference, sdam::ServerInfo};

#[derive(Clone)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    Predicate(Predicate),
}

impl std::fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadPreference(rp) => write!(f, "SelectionCriteria::ReadPreference({:?})", rp),
            Self::Predicate(_) => write!(f, "SelectionCriteria::Predicate(..)"),
        }
    }
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(a), Self::ReadPreference(b)) => a == b,
            (Self::Predicate(a), Self::Predicate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(rp) => Some(rp),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(rp) if rp.is_primary())
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|rp| rp.max_staleness)
    }

    /// Pin selection to a single address, as required while a sharded transaction is active.
    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo<'_>) -> bool>;
