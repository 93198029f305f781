//! `$clusterTime` gossip (§4.G): the highest observed value is advanced monotonically and
//! attached to every outgoing command, cluster-wide on [`crate::sdam::Topology`] and per-session
//! on [`super::ClientSession`].

use bson::{Document, Timestamp};

/// Extracts the `clusterTime` timestamp nested in a `$clusterTime` subdocument, the shape a
/// server reply carries it in: `{ clusterTime: Timestamp(..), signature: { ... } }`.
fn timestamp_of(cluster_time: &Document) -> Option<Timestamp> {
    cluster_time.get_timestamp("clusterTime").ok()
}

/// Whether `new` is strictly newer than `current` (§4.G: `advance_cluster_time(t)` is a no-op if
/// `t ≤ current`). A `$clusterTime` document with no parseable `clusterTime` field never
/// advances anything.
pub(crate) fn is_greater(new: &Document, current: Option<&Document>) -> bool {
    let Some(new_ts) = timestamp_of(new) else {
        return false;
    };
    match current.and_then(timestamp_of) {
        Some(current_ts) => new_ts > current_ts,
        None => true,
    }
}

/// Returns whichever of `a` and `b` is newer, preferring `a` when they're equal or incomparable.
pub(crate) fn max<'a>(a: Option<&'a Document>, b: Option<&'a Document>) -> Option<&'a Document> {
    match (a, b) {
        (Some(a_doc), Some(_)) if is_greater(a_doc, b) => a,
        (Some(_), Some(b_doc)) if is_greater(b_doc, a) => b,
        (Some(_), _) => a,
        (None, _) => b,
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn ct(t: u32, i: u32) -> Document {
        doc! { "clusterTime": Timestamp { time: t, increment: i }, "signature": {} }
    }

    #[test]
    fn newer_replaces_older() {
        assert!(is_greater(&ct(10, 0), Some(&ct(5, 0))));
        assert!(!is_greater(&ct(5, 0), Some(&ct(10, 0))));
    }

    #[test]
    fn equal_is_not_greater() {
        assert!(!is_greater(&ct(10, 3), Some(&ct(10, 3))));
    }

    #[test]
    fn anything_beats_none() {
        assert!(is_greater(&ct(1, 0), None));
    }

    #[test]
    fn max_picks_newer() {
        let a = ct(1, 0);
        let b = ct(2, 0);
        assert_eq!(max(Some(&a), Some(&b)), Some(&b));
        assert_eq!(max(Some(&b), Some(&a)), Some(&b));
        assert_eq!(max(None, Some(&b)), Some(&b));
        assert_eq!(max(Some(&a), None), Some(&a));
    }
}
