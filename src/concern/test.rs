use bson::doc;

use super::{Acknowledgment, ReadConcern, WriteConcern};

#[test]
fn read_concern_serializes_to_level_document() {
    let doc = bson::to_document(&ReadConcern::Majority).unwrap();
    assert_eq!(doc, doc! { "level": "majority" });
}

#[test]
fn write_concern_omits_unset_fields() {
    let wc = WriteConcern::builder().w(Acknowledgment::Majority).build();
    let doc = bson::to_document(&wc).unwrap();
    assert_eq!(doc, doc! { "w": "majority" });
}

#[test]
fn unacknowledged_write_concern_is_detected() {
    let wc = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
    assert!(!wc.is_acknowledged());
    assert!(WriteConcern::majority().is_acknowledged());
}
