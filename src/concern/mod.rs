//! Read concern and write concern, forwarded verbatim in command documents (§6/§Glossary).

#[cfg(test)]
mod test;

use std::time::Duration;

use bson::doc;
use serde::{Deserialize, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::bson_util;

/// The consistency and isolation properties requested of a read operation.
#[derive(Clone, Debug)]
pub enum ReadConcern {
    Local,
    Majority,
    Linearizable,
    Available,
    Snapshot,
    /// Forward-compatible escape hatch for levels this crate doesn't know about yet.
    Custom(String),
}

impl ReadConcern {
    pub fn as_str(&self) -> &str {
        match self {
            ReadConcern::Local => "local",
            ReadConcern::Majority => "majority",
            ReadConcern::Linearizable => "linearizable",
            ReadConcern::Available => "available",
            ReadConcern::Snapshot => "snapshot",
            ReadConcern::Custom(s) => s,
        }
    }
}

impl PartialEq for ReadConcern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for ReadConcern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        doc! { "level": self.as_str() }.serialize(serializer)
    }
}

/// The level of acknowledgement requested from the server for a write operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct WriteConcern {
    #[builder(default)]
    pub w: Option<Acknowledgment>,

    #[builder(default)]
    #[serde(rename = "wtimeout")]
    #[serde(serialize_with = "bson_util::serialize_duration_as_i64_millis")]
    #[serde(deserialize_with = "bson_util::deserialize_duration_from_u64_millis")]
    #[serde(default)]
    pub w_timeout: Option<Duration>,

    #[builder(default)]
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Default::default()
        }
    }

    /// An "unacknowledged" write concern never gets a server reply, so it can never be the
    /// write concern of a retryable write or a transaction.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0)))
    }

    /// Whether every field is unset, i.e. this is equivalent to the server's own default.
    pub(crate) fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout.is_none() && self.journal.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Acknowledgment {
    Nodes(i32),
    Majority,
    Tag(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Nodes(n) => serializer.serialize_i32(*n),
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Tag(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i32),
            String(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Acknowledgment::Nodes(n),
            Repr::String(s) if s == "majority" => Acknowledgment::Majority,
            Repr::String(s) => Acknowledgment::Tag(s),
        })
    }
}

impl From<i32> for Acknowledgment {
    fn from(i: i32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Tag(s)
        }
    }
}
