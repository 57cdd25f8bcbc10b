use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::oid::Oid;
use crate::value::Value;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Timestamp(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000) {
            Ok(instant) => write!(f, "{instant}"),
            Err(_) => write!(f, "{}ms", self.0),
        }
    }
}

/// Leaf of the state tree.
///
/// Created empty on first traversal and populated only through
/// [`Document::merge`](crate::Document::merge).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    oid: Oid,
    value: Option<Value>,
    timestamp: Option<Timestamp>,
}

impl Attribute {
    pub(crate) fn new(oid: Oid) -> Self {
        Self {
            oid,
            value: None,
            timestamp: None,
        }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Time of the last applied update; `None` until first populated.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    pub fn is_populated(&self) -> bool {
        self.timestamp.is_some()
    }

    // value and timestamp always move together
    pub(crate) fn apply(&mut self, value: Option<Value>, timestamp: Timestamp) {
        self.value = value;
        self.timestamp = Some(timestamp);
    }
}
