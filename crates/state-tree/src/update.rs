use std::collections::BTreeMap;

use crate::attribute::Timestamp;
use crate::codec::wire::RawField;
use crate::document::Document;
use crate::oid::Oid;
use crate::value::Value;

/// A change to one attribute.
///
/// `value: None` clears the attribute. An entry whose value kind this build
/// does not understand keeps the raw fields in `unknown` and is skipped by
/// merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeChange {
    pub value: Option<Value>,
    pub timestamp: Option<Timestamp>,
    pub unknown: Vec<RawField>,
    pub(crate) opaque: bool,
}

impl AttributeChange {
    pub fn set(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn clear() -> Self {
        Self::default()
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// True when the value used a kind this build cannot interpret.
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }
}

/// A partial tree delta: one change per Oid.
///
/// Key order carries no meaning; every entry targets a distinct attribute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateRecord {
    pub entries: BTreeMap<Oid, AttributeChange>,
    pub unknown: Vec<RawField>,
}

impl UpdateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, oid: Oid, change: AttributeChange) -> &mut Self {
        self.entries.insert(oid, change);
        self
    }

    pub fn with(mut self, oid: Oid, change: AttributeChange) -> Self {
        self.entries.insert(oid, change);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, oid: &Oid) -> Option<&AttributeChange> {
        self.entries.get(oid)
    }

    /// Walks `document` and emits one entry per attribute that carries a value.
    pub fn snapshot(document: &Document) -> Self {
        let mut record = UpdateRecord::new();
        collect(document, &mut record);
        record
    }

    /// Restricts the record to entries at or beneath `prefix`.
    pub fn retain_under(&mut self, prefix: &Oid) {
        self.entries.retain(|oid, _| oid.starts_with(prefix));
    }
}

fn collect(document: &Document, record: &mut UpdateRecord) {
    for attribute in document.attributes() {
        if let Some(value) = attribute.value() {
            let mut change = AttributeChange::set(value.clone());
            change.timestamp = attribute.timestamp();
            record.entries.insert(attribute.oid().clone(), change);
        }
    }
    for child in document.documents() {
        collect(child, record);
    }
}
