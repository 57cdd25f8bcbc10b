use std::collections::HashMap;

use crate::attribute::{Attribute, Timestamp};
use crate::error::StateError;
use crate::oid::{self, Oid};
use crate::tree::AttributeChanged;
use crate::update::UpdateRecord;

/// Interior node of the state tree.
///
/// Child documents and attributes are created on first lookup, so absence of
/// data shows up as an unpopulated attribute rather than a missing node.
#[derive(Debug, Clone, Default)]
pub struct Document {
    namespace: String,
    path: Vec<String>,
    documents: HashMap<String, Document>,
    attributes: HashMap<String, Attribute>,
}

impl Document {
    /// Root of a tree for `namespace`.
    pub fn root(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Oid of this node; `None` for a root.
    pub fn oid(&self) -> Option<Oid> {
        if self.path.is_empty() {
            return None;
        }
        Oid::new(&self.namespace, self.path.iter().cloned()).ok()
    }

    pub fn document(&mut self, segment: &str) -> &mut Document {
        debug_assert!(oid::is_valid_segment(segment), "invalid segment {segment:?}");
        let namespace = &self.namespace;
        let path = &self.path;
        self.documents
            .entry(segment.to_string())
            .or_insert_with(|| {
                let mut child_path = path.clone();
                child_path.push(segment.to_string());
                Document {
                    namespace: namespace.clone(),
                    path: child_path,
                    ..Document::default()
                }
            })
    }

    pub fn attribute(&mut self, segment: &str) -> &mut Attribute {
        debug_assert!(oid::is_valid_segment(segment), "invalid segment {segment:?}");
        let namespace = &self.namespace;
        let path = &self.path;
        self.attributes
            .entry(segment.to_string())
            .or_insert_with(|| {
                let mut attribute_path = path.clone();
                attribute_path.push(segment.to_string());
                Attribute::new(Oid::from_parts(namespace, attribute_path))
            })
    }

    /// Resolves an absolute Oid beneath this node, creating intermediate
    /// documents and the final attribute as needed.
    pub fn attribute_at(&mut self, oid: &Oid) -> Result<&mut Attribute, StateError> {
        let residual = self.residual(oid)?;
        let (last, parents) = residual.split_last().ok_or(StateError::EmptyPath)?;
        let mut node = self;
        for segment in parents {
            node = node.document(segment);
        }
        Ok(node.attribute(last))
    }

    /// Non-creating lookup.
    pub fn find_attribute(&self, oid: &Oid) -> Option<&Attribute> {
        let residual = self.residual(oid).ok()?;
        let (last, parents) = residual.split_last()?;
        let mut node = self;
        for segment in parents {
            node = node.documents.get(segment)?;
        }
        node.attributes.get(last)
    }

    /// Non-creating lookup of a descendant document.
    pub fn find_document(&self, oid: &Oid) -> Option<&Document> {
        let residual = self.residual(oid).ok()?;
        let mut node = self;
        for segment in residual {
            node = node.documents.get(segment)?;
        }
        Some(node)
    }

    pub fn get_document(&self, segment: &str) -> Option<&Document> {
        self.documents.get(segment)
    }

    pub fn get_attribute(&self, segment: &str) -> Option<&Attribute> {
        self.attributes.get(segment)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    /// Applies every entry of `record`, last write wins.
    ///
    /// The whole record is checked against this node's scope before anything
    /// is written, so a rejected record leaves the tree untouched. This is the
    /// only mutation path for attribute values.
    pub fn merge(&mut self, record: &UpdateRecord) -> Result<Vec<AttributeChanged>, StateError> {
        for oid in record.entries.keys() {
            let residual = self.residual(oid)?;
            if residual.is_empty() {
                return Err(StateError::EmptyPath);
            }
        }

        let applied_at = Timestamp::now();
        let mut changed = Vec::with_capacity(record.entries.len());
        for (oid, change) in &record.entries {
            if change.is_opaque() {
                tracing::debug!(
                    target = "sandpolis::state",
                    oid = %oid,
                    "skipping update entry with unrecognized value kind"
                );
                continue;
            }
            let timestamp = change.timestamp.unwrap_or(applied_at);
            let attribute = self.attribute_at(oid)?;
            attribute.apply(change.value.clone(), timestamp);
            changed.push(AttributeChanged {
                oid: oid.clone(),
                value: change.value.clone(),
                timestamp,
            });
        }
        Ok(changed)
    }

    fn residual<'a>(&self, oid: &'a Oid) -> Result<&'a [String], StateError> {
        if oid.namespace() != self.namespace || !oid.path().starts_with(&self.path) {
            return Err(StateError::OidOutOfScope {
                oid: oid.to_string(),
                scope: oid::render(&self.namespace, &self.path),
            });
        }
        Ok(&oid.path()[self.path.len()..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::AttributeChange;
    use crate::value::Value;

    fn oid(text: &str) -> Oid {
        Oid::parse(text).expect("valid oid")
    }

    #[test_timeout::timeout]
    fn lazy_lookup_is_idempotent() {
        let mut root = Document::root("");
        let first = root.document("a").document("b").oid();
        let second = root.document("a").document("b").oid();
        assert_eq!(first, second);
        assert_eq!(first, Some(oid("/a/b")));
        assert_eq!(root.documents().count(), 1);
        assert_eq!(root.get_document("a").unwrap().documents().count(), 1);
    }

    #[test_timeout::timeout]
    fn attribute_at_creates_intermediate_documents() {
        let mut root = Document::root("");
        let attribute = root
            .attribute_at(&oid("/profile/abc/hostname"))
            .expect("in scope");
        assert_eq!(attribute.oid(), &oid("/profile/abc/hostname"));
        assert!(attribute.value().is_none());
        assert!(!attribute.is_populated());

        let profile = root.get_document("profile").expect("created");
        assert!(profile.get_document("abc").is_some());
    }

    #[test_timeout::timeout]
    fn attribute_at_rejects_foreign_scope() {
        let mut root = Document::root("");
        let node = root.document("profile");
        let err = node.attribute_at(&oid("/host/x")).unwrap_err();
        assert!(matches!(err, StateError::OidOutOfScope { .. }));

        let err = node.attribute_at(&oid("plugin:/profile/x")).unwrap_err();
        assert!(matches!(err, StateError::OidOutOfScope { .. }));

        let err = node.attribute_at(&oid("/profile")).unwrap_err();
        assert_eq!(err, StateError::EmptyPath);
    }

    #[test_timeout::timeout]
    fn merge_is_last_write_wins() {
        let mut root = Document::root("");
        let path = oid("/profile/abc/hostname");

        let first = UpdateRecord::new()
            .with(path.clone(), AttributeChange::set("laptop").at(Timestamp(2_000)));
        let second = UpdateRecord::new()
            .with(path.clone(), AttributeChange::set("desktop-1").at(Timestamp(1_000)));
        root.merge(&first).unwrap();
        root.merge(&second).unwrap();

        let attribute = root.find_attribute(&path).expect("populated");
        assert_eq!(attribute.value(), Some(&Value::from("desktop-1")));
        assert_eq!(attribute.timestamp(), Some(Timestamp(1_000)));
    }

    #[test_timeout::timeout]
    fn merge_stamps_local_clock_when_untimed() {
        let mut root = Document::root("");
        let path = oid("/a");
        let before = Timestamp::now();
        root.merge(&UpdateRecord::new().with(path.clone(), AttributeChange::set(1)))
            .unwrap();
        let stamped = root.find_attribute(&path).unwrap().timestamp().unwrap();
        assert!(stamped >= before);
    }

    #[test_timeout::timeout]
    fn merge_clear_unsets_value() {
        let mut root = Document::root("");
        let path = oid("/a/b");
        root.merge(&UpdateRecord::new().with(path.clone(), AttributeChange::set(true)))
            .unwrap();
        root.merge(&UpdateRecord::new().with(path.clone(), AttributeChange::clear()))
            .unwrap();
        let attribute = root.find_attribute(&path).unwrap();
        assert!(attribute.value().is_none());
        assert!(attribute.is_populated());
    }

    #[test_timeout::timeout]
    fn rejected_record_leaves_tree_untouched() {
        let mut root = Document::root("core");
        let record = UpdateRecord::new()
            .with(oid("core:/a"), AttributeChange::set(1))
            .with(oid("other:/b"), AttributeChange::set(2));
        assert!(root.merge(&record).is_err());
        assert!(root.find_attribute(&oid("core:/a")).is_none());
    }

    #[test_timeout::timeout]
    fn snapshot_skips_unpopulated_attributes() {
        let mut root = Document::root("");
        root.attribute_at(&oid("/empty/one")).unwrap();
        root.merge(
            &UpdateRecord::new()
                .with(oid("/host/1/os"), AttributeChange::set("linux"))
                .with(oid("/host/2/os"), AttributeChange::set("ios")),
        )
        .unwrap();
        let record = UpdateRecord::snapshot(&root);
        assert_eq!(record.len(), 2);
        assert!(record.get(&oid("/empty/one")).is_none());

        let host = root.find_document(&oid("/host/1")).unwrap();
        let partial = UpdateRecord::snapshot(host);
        assert_eq!(partial.len(), 1);
        assert!(partial.get(&oid("/host/1/os")).is_some());
    }
}
