use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::attribute::{Attribute, Timestamp};
use crate::document::Document;
use crate::error::StateError;
use crate::oid::Oid;
use crate::update::{AttributeChange, UpdateRecord};
use crate::value::Value;

const CHANGE_CHANNEL_DEPTH: usize = 1024;

/// Notification emitted for every attribute written by a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChanged {
    pub oid: Oid,
    pub value: Option<Value>,
    pub timestamp: Timestamp,
}

impl AttributeChanged {
    /// The change as a single-entry record, ready to replicate.
    pub fn to_record(&self) -> UpdateRecord {
        let change = AttributeChange {
            value: self.value.clone(),
            timestamp: Some(self.timestamp),
            ..AttributeChange::default()
        };
        UpdateRecord::new().with(self.oid.clone(), change)
    }
}

/// A state tree rooted at one namespace, shared between a session's reader
/// and its observers.
///
/// Merges take the write lock, so there is one writer at a time; reads see a
/// consistent tree between merges.
#[derive(Debug)]
pub struct StateTree {
    root: RwLock<Document>,
    changes: broadcast::Sender<AttributeChanged>,
}

impl StateTree {
    pub fn new(namespace: &str) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_DEPTH);
        Self {
            root: RwLock::new(Document::root(namespace)),
            changes,
        }
    }

    pub fn namespace(&self) -> String {
        self.root.read().namespace().to_string()
    }

    /// Applies `record` and notifies subscribers of every written attribute.
    pub fn merge(&self, record: &UpdateRecord) -> Result<usize, StateError> {
        let changed = self.root.write().merge(record)?;
        let count = changed.len();
        for event in changed {
            // no receivers is fine
            let _ = self.changes.send(event);
        }
        Ok(count)
    }

    /// Returns a copy of the attribute at `oid`, creating an empty one if the
    /// path has never been touched.
    pub fn attribute(&self, oid: &Oid) -> Result<Attribute, StateError> {
        if let Some(attribute) = self.root.read().find_attribute(oid) {
            return Ok(attribute.clone());
        }
        let mut root = self.root.write();
        Ok(root.attribute_at(oid)?.clone())
    }

    pub fn value(&self, oid: &Oid) -> Option<Value> {
        self.root
            .read()
            .find_attribute(oid)
            .and_then(|attribute| attribute.value().cloned())
    }

    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.root.read())
    }

    /// Encodes everything at or beneath `oid` that carries a value.
    pub fn snapshot(&self, oid: &Oid) -> Result<UpdateRecord, StateError> {
        let root = self.root.read();
        if oid.namespace() != root.namespace() {
            return Err(StateError::OidOutOfScope {
                oid: oid.to_string(),
                scope: format!("{}:/", root.namespace()),
            });
        }
        let mut record = match root.find_document(oid) {
            Some(document) => UpdateRecord::snapshot(document),
            None => UpdateRecord::new(),
        };
        if let Some(attribute) = root.find_attribute(oid) {
            if let Some(value) = attribute.value() {
                let mut change = AttributeChange::set(value.clone());
                change.timestamp = attribute.timestamp();
                record.entries.insert(oid.clone(), change);
            }
        }
        Ok(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttributeChanged> {
        self.changes.subscribe()
    }

    /// Subscribes to changes at or beneath `oid`.
    pub fn subscribe_to(&self, oid: &Oid) -> Subscription {
        Subscription {
            prefix: oid.clone(),
            receiver: self.changes.subscribe(),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Changes were overwritten before this subscriber read them.
    #[error("subscriber missed {skipped} changes")]
    Lagged { skipped: u64 },
    #[error("state tree dropped")]
    Closed,
}

/// Filtered view of a tree's change feed.
#[derive(Debug)]
pub struct Subscription {
    prefix: Oid,
    receiver: broadcast::Receiver<AttributeChanged>,
}

impl Subscription {
    pub fn prefix(&self) -> &Oid {
        &self.prefix
    }

    /// Next matching change.
    ///
    /// After [`SubscriptionError::Lagged`] the feed resumes at the newest
    /// change, so a caller that mirrors the subtree must take a fresh
    /// [`StateTree::snapshot`] before reading on.
    pub async fn recv(&mut self) -> Result<AttributeChanged, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.oid.starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "sandpolis::state",
                        prefix = %self.prefix,
                        skipped,
                        "subscriber lagged behind tree changes"
                    );
                    self.receiver = self.receiver.resubscribe();
                    return Err(SubscriptionError::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}
