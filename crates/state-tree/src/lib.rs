//! The replicated State Tree: `Oid` addressing, the lazily-populated
//! document/attribute graph, and the update records that move deltas of it
//! across the wire.

pub mod attribute;
pub mod codec;
pub mod document;
pub mod error;
pub mod oid;
pub mod tree;
pub mod update;
pub mod value;

pub use attribute::{Attribute, Timestamp};
pub use codec::wire::{RawField, WireError};
pub use document::Document;
pub use error::StateError;
pub use oid::Oid;
pub use tree::{AttributeChanged, StateTree, Subscription, SubscriptionError};
pub use update::{AttributeChange, UpdateRecord};
pub use value::{InstanceFlavor, InstanceType, OsType, Value};
