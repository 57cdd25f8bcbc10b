use thiserror::Error;

/// Caller-side errors raised while building or resolving paths in the tree.
///
/// These are never retried; they indicate a bad path rather than a bad peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("malformed oid '{text}': {reason}")]
    MalformedOid { text: String, reason: &'static str },
    #[error("oid resolves to an empty path")]
    EmptyPath,
    #[error("oid {oid} is outside of {scope}")]
    OidOutOfScope { oid: String, scope: String },
}
