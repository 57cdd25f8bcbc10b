use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StateError;

pub const NAMESPACE_DELIMITER: char = ':';
pub const SEGMENT_DELIMITER: char = '/';

/// Hierarchical identifier addressing a document or attribute in the tree.
///
/// The canonical text form is `[namespace:]/segment/segment`; the namespace
/// prefix is omitted for the default (empty) namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid {
    namespace: String,
    path: Vec<String>,
}

impl Oid {
    pub fn parse(text: &str) -> Result<Self, StateError> {
        let malformed = |reason| StateError::MalformedOid {
            text: text.to_string(),
            reason,
        };

        let (namespace, path) = match text.split_once(NAMESPACE_DELIMITER) {
            Some((namespace, path)) => {
                if namespace.is_empty() {
                    return Err(malformed("empty namespace"));
                }
                if namespace.contains(SEGMENT_DELIMITER) {
                    return Err(malformed("namespace contains a segment delimiter"));
                }
                if path.contains(NAMESPACE_DELIMITER) {
                    return Err(malformed("more than one namespace delimiter"));
                }
                (namespace, path)
            }
            None => ("", text),
        };

        let path = path.strip_prefix(SEGMENT_DELIMITER).unwrap_or(path);
        if path.is_empty() {
            return Err(malformed("empty path"));
        }
        let mut segments = Vec::new();
        for segment in path.split(SEGMENT_DELIMITER) {
            if segment.is_empty() {
                return Err(malformed("empty segment"));
            }
            segments.push(segment.to_string());
        }

        Ok(Self {
            namespace: namespace.to_string(),
            path: segments,
        })
    }

    /// Builds an Oid from already-split segments.
    pub fn new<I, S>(namespace: &str, segments: I) -> Result<Self, StateError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path: Vec<String> = segments.into_iter().map(Into::into).collect();
        let text = render(namespace, &path);
        if namespace.contains(SEGMENT_DELIMITER) || namespace.contains(NAMESPACE_DELIMITER) {
            return Err(StateError::MalformedOid {
                text,
                reason: "namespace contains a delimiter",
            });
        }
        if path.is_empty() {
            return Err(StateError::MalformedOid {
                text,
                reason: "empty path",
            });
        }
        if path.iter().any(|segment| !is_valid_segment(segment)) {
            return Err(StateError::MalformedOid {
                text,
                reason: "invalid segment",
            });
        }
        Ok(Self {
            namespace: namespace.to_string(),
            path,
        })
    }

    pub(crate) fn from_parts(namespace: &str, path: Vec<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            path,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Final segment; always present because the path is never empty.
    pub fn last(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Returns a new Oid with `segment` appended.
    ///
    /// Segments must not be empty or contain a delimiter.
    pub fn child(&self, segment: &str) -> Oid {
        debug_assert!(is_valid_segment(segment), "invalid oid segment {segment:?}");
        let mut path = self.path.clone();
        path.push(segment.to_string());
        Oid {
            namespace: self.namespace.clone(),
            path,
        }
    }

    pub fn parent(&self) -> Option<Oid> {
        if self.path.len() < 2 {
            return None;
        }
        Some(Oid {
            namespace: self.namespace.clone(),
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// True when `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &Oid) -> bool {
        self.namespace == prefix.namespace && self.path.starts_with(&prefix.path)
    }
}

pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains(SEGMENT_DELIMITER)
        && !segment.contains(NAMESPACE_DELIMITER)
}

pub(crate) fn render(namespace: &str, path: &[String]) -> String {
    let mut out = String::new();
    if !namespace.is_empty() {
        out.push_str(namespace);
        out.push(NAMESPACE_DELIMITER);
    }
    if path.is_empty() {
        out.push(SEGMENT_DELIMITER);
    }
    for segment in path {
        out.push(SEGMENT_DELIMITER);
        out.push_str(segment);
    }
    out
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.namespace, &self.path))
    }
}

impl FromStr for Oid {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Oid::parse(s)
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Oid::parse(&text).map_err(serde::de::Error::custom)
    }
}
