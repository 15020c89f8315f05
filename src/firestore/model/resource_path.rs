use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash-separated path to a collection or document, relative to the
/// database's documents root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(segments.into_iter().map(Into::into).collect())
    }

    /// Parses `"rooms/a/messages"`. Leading and trailing slashes are
    /// ignored; an empty segment inside the path is an error.
    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument(format!(
                "Invalid path ({path}). Paths must not contain // in them."
            )));
        }
        Ok(Self::from_segments(segments))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut child = self.segments.clone();
        child.extend(segments.into_iter().map(Into::into));
        Self::new(child)
    }

    /// The parent path. The root is its own parent.
    pub fn without_last(&self) -> Self {
        let keep = self.segments.len().saturating_sub(1);
        Self::new(self.segments[..keep].to_vec())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    /// Segment-wise ordering; a path sorts before any path it is a prefix of.
    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        left.segments
            .iter()
            .zip(&right.segments)
            .map(|(l, r)| l.cmp(r))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| left.len().cmp(&right.len()))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_collection_path() {
        let path = ResourcePath::from_string("/rooms/eros/messages/").unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.last_segment(), Some("messages"));
        assert_eq!(path.to_string(), "rooms/eros/messages");
        assert_eq!(path.without_last().to_string(), "rooms/eros");
        assert!(ResourcePath::from_string("").unwrap().is_empty());
        assert!(ResourcePath::root().without_last().is_empty());
    }

    #[test]
    fn orders_segment_wise_with_prefix_first() {
        let a = ResourcePath::from_string("rooms/a").unwrap();
        let ab = ResourcePath::from_string("rooms/a/messages/1").unwrap();
        let b = ResourcePath::from_string("rooms/b").unwrap();
        assert!(a < ab);
        assert!(ab < b);
        assert!(a.is_prefix_of(&ab));
        assert!(!a.is_immediate_parent_of(&ab));
        assert!(a.is_immediate_parent_of(&a.child(["messages"])));
    }

    #[test]
    fn rejects_empty_segments() {
        let err = ResourcePath::from_string("rooms//a").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
