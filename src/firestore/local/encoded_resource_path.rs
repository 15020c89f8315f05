//! Order-preserving string encodings for persisted keys.
//!
//! Resource paths are encoded so that plain string comparison of the
//! encoded form matches segment-wise comparison of the paths, and so that
//! every path sorts directly before its children. Integers are encoded as
//! fixed-width decimal strings so they sort numerically.

use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::model::ResourcePath;

const ESCAPE_CHAR: char = '\u{0001}';
const ENCODED_SEPARATOR: char = '\u{0001}';
const ENCODED_NUL: char = '\u{0010}';
const ENCODED_ESCAPE: char = '\u{0011}';

/// Separates the components of composite keys. Sorts below every character
/// that can appear in an encoded component.
pub const KEY_SEPARATOR: char = '\u{0000}';

pub fn encode_resource_path(path: &ResourcePath) -> String {
    let mut encoded = String::new();
    for segment in path.segments() {
        for ch in segment.chars() {
            match ch {
                '\u{0000}' => {
                    encoded.push(ESCAPE_CHAR);
                    encoded.push(ENCODED_NUL);
                }
                ESCAPE_CHAR => {
                    encoded.push(ESCAPE_CHAR);
                    encoded.push(ENCODED_ESCAPE);
                }
                other => encoded.push(other),
            }
        }
        encoded.push(ESCAPE_CHAR);
        encoded.push(ENCODED_SEPARATOR);
    }
    encoded
}

pub fn decode_resource_path(encoded: &str) -> FirestoreResult<ResourcePath> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE_CHAR {
            current.push(ch);
            continue;
        }
        match chars.next() {
            Some(ENCODED_SEPARATOR) => segments.push(std::mem::take(&mut current)),
            Some(ENCODED_NUL) => current.push('\u{0000}'),
            Some(ENCODED_ESCAPE) => current.push(ESCAPE_CHAR),
            _ => {
                return Err(data_loss(format!(
                    "Invalid encoded resource path: {encoded:?}"
                )))
            }
        }
    }
    if !current.is_empty() {
        return Err(data_loss(format!(
            "Encoded resource path is not terminated: {encoded:?}"
        )));
    }
    Ok(ResourcePath::new(segments))
}

/// Encoding of the path that sorts after every descendant of `path`.
pub fn prefix_successor(encoded: &str) -> String {
    // Every child starts with `encoded` followed by a character above the
    // separator, so bumping the final separator character bounds the range.
    let mut successor = encoded.to_string();
    if let Some(last) = successor.pop() {
        successor.push(char::from_u32(last as u32 + 1).unwrap_or(char::MAX));
    }
    successor
}

/// Fixed-width encoding of a signed integer that sorts numerically.
pub fn encode_number(value: i64) -> String {
    format!("{:020}", (value as u64) ^ (1u64 << 63))
}

pub fn decode_number(encoded: &str) -> FirestoreResult<i64> {
    encoded
        .parse::<u64>()
        .map(|raw| (raw ^ (1u64 << 63)) as i64)
        .map_err(|_| data_loss(format!("Invalid encoded number: {encoded:?}")))
}

/// Joins key components with [`KEY_SEPARATOR`].
pub fn composite_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Prefix shared by every composite key whose leading components are `parts`.
pub fn composite_prefix(parts: &[&str]) -> String {
    let mut prefix = composite_key(parts);
    prefix.push(KEY_SEPARATOR);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> ResourcePath {
        ResourcePath::from_string(value).unwrap()
    }

    #[test]
    fn encoding_preserves_segment_order() {
        let ordered = ["a", "a/b", "a/b/c", "a-b", "a-b/c", "b"];
        let encoded: Vec<String> = ordered
            .iter()
            .map(|value| encode_resource_path(&path(value)))
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn escapes_control_characters() {
        let tricky = ResourcePath::new(vec!["a\u{0001}b".to_string(), "c\u{0000}".to_string()]);
        let encoded = encode_resource_path(&tricky);
        assert_eq!(decode_resource_path(&encoded).unwrap(), tricky);
    }

    #[test]
    fn successor_bounds_descendants() {
        let parent = encode_resource_path(&path("coll"));
        let child = encode_resource_path(&path("coll/doc"));
        let sibling = encode_resource_path(&path("coll2"));
        let end = prefix_successor(&parent);
        assert!(child > parent && child < end);
        assert!(sibling > end);
    }

    #[test]
    fn numbers_sort_numerically() {
        let values = [i64::MIN, -5, -1, 0, 1, 9, 10, i64::MAX];
        let encoded: Vec<String> = values.iter().map(|value| encode_number(*value)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert_eq!(decode_number(&encode_number(-5)).unwrap(), -5);
    }
}
