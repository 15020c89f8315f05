use std::collections::BTreeSet;

use crate::firestore::model::{DocumentKey, DocumentKeySet};

/// Tracks which ids (targets or mutation batches) hold a reference to which
/// documents, indexed both ways.
#[derive(Debug, Default, Clone)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys.iter() {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys = self.referenced_keys(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn referenced_keys(&self, id: i32) -> Vec<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(found, _)| found == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::document_key_set;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_per_id() {
        let mut refs = ReferenceSet::new();
        refs.add_references(&document_key_set([key("c/a"), key("c/b")]), 1);
        refs.add_reference(key("c/b"), 2);

        assert_eq!(refs.referenced_keys(1), vec![key("c/a"), key("c/b")]);
        assert!(refs.contains_key(&key("c/b")));

        assert_eq!(refs.remove_references_for_id(1), vec![key("c/a"), key("c/b")]);
        assert!(!refs.contains_key(&key("c/a")));
        assert!(refs.contains_key(&key("c/b")));

        refs.remove_reference(&key("c/b"), 2);
        assert!(refs.is_empty());
    }
}
