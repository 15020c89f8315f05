use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey, DocumentKeySet, DocumentSet};
use crate::util::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: Document,
}

/// Collapses successive changes of the same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        use ChangeType::*;

        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (old_type, new_type) => fail(format!(
                "unsupported combination of changes: {new_type:?} after {old_type:?}"
            )),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// A query result plus the changes since the previous one.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// First snapshot of a query: every document counts as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                change_type: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(query.comparator());
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    pub fn is_equal(&self, other: &ViewSnapshot) -> bool {
        self.from_cache == other.from_cache
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys.is_equal(&other.mutated_keys)
            && self.query == other.query
            && self.docs.is_equal(&other.docs)
            && self.old_docs.is_equal(&other.old_docs)
            && self.doc_changes == other.doc_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::ObjectValue;

    fn doc(path: &str, n: i64) -> Document {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single("n"), n.into());
        Document::synced(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn change(change_type: ChangeType, doc: Document) -> DocumentViewChange {
        DocumentViewChange { change_type, doc }
    }

    #[test]
    fn collapses_changes_per_document() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("c/a", 1)));
        set.track(change(ChangeType::Modified, doc("c/a", 2)));
        set.track(change(ChangeType::Modified, doc("c/b", 1)));
        set.track(change(ChangeType::Removed, doc("c/b", 1)));
        set.track(change(ChangeType::Added, doc("c/c", 1)));
        set.track(change(ChangeType::Removed, doc("c/c", 1)));
        set.track(change(ChangeType::Metadata, doc("c/d", 1)));
        set.track(change(ChangeType::Modified, doc("c/d", 4)));

        assert_eq!(
            set.into_changes(),
            vec![
                change(ChangeType::Added, doc("c/a", 2)),
                change(ChangeType::Removed, doc("c/b", 1)),
                change(ChangeType::Modified, doc("c/d", 4)),
            ]
        );
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, doc("c/a", 1)));
        set.track(change(ChangeType::Added, doc("c/a", 2)));
        assert_eq!(set.into_changes(), vec![change(ChangeType::Modified, doc("c/a", 2))]);
    }

    #[test]
    #[should_panic(expected = "unsupported combination")]
    fn added_twice_is_a_bug() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, doc("c/a", 1)));
        set.track(change(ChangeType::Added, doc("c/a", 1)));
    }
}
