use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MaybeDocumentMap, SnapshotVersion, TargetId,
};
use crate::firestore::value::BytesValue;

/// Everything the watch stream reported up to one consistent snapshot.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match. Their persisted query
    /// results must be discarded and re-listened without a resume token.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: MaybeDocumentMap,
    /// Documents that only limbo resolution targets reported on.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeSet::new(),
            document_updates: MaybeDocumentMap::default(),
            resolved_limbo_documents: DocumentKeySet::default(),
        }
    }

    /// Event that only flips the `current` flag of one target, used when
    /// another client reports the target state.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool) -> Self {
        let mut event = Self::new(SnapshotVersion::min());
        event.target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current),
        );
        event
    }
}

/// Per-target part of a [`RemoteEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: BytesValue,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool) -> Self {
        Self {
            resume_token: BytesValue::empty(),
            current,
            added_documents: DocumentKeySet::default(),
            modified_documents: DocumentKeySet::default(),
            removed_documents: DocumentKeySet::default(),
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.added_documents.has(key)
            || self.modified_documents.has(key)
            || self.removed_documents.has(key)
    }
}
