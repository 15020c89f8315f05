//! Per-query result set computation.
//!
//! A [`View`] turns document changes into [`ViewSnapshot`]s, keeps a limit
//! query at its limit, and tracks which documents are in limbo: part of the
//! local result although the backend never reported them for the target.

use std::cmp::Ordering;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::model::{
    Document, DocumentKey, DocumentKeySet, DocumentSet, MaybeDocument, MaybeDocumentMap,
};
use crate::firestore::remote::remote_event::TargetChange;
use crate::util::hard_assert;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit edge moved. The changes must be recomputed from a full
    /// query against the local store.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Whether the backend marked the target current.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reported for the target.
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    /// Documents with local changes not yet acknowledged.
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            synced_documents,
            limbo_documents: DocumentKeySet::default(),
            mutated_keys: DocumentKeySet::default(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    /// Diffs `doc_changes` against the current result. Pass the result of
    /// a previous call as `previous_changes` to extend it (used for refills).
    pub fn compute_doc_changes(
        &self,
        doc_changes: &MaybeDocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let is_refill = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let at_limit = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() as i64 == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };
        let comparator = self.query.comparator();

        for (key, new_maybe_doc) in doc_changes.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = match new_maybe_doc {
                MaybeDocument::Document(doc) => {
                    hard_assert(
                        doc.key() == key,
                        format!("Mismatching keys found in document changes: {key} != {}", doc.key()),
                    );
                    self.query.matches(doc).then_some(doc)
                }
                _ => None,
            };

            let old_doc_had_pending_mutations =
                old_doc.is_some_and(|doc| self.mutated_keys.has(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.has(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                comparator(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                comparator(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved past the limit edge; a
                                // cached document may now take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        // A limit query lost a document; the next one may
                        // only be in the cache.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set = new_document_set.add(new_doc.clone());
                        new_mutated_keys = if new_doc_has_pending_mutations {
                            new_mutated_keys.add(key.clone())
                        } else {
                            new_mutated_keys.delete(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.delete(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while new_document_set.len() as i64 > limit {
                let trimmed = match self.query.limit_type() {
                    LimitType::First => new_document_set.last(),
                    LimitType::Last => new_document_set.first(),
                }
                .cloned();
                let Some(trimmed) = trimmed else {
                    break;
                };
                new_document_set = new_document_set.delete(trimmed.key());
                new_mutated_keys = new_mutated_keys.delete(trimmed.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: trimmed,
                });
            }
        }

        hard_assert(
            !needs_refill || !is_refill,
            "View was refilled using docs that themselves needed refilling.",
        );
        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Commits `doc_changes` and produces a snapshot when the result or the
    /// sync state changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let comparator = self.query.comparator();
        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| comparator(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };
        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: doc_changes.document_set,
                old_docs,
                doc_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline makes a current view serve from cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None)
        } else {
            ViewChange::default()
        }
    }

    /// Recomputes the view from what persistence holds, used when another
    /// client changed the cache.
    pub fn synchronize_with_persisted_state(
        &mut self,
        local_docs: &MaybeDocumentMap,
        remote_keys: DocumentKeySet,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        self.limbo_documents = DocumentKeySet::default();
        let doc_changes = self.compute_doc_changes(local_docs, None);
        self.apply_changes(doc_changes, true, None)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(target_change) = target_change else {
            return;
        };
        for key in target_change.added_documents.iter() {
            self.synced_documents = self.synced_documents.add(key.clone());
        }
        for key in target_change.modified_documents.iter() {
            hard_assert(
                self.synced_documents.has(key),
                format!("Modified document {key} not found in view."),
            );
        }
        for key in target_change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.delete(key);
        }
        self.current = target_change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.has(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local edits are not expected to be in the server result.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Until the target is current the synced set is incomplete.
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::take(&mut self.limbo_documents);
        let limbo: DocumentKeySet = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();
        self.limbo_documents = limbo;

        let mut changes = Vec::new();
        for key in old_limbo_documents.iter() {
            if !self.limbo_documents.has(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in self.limbo_documents.iter() {
            if !old_limbo_documents.has(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }
}

/// Suppresses the `Modified` event of an acknowledged local write whose
/// data the watch stream has not confirmed yet; the synced version follows.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::{Direction, OrderBy};
    use crate::firestore::model::{
        document_key_set, DocumentState, FieldPath, NoDocument, ResourcePath, SnapshotVersion,
    };
    use crate::firestore::value::ObjectValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc_with_state(path: &str, version: i64, score: i64, state: DocumentState) -> Document {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single("score"), score.into());
        Document::new(key(path), SnapshotVersion::from_micros(version), data, state)
    }

    fn doc(path: &str, version: i64, score: i64) -> Document {
        doc_with_state(path, version, score, DocumentState::Synced)
    }

    fn changes(docs: Vec<MaybeDocument>) -> MaybeDocumentMap {
        docs.into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect()
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn current_change(keys: &[&str]) -> TargetChange {
        TargetChange {
            current: true,
            added_documents: document_key_set(keys.iter().map(|path| key(path))),
            ..TargetChange::synthesized_for_current_change(true)
        }
    }

    fn snapshot_keys(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.docs.keys().map(ToString::to_string).collect()
    }

    #[test]
    fn adds_and_removes_documents() {
        let mut view = View::new(rooms(), DocumentKeySet::default());
        let first = view.compute_doc_changes(
            &changes(vec![doc("rooms/a", 1, 1).into(), doc("rooms/b", 1, 2).into()]),
            None,
        );
        let snapshot = view.apply_changes(first, true, None).snapshot.unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/a", "rooms/b"]);
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);

        let deleted = NoDocument::new(key("rooms/a"), SnapshotVersion::from_micros(2), false);
        let second = view.compute_doc_changes(&changes(vec![deleted.into()]), None);
        let snapshot = view.apply_changes(second, true, None).snapshot.unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/b"]);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Removed);
        assert!(!snapshot.sync_state_changed);
    }

    #[test]
    fn limit_query_requests_refill_when_edge_document_moves_out() {
        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::from_single("score"), Direction::Descending))
            .with_limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::default());
        let initial = view.compute_doc_changes(
            &changes(vec![
                doc("rooms/d1", 1, 10).into(),
                doc("rooms/d2", 1, 8).into(),
                doc("rooms/d3", 1, 5).into(),
            ]),
            None,
        );
        let snapshot = view.apply_changes(initial, true, None).snapshot.unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/d1", "rooms/d2"]);

        let lowered = view.compute_doc_changes(&changes(vec![doc("rooms/d1", 2, 3).into()]), None);
        assert!(lowered.needs_refill);

        // The refill replays the whole cached result on top.
        let cache = changes(vec![
            doc("rooms/d1", 2, 3).into(),
            doc("rooms/d2", 1, 8).into(),
            doc("rooms/d3", 1, 5).into(),
        ]);
        let refilled = view.compute_doc_changes(&cache, Some(lowered));
        assert!(!refilled.needs_refill);
        let snapshot = view.apply_changes(refilled, true, None).snapshot.unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/d2", "rooms/d3"]);
    }

    #[test]
    fn limit_to_last_keeps_the_tail() {
        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::from_single("score"), Direction::Ascending))
            .with_limit_to_last(2);
        let mut view = View::new(query, DocumentKeySet::default());
        let initial = view.compute_doc_changes(
            &changes(vec![
                doc("rooms/a", 1, 1).into(),
                doc("rooms/b", 1, 2).into(),
                doc("rooms/c", 1, 3).into(),
            ]),
            None,
        );
        let snapshot = view.apply_changes(initial, true, None).snapshot.unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn acknowledged_write_waits_for_synced_version() {
        let mut view = View::new(rooms(), DocumentKeySet::default());
        let local = doc_with_state("rooms/a", 0, 1, DocumentState::LocalMutations);
        let first = view.compute_doc_changes(&changes(vec![local.into()]), None);
        let snapshot = view.apply_changes(first, true, None).snapshot.unwrap();
        assert!(snapshot.has_pending_writes());

        let committed = doc_with_state("rooms/a", 5, 2, DocumentState::CommittedMutations);
        let second = view.compute_doc_changes(&changes(vec![committed.into()]), None);
        assert!(second.change_set.is_empty());

        let synced = doc("rooms/a", 5, 2);
        let third = view.compute_doc_changes(&changes(vec![synced.into()]), None);
        let snapshot = view.apply_changes(third, true, None).snapshot.unwrap();
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Modified);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn unconfirmed_documents_enter_limbo_once_current() {
        let mut view = View::new(rooms(), DocumentKeySet::default());
        let docs = changes(vec![doc("rooms/a", 1, 1).into(), doc("rooms/b", 1, 2).into()]);
        let computed = view.compute_doc_changes(&docs, None);
        let change = view.apply_changes(computed, true, Some(&current_change(&["rooms/a"])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(change.snapshot.unwrap().from_cache);

        let computed = view.compute_doc_changes(&MaybeDocumentMap::default(), None);
        let change = view.apply_changes(computed, true, Some(&current_change(&["rooms/b"])));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("rooms/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn going_offline_marks_view_from_cache() {
        let mut view = View::new(rooms(), DocumentKeySet::default());
        let computed = view.compute_doc_changes(&changes(vec![doc("rooms/a", 1, 1).into()]), None);
        let snapshot = view
            .apply_changes(computed, true, Some(&current_change(&["rooms/a"])))
            .snapshot
            .unwrap();
        assert!(!snapshot.from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        assert!(offline.snapshot.unwrap().from_cache);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
