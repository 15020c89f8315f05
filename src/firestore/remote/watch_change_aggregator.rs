use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MaybeDocument, MaybeDocumentMap, NoDocument, SnapshotVersion,
    TargetId,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::firestore::value::BytesValue;
use crate::util::assert::hard_assert;

const LOG_TAG: &str = "WatchChangeAggregator";

/// Lets the aggregator see what the client already knows about its targets.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local cache associates with the target, as of the last
    /// applied remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data of an active listen, or `None` if the target is no longer
    /// listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Changes accumulated for one target since the last remote event.
struct TargetState {
    /// Listen and unlisten requests the backend has not acknowledged yet.
    /// Changes for a target with outstanding requests are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: BytesValue,
    current: bool,
    /// Starts out true so the first remote event after a listen includes the
    /// target even when nothing changed.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: BytesValue::empty(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &BytesValue) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::synthesized_for_current_change(self.current);
        change.resume_token = self.resume_token.clone();
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => {
                    change.added_documents = change.added_documents.add(key.clone());
                }
                ChangeType::Modified => {
                    change.modified_documents = change.modified_documents.add(key.clone());
                }
                ChangeType::Removed => {
                    change.removed_documents = change.removed_documents.add(key.clone());
                }
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch changes into [`RemoteEvent`]s at consistent snapshot boundaries.
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: MaybeDocumentMap,
    /// Every target a pending document update touched.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>) -> Self {
        Self {
            metadata,
            target_states: HashMap::new(),
            pending_document_updates: MaybeDocumentMap::default(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(MaybeDocument::Document(doc)) => {
                    self.add_document_to_target(*target_id, MaybeDocument::Document(doc.clone()));
                }
                Some(deleted @ MaybeDocument::NoDocument(_)) => {
                    self.remove_document_from_target(
                        *target_id,
                        change.key.clone(),
                        Some(deleted.clone()),
                    );
                }
                _ => {}
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, change.key.clone(), change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.targets_for(change) {
            let is_active = self.is_active_target(target_id);
            let state = self.ensure_target_state(target_id);
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if is_active {
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    // The target is only active once every outstanding
                    // request has been answered.
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "WatchChangeAggregator does not handle errored targets",
                    );
                }
                WatchTargetChangeState::Current => {
                    if is_active {
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if is_active {
                        // Drop the accumulated state and refill it from the
                        // messages that follow.
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count against the local one. A
    /// mismatch resets the target so it can be re-listened from scratch.
    pub fn handle_existence_filter(&mut self, change: ExistenceFilterChange) {
        let target_id = change.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };
        let target = target_data.target;
        if target.is_document_query() {
            if change.count == 0 {
                // The document was deleted before the listen started, so
                // watch sends no delete for it.
                if let Ok(key) = DocumentKey::from_path(target.path.clone()) {
                    let deleted = NoDocument::new(key.clone(), SnapshotVersion::min(), false);
                    self.remove_document_from_target(target_id, key, Some(deleted.into()));
                }
            } else {
                hard_assert(
                    change.count == 1,
                    "Single document existence filter with count > 1",
                );
            }
        } else {
            let current_size = self.current_document_count_for_target(target_id);
            if current_size != change.count {
                log::debug!(
                    "{LOG_TAG}: existence filter mismatch for target {target_id}: local {current_size}, backend {}",
                    change.count
                );
                self.reset_target(target_id);
                self.pending_target_resets.insert(target_id);
            }
        }
    }

    /// Builds the event for everything accumulated so far and clears the
    /// pending document updates.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_query() {
                // A current document target without the document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if self.pending_document_updates.get(&key).is_none()
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = NoDocument::new(key.clone(), snapshot_version, false);
                        self.remove_document_from_target(target_id, key, Some(deleted.into()));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::default();
        // Documents only limbo targets reported on are not tracked for GC
        // purposes by any user-facing query.
        for (key, targets) in &self.pending_document_target_mapping {
            let is_only_limbo_target = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if is_only_limbo_target {
                resolved_limbo_documents = resolved_limbo_documents.add(key.clone());
            }
        }

        let mut event = RemoteEvent::new(snapshot_version);
        event.target_changes = target_changes;
        event.target_mismatches = std::mem::take(&mut self.pending_target_resets);
        event.document_updates = std::mem::take(&mut self.pending_document_updates);
        event.resolved_limbo_documents = resolved_limbo_documents;
        self.pending_document_target_mapping.clear();
        event
    }

    /// Called when a listen or unlisten request is sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    /// Forgets a target the backend rejected.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn targets_for(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut ids: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn add_document_to_target(&mut self, target_id: TargetId, doc: MaybeDocument) {
        if !self.is_active_target(target_id) {
            log::debug!("{LOG_TAG}: ignoring document for inactive target {target_id}");
            return;
        }
        let key = doc.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates = self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes `key` from the target. `updated_doc` is written to the cache
    /// when the document was deleted rather than just leaving the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_doc: Option<MaybeDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within this event: nothing to report.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_doc {
            self.pending_document_updates = self.pending_document_updates.insert(key, doc);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = self.metadata.get_remote_keys_for_target(target_id).len() as i64;
        remote + change.added_documents.len() as i64 - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        self.target_data_for_active_target(target_id).is_some()
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }

    fn reset_target(&mut self, target_id: TargetId) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .map(TargetState::is_pending)
                .unwrap_or(false),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        let existing_keys = self.metadata.get_remote_keys_for_target(target_id);
        for key in existing_keys.iter() {
            self.remove_document_from_target(target_id, key.clone(), None);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata
            .get_remote_keys_for_target(target_id)
            .has(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::firestore::core::target::Target;
    use crate::firestore::model::{document_key_set, Document, ResourcePath};
    use crate::firestore::value::ObjectValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: Mutex<BTreeMap<TargetId, TargetData>>,
        remote_keys: Mutex<BTreeMap<TargetId, DocumentKeySet>>,
    }

    impl TestMetadata {
        fn listen(&self, target_id: TargetId, target: Target, purpose: TargetPurpose) {
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
        }

        fn set_keys(&self, target_id: TargetId, keys: &[&str]) {
            self.remote_keys
                .lock()
                .unwrap()
                .insert(target_id, document_key_set(keys.iter().map(|path| key(path))));
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn collection_target(path: &str) -> Target {
        crate::firestore::core::query::Query::new(ResourcePath::from_string(path).unwrap())
            .to_target()
    }

    fn doc(path: &str, micros: i64) -> MaybeDocument {
        Document::synced(key(path), SnapshotVersion::from_micros(micros), ObjectValue::empty())
            .into()
    }

    fn doc_change(updated: Vec<TargetId>, removed: Vec<TargetId>, doc: MaybeDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: doc.key().clone(),
            new_doc: Some(doc),
        }
    }

    fn setup() -> (Arc<TestMetadata>, WatchChangeAggregator) {
        let metadata = Arc::new(TestMetadata::default());
        let aggregator = WatchChangeAggregator::new(metadata.clone());
        (metadata, aggregator)
    }

    #[test]
    fn aggregates_document_changes_into_one_event() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target("rooms"), TargetPurpose::Listen);
        metadata.set_keys(2, &["rooms/b"]);

        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("rooms/a", 5)));
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("rooms/b", 5)));
        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                .with_resume_token(BytesValue::new(vec![9])),
        );

        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.current);
        assert!(change.added_documents.has(&key("rooms/a")));
        assert!(change.modified_documents.has(&key("rooms/b")));
        assert_eq!(change.resume_token, BytesValue::new(vec![9]));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes_until_acknowledged() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target("rooms"), TargetPurpose::Listen);
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("rooms/a", 5)));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());

        aggregator.handle_target_change(&WatchTargetChange::new(
            WatchTargetChangeState::Added,
            vec![2],
        ));
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("rooms/a", 6)));
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(6));
        assert!(event.target_changes[&2].added_documents.has(&key("rooms/a")));
    }

    #[test]
    fn existence_filter_mismatch_resets_the_target() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target("rooms"), TargetPurpose::Listen);
        metadata.set_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);

        aggregator.handle_existence_filter(ExistenceFilterChange {
            target_id: 2,
            count: 2,
        });
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(7));
        assert!(event.target_mismatches.contains(&2));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 3);
        assert!(!change.current);
        assert!(change.resume_token.is_empty());
    }

    #[test]
    fn current_document_target_without_document_synthesizes_a_delete() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(1, Target::for_document(&key("rooms/a")), TargetPurpose::LimboResolution);

        aggregator.handle_target_change(&WatchTargetChange::new(
            WatchTargetChangeState::Current,
            vec![1],
        ));
        let version = SnapshotVersion::from_micros(9);
        let event = aggregator.create_remote_event(version);
        let update = event.document_updates.get(&key("rooms/a")).unwrap();
        assert!(update.is_no_document());
        assert_eq!(update.version(), version);
        assert!(event.resolved_limbo_documents.has(&key("rooms/a")));
    }

    #[test]
    fn document_added_then_removed_in_one_event_is_not_reported() {
        let (metadata, mut aggregator) = setup();
        metadata.listen(2, collection_target("rooms"), TargetPurpose::Listen);

        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("rooms/a", 5)));
        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![],
            removed_target_ids: vec![2],
            key: key("rooms/a"),
            new_doc: None,
        });
        let event = aggregator.create_remote_event(SnapshotVersion::from_micros(5));
        assert!(!event.target_changes[&2].has_document_changes());
    }
}
