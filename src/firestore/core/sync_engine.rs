use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::event_manager::{ListenSource, SyncEngineListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{
    ClientId, MutationBatchState, OnlineState, OnlineStateSource, QueryTargetState,
};
use crate::firestore::core::view::{LimboDocumentChange, View, ViewChange};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{
    cancelled, ignore_if_primary_lease_loss, wrap_in_user_error_if_recoverable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::local_store::{LocalStore, LocalViewChanges};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{SharedClientState, SharedClientStateSyncer};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    document_key_set, BatchId, DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationBatchResult, NoDocument, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::util::{fail, hard_assert};

const LOG_TAG: &str = "SyncEngine";

/// Completion of a user write or of a wait for pending writes.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target reported the document. Until then the
    /// target's remote keys are empty.
    received_document: bool,
}

/// Remote store calls collected under the state lock and issued after it
/// is released, in order.
enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    current_user: User,
    /// Unset until persistence reports the first primary state.
    is_primary: Option<bool>,
    online_state: OnlineState,
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views consider which documents to be in limbo.
    limbo_document_refs: ReferenceSet,
    mutation_user_callbacks: BTreeMap<User, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
}

impl SyncEngineState {
    fn is_primary_client(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        actions: &mut Vec<RemoteAction>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, actions);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("{LOG_TAG}: document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, actions: &mut Vec<RemoteAction>) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("{LOG_TAG}: new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Starts queued limbo resolutions while slots are free.
    fn pump_enqueued_limbo_resolutions(&mut self, actions: &mut Vec<RemoteAction>) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            actions.push(RemoteAction::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut Vec<RemoteAction>) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        // Gone already when the limbo listen was rejected.
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        actions.push(RemoteAction::Unlisten(limbo_target_id));
        self.active_limbo_resolutions_by_target
            .remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(actions);
    }
}

fn as_maybe_documents(documents: &DocumentMap) -> MaybeDocumentMap {
    documents
        .iter()
        .fold(MaybeDocumentMap::default(), |map, (key, doc)| {
            map.insert(key.clone(), MaybeDocument::Document(doc.clone()))
        })
}

/// Turns local and remote document changes into view snapshots.
///
/// Each query maps to one target; queries with the same target share it.
/// Documents a view holds without backend confirmation are resolved by
/// dedicated single-document limbo listens. Every method runs on the
/// client's async queue.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    state: Mutex<SyncEngineState>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            listener: Mutex::new(None),
            state: Mutex::new(SyncEngineState {
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
                query_views: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                max_concurrent_limbo_resolutions,
            }),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
    }

    pub fn is_primary_client(&self) -> bool {
        self.state().is_primary_client()
    }

    pub fn current_user(&self) -> User {
        self.state().current_user.clone()
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Limbo documents with a running resolution listen.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a resolution slot.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    async fn run_remote_actions(&self, actions: Vec<RemoteAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    /// Persists `mutations` as one batch and raises the local view. The
    /// callback completes once the backend acknowledged or rejected the
    /// batch.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.local_write(mutations).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("{LOG_TAG}: failed to persist write: {err}");
                let _ = callback.send(Err(wrap_in_user_error_if_recoverable(
                    err,
                    "Failed to persist write",
                )));
                return Ok(());
            }
        };
        self.shared_client_state.add_pending_mutation(result.batch_id);
        {
            let mut state = self.state();
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, callback);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Completes `callback` once every batch queued so far is acknowledged
    /// or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "{LOG_TAG}: the network is disabled. Waiting for pending writes will not complete until the network is enabled."
            );
        }
        match self.local_store.get_highest_unacknowledged_batch_id().await {
            Ok(BATCH_ID_UNKNOWN) => {
                let _ = callback.send(Ok(()));
            }
            Ok(batch_id) => {
                self.state()
                    .pending_writes_callbacks
                    .entry(batch_id)
                    .or_default()
                    .push(callback);
            }
            Err(err) => {
                let _ = callback.send(Err(wrap_in_user_error_if_recoverable(
                    err,
                    "Initialization of waitForPendingWrites() operation failed",
                )));
            }
        }
    }

    fn process_user_callback(&self, batch_id: BatchId, error: Option<FirestoreError>) {
        let callback = {
            let mut state = self.state();
            let user = state.current_user.clone();
            // Batches restored from persistence have no callback.
            state
                .mutation_user_callbacks
                .get_mut(&user)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(callback) = callback {
            let _ = callback.send(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self
            .state()
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default();
        for callback in callbacks {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.state().pending_writes_callbacks);
        for callback in callbacks.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        current: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&as_maybe_documents(&query_result.documents), None);

        let mut actions = Vec::new();
        let snapshot = {
            let mut state = self.state();
            let synthesized = TargetChange::synthesized_for_current_change(
                current && state.online_state != OnlineState::Offline,
            );
            let view_change = view.apply_changes(doc_changes, state.is_primary_client(), Some(&synthesized));
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);

            state.query_views.insert(
                query.canonical_id(),
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            state.queries_by_target.entry(target_id).or_default().push(query);
            view_change.snapshot
        };
        self.run_remote_actions(actions).await?;
        match snapshot {
            Some(snapshot) => Ok(snapshot),
            None => fail("applyChanges for new view should always return a snapshot"),
        }
    }

    /// Runs `changes` through the view of `canonical_id`, refilling limit
    /// queries from the local store when needed.
    async fn apply_doc_changes(
        &self,
        canonical_id: &str,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<ViewSnapshot>> {
        let computed = {
            let state = self.state();
            state.query_views.get(canonical_id).map(|query_view| {
                (
                    query_view.query.clone(),
                    query_view.target_id,
                    query_view.view.compute_doc_changes(changes, None),
                )
            })
        };
        let Some((query, target_id, mut doc_changes)) = computed else {
            return Ok(None);
        };

        if doc_changes.needs_refill {
            // Documents past the limit may now belong to the result.
            let result = self.local_store.execute_query(&query, false).await?;
            let documents = as_maybe_documents(&result.documents);
            let state = self.state();
            let Some(query_view) = state.query_views.get(canonical_id) else {
                return Ok(None);
            };
            doc_changes = query_view.view.compute_doc_changes(&documents, Some(doc_changes));
        }

        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let mut actions = Vec::new();
        let snapshot = {
            let mut state = self.state();
            let is_primary = state.is_primary_client();
            let Some(query_view) = state.query_views.get_mut(canonical_id) else {
                return Ok(None);
            };
            let view_change = query_view.view.apply_changes(doc_changes, is_primary, target_change);
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
            view_change.snapshot
        };
        self.run_remote_actions(actions).await?;
        Ok(snapshot)
    }

    /// Applies `changes` to every view, raises the resulting snapshots and
    /// records which documents the views now hold.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let views: Vec<(String, TargetId)> = self
            .state()
            .query_views
            .iter()
            .map(|(canonical_id, query_view)| (canonical_id.clone(), query_view.target_id))
            .collect();
        if views.is_empty() {
            return Ok(());
        }

        let mut new_snapshots = Vec::new();
        let mut doc_changes_in_all_views = Vec::new();
        for (canonical_id, target_id) in views {
            let snapshot = self
                .apply_doc_changes(&canonical_id, changes, remote_event)
                .await?;
            if (snapshot.is_some() || remote_event.is_some()) && self.is_primary_client() {
                let query_state = if snapshot.as_ref().is_some_and(|snapshot| snapshot.from_cache) {
                    QueryTargetState::NotCurrent
                } else {
                    QueryTargetState::Current
                };
                self.shared_client_state
                    .update_query_state(target_id, query_state, None);
            }
            if let Some(snapshot) = snapshot {
                doc_changes_in_all_views.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        self.raise_snapshots(new_snapshots);
        self.local_store
            .notify_local_view_changes(doc_changes_in_all_views)
            .await
    }

    /// Drops every query of `target_id`. With an error, their listeners are
    /// told the listen failed.
    async fn remove_and_cleanup_target(
        &self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        let mut actions = Vec::new();
        let queries = {
            let mut state = self.state();
            let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
            hard_assert(
                !queries.is_empty(),
                format!("There are no queries mapped to target id {target_id}"),
            );
            for query in &queries {
                state.query_views.remove(&query.canonical_id());
            }
            if state.is_primary_client() {
                let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
                for key in limbo_keys {
                    if !state.limbo_document_refs.contains_key(&key) {
                        state.remove_limbo_target(&key, &mut actions);
                    }
                }
            }
            queries
        };
        if let Some(error) = error {
            if let Some(listener) = self.listener() {
                for query in &queries {
                    listener.on_watch_error(query, error.clone());
                }
            }
        }
        self.run_remote_actions(actions).await
    }

    async fn apply_remote_event_inner(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.local_store.apply_remote_event(event.clone()).await?;
        {
            let mut state = self.state();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                hard_assert(
                    change.added_documents.len()
                        + change.modified_documents.len()
                        + change.removed_documents.len()
                        <= 1,
                    "Limbo resolution for single document contains multiple changes.",
                );
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received change for limbo target document without add.",
                    );
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received remove for limbo target document without add.",
                    );
                    resolution.received_document = false;
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
            .await
    }

    fn apply_online_state_change_from(&self, online_state: OnlineState, source: OnlineStateSource) {
        let new_snapshots = {
            let mut state = self.state();
            // A secondary follows the primary's online state, never its own
            // remote store.
            let applies = match source {
                OnlineStateSource::RemoteStore => state.is_primary_client(),
                OnlineStateSource::SharedClientState => !state.is_primary_client(),
            };
            if !applies {
                return;
            }
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                let ViewChange {
                    snapshot,
                    limbo_changes,
                } = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    limbo_changes.is_empty(),
                    "OnlineState should not affect limbo documents.",
                );
                snapshots.extend(snapshot);
            }
            state.online_state = online_state;
            snapshots
        };

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            if !new_snapshots.is_empty() {
                listener.on_watch_change(new_snapshots);
            }
        }
        if self.is_primary_client() {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Online state reported by the primary through the shared state.
    pub fn apply_shared_online_state(&self, online_state: OnlineState) {
        self.apply_online_state_change_from(online_state, OnlineStateSource::SharedClientState);
    }

    async fn synchronize_view_and_compute_snapshot(&self, query: &Query) -> FirestoreResult<ViewChange> {
        let result = self.local_store.execute_query(query, true).await?;
        let documents = as_maybe_documents(&result.documents);
        let mut actions = Vec::new();
        let view_change = {
            let mut state = self.state();
            let is_primary = state.is_primary_client();
            let canonical_id = query.canonical_id();
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                return Ok(ViewChange::default());
            };
            let target_id = query_view.target_id;
            let view_change = query_view
                .view
                .synchronize_with_persisted_state(&documents, result.remote_keys);
            if is_primary {
                state.update_tracked_limbos(target_id, view_change.limbo_changes.clone(), &mut actions);
            }
            view_change
        };
        self.run_remote_actions(actions).await?;
        Ok(view_change)
    }

    /// Reconciles the views of `targets` with persistence. Returns the
    /// target data to listen to when this client becomes primary.
    async fn synchronize_query_views_and_raise_snapshots(
        &self,
        targets: Vec<TargetId>,
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut new_snapshots = Vec::new();
        for target_id in targets {
            let queries = self
                .state()
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                // The resume token and snapshot version may have moved on in
                // another client.
                let target_data = self.local_store.allocate_target(first.to_target()).await?;
                for query in &queries {
                    let view_change = self.synchronize_view_and_compute_snapshot(query).await?;
                    new_snapshots.extend(view_change.snapshot);
                }
                target_data
            } else {
                hard_assert(
                    transition_to_primary,
                    "A secondary tab should never have an active view without an active target.",
                );
                let Some(target) = self.local_store.get_target(target_id).await? else {
                    log::warn!("{LOG_TAG}: target for id {target_id} not found");
                    continue;
                };
                let target_data = self.local_store.allocate_target(target.clone()).await?;
                self.initialize_view_and_compute_snapshot(
                    Query::from_target(target),
                    target_id,
                    false,
                )
                .await?;
                target_data
            };
            active_queries.push(target_data);
        }
        self.raise_snapshots(new_snapshots);
        Ok(active_queries)
    }

    async fn reset_limbo_documents(&self) -> FirestoreResult<()> {
        let limbo_targets: Vec<TargetId> = {
            let mut state = self.state();
            state.limbo_document_refs.remove_all_references();
            state.active_limbo_targets_by_key.clear();
            std::mem::take(&mut state.active_limbo_resolutions_by_target)
                .into_keys()
                .collect()
        };
        for target_id in limbo_targets {
            self.remote_store.unlisten(target_id).await?;
        }
        Ok(())
    }

    /// Switches between primary and secondary. A new primary reconciles its
    /// views with persistence and takes over every active target; a new
    /// secondary releases targets only other clients listen to.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let current = self.state().is_primary;
        if is_primary && current != Some(true) {
            log::debug!("{LOG_TAG}: becoming primary");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(active_targets, true)
                .await?;
            self.state().is_primary = Some(true);
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await?;
            }
        } else if !is_primary && current != Some(false) {
            log::debug!("{LOG_TAG}: becoming secondary");
            let targets: Vec<TargetId> = self.state().queries_by_target.keys().copied().collect();
            let mut active_targets = Vec::new();
            for target_id in targets {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None).await?;
                    self.local_store.release_target(target_id, true).await?;
                }
                self.remote_store.unlisten(target_id).await?;
            }
            self.synchronize_query_views_and_raise_snapshots(active_targets, false)
                .await?;
            self.reset_limbo_documents().await?;
            self.state().is_primary = Some(false);
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ListenSource for SyncEngine {
    /// Registers `query`, sharing the target of an identical query, and
    /// raises its first snapshot.
    async fn listen(&self, query: Query) -> FirestoreResult<TargetId> {
        let existing = {
            let state = self.state();
            state
                .query_views
                .get(&query.canonical_id())
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        };
        if let Some((target_id, snapshot)) = existing {
            // The primary may already listen to this query for another client.
            self.shared_client_state.add_local_query_target(target_id);
            self.raise_snapshots(vec![snapshot]);
            return Ok(target_id);
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let target_id = target_data.target_id;
        let status = self.shared_client_state.add_local_query_target(target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(query, target_id, status == QueryTargetState::Current)
            .await?;
        if self.is_primary_client() {
            self.remote_store.listen(target_data).await?;
        }
        self.raise_snapshots(vec![snapshot]);
        Ok(target_id)
    }

    async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
                log::debug!("{LOG_TAG}: trying to unlisten on query not found: {query}");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other != query);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        if self.is_primary_client() {
            // Other clients may still listen to the target.
            self.shared_client_state.remove_local_query_target(target_id);
            if !self.shared_client_state.is_active_query_target(target_id) {
                self.local_store.release_target(target_id, false).await?;
                self.shared_client_state.clear_query_state(target_id);
                self.remote_store.unlisten(target_id).await?;
                self.remove_and_cleanup_target(target_id, None).await?;
            }
            Ok(())
        } else {
            self.remove_and_cleanup_target(target_id, None).await?;
            self.local_store.release_target(target_id, true).await
        }
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        ignore_if_primary_lease_loss(self.apply_remote_event_inner(event).await)
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(error.clone()));

        let limbo_key = self
            .state()
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());
        let Some(limbo_key) = limbo_key else {
            self.local_store.release_target(target_id, false).await?;
            return self.remove_and_cleanup_target(target_id, Some(error)).await;
        };

        // A rejected limbo listen resolves the document as deleted.
        let mut event = RemoteEvent::new(SnapshotVersion::min());
        event.document_updates = event.document_updates.insert(
            limbo_key.clone(),
            MaybeDocument::NoDocument(NoDocument::new(limbo_key.clone(), SnapshotVersion::min(), false)),
        );
        event.resolved_limbo_documents = document_key_set([limbo_key.clone()]);
        self.apply_remote_event(event).await?;

        // Removed only after the event applied, so a failure re-listens and
        // fails the target again.
        let mut actions = Vec::new();
        {
            let mut state = self.state();
            state.active_limbo_targets_by_key.remove(&limbo_key);
            state.active_limbo_resolutions_by_target.remove(&target_id);
            state.pump_enqueued_limbo_resolutions(&mut actions);
        }
        self.run_remote_actions(actions).await
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let outcome = async {
            let changes = self.local_store.acknowledge_batch(result).await?;
            // User callbacks fire before the listen events the write causes.
            self.process_user_callback(batch_id, None);
            self.trigger_pending_writes_callbacks(batch_id);
            self.shared_client_state
                .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
            self.emit_new_snaps_and_notify_local_store(&changes, None).await
        }
        .await;
        ignore_if_primary_lease_loss(outcome)
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let outcome = async {
            let changes = self.local_store.reject_batch(batch_id).await?;
            self.process_user_callback(batch_id, Some(error.clone()));
            self.trigger_pending_writes_callbacks(batch_id);
            self.shared_client_state.update_mutation_state(
                batch_id,
                MutationBatchState::Rejected,
                Some(error.clone()),
            );
            self.emit_new_snaps_and_notify_local_store(&changes, None).await
        }
        .await;
        ignore_if_primary_lease_loss(outcome)
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return document_key_set([resolution.key.clone()]);
            }
        }
        let Some(queries) = state.queries_by_target.get(&target_id) else {
            return DocumentKeySet::default();
        };
        queries
            .iter()
            .filter_map(|query| state.query_views.get(&query.canonical_id()))
            .fold(DocumentKeySet::default(), |keys, query_view| {
                keys.union_with(query_view.view.synced_documents())
            })
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.state().current_user == user {
            return Ok(());
        }
        log::debug!("{LOG_TAG}: user change. New user: {}", user.storage_key());
        let result = self.local_store.handle_user_change(user.clone()).await?;
        self.state().current_user = user.clone();

        self.reject_outstanding_pending_writes_callbacks(
            "'waitForPendingWrites' promise is rejected due to a user change.",
        );
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        self.apply_online_state_change_from(online_state, OnlineStateSource::RemoteStore);
    }
}

#[async_trait]
impl SharedClientStateSyncer for SyncEngine {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id).await? else {
            // The batch completed before this client saw it. Any effect
            // arrives through remote document updates.
            log::debug!("{LOG_TAG}: cannot apply mutation batch with id: {batch_id}");
            return Ok(());
        };
        match state {
            MutationBatchState::Pending => {
                // Only the primary sends; a secondary's pipeline stays closed.
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                self.process_user_callback(batch_id, error);
                self.trigger_pending_writes_callbacks(batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&documents, None)
            .await
    }

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary_client() {
            log::debug!("{LOG_TAG}: ignoring unexpected query state notification");
            return Ok(());
        }
        let first_query = self
            .state()
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first().cloned());
        let Some(query) = first_query else {
            return Ok(());
        };
        match state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self
                    .local_store
                    .get_new_document_changes(&query.changed_collection_group())
                    .await?;
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    state == QueryTargetState::Current,
                );
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
                    .await
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true).await?;
                self.remove_and_cleanup_target(target_id, error).await
            }
        }
    }

    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        if !self.is_primary_client() {
            return Ok(());
        }
        for target_id in added {
            let already_listening = self.state().queries_by_target.contains_key(&target_id)
                && self.shared_client_state.is_active_query_target(target_id);
            if already_listening {
                log::debug!("{LOG_TAG}: adding an already active target {target_id}");
                continue;
            }
            let Some(target) = self.local_store.get_target(target_id).await? else {
                log::warn!("{LOG_TAG}: query data for active target {target_id} not found");
                continue;
            };
            let target_data = self.local_store.allocate_target(target.clone()).await?;
            self.initialize_view_and_compute_snapshot(
                Query::from_target(target),
                target_data.target_id,
                false,
            )
            .await?;
            self.remote_store.listen(target_data).await?;
        }

        for target_id in removed {
            // Rejected targets are gone already.
            if !self.state().queries_by_target.contains_key(&target_id) {
                continue;
            }
            self.local_store.release_target(target_id, false).await?;
            self.remote_store.unlisten(target_id).await?;
            self.remove_and_cleanup_target(target_id, None).await?;
        }
        Ok(())
    }

    fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>> {
        self.local_store.get_active_clients()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::shared_client_state::MemorySharedClientState;
    use crate::firestore::local::test_helpers::{doc, key, started_persistence};
    use crate::firestore::model::{DatabaseId, FieldPath, ResourcePath};
    use crate::firestore::remote::connectivity_monitor::NoopConnectivityMonitor;
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::datastore::Datastore;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::ObjectValue;
    use crate::util::async_queue::AsyncQueue;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreError)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl RecordingListener {
        fn last_keys(&self) -> Vec<String> {
            self.snapshots
                .lock()
                .unwrap()
                .last()
                .map(|snapshot| snapshot.docs.keys().map(ToString::to_string).collect())
                .unwrap_or_default()
        }
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
        local_store: Arc<LocalStore>,
        _server: MultiplexedConnection,
    }

    /// A primary sync engine with the network disabled, so listens and
    /// writes never reach a stream.
    async fn harness(name: &str) -> Harness {
        let persistence = started_persistence(name).await;
        let local_store = LocalStore::new(persistence, User::unauthenticated());
        local_store.start().await.unwrap();

        let (client, server) = InMemoryTransport::pair();
        let datastore = Arc::new(Datastore::new(
            Arc::new(MultiplexedConnection::new(client)),
            Arc::new(EmptyCredentialsProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        ));
        let remote_store = RemoteStore::new(
            AsyncQueue::new(),
            Arc::clone(&local_store),
            datastore,
            Arc::new(NoopConnectivityMonitor),
        );
        let shared: Arc<dyn SharedClientState> = MemorySharedClientState::new();
        let engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            shared,
            User::unauthenticated(),
            1,
        );
        let listener = Arc::new(RecordingListener::default());
        let weak_listener: Weak<dyn SyncEngineListener> = Arc::<RecordingListener>::downgrade(&listener);
        engine.set_listener(weak_listener);
        let weak_engine: Weak<dyn RemoteSyncer> = Arc::<SyncEngine>::downgrade(&engine);
        remote_store.set_syncer(weak_engine);
        remote_store.disable_network().await.unwrap();
        engine.apply_primary_state(true).await.unwrap();

        Harness {
            engine,
            listener,
            local_store,
            _server: MultiplexedConnection::new_acceptor(server),
        }
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn set_mutation(path: &str, value: i64) -> Mutation {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single("n"), value.into());
        Mutation::set(key(path), data)
    }

    fn target_event(version: i64, target_id: TargetId, added: &[&str], removed: &[&str]) -> RemoteEvent {
        let mut event = RemoteEvent::new(SnapshotVersion::from_micros(version));
        let change = TargetChange {
            added_documents: document_key_set(added.iter().map(|path| key(path))),
            removed_documents: document_key_set(removed.iter().map(|path| key(path))),
            ..TargetChange::synthesized_for_current_change(true)
        };
        event.target_changes.insert(target_id, change);
        for path in added {
            event.document_updates = event
                .document_updates
                .insert(key(path), doc(path, version, 1).into());
        }
        event
    }

    #[tokio::test]
    async fn local_write_raises_pending_snapshot() {
        let harness = harness("sync-engine-write").await;
        harness.engine.listen(rooms()).await.unwrap();
        assert_eq!(harness.listener.snapshots.lock().unwrap().len(), 1);

        let (callback, mut acknowledged) = oneshot::channel();
        harness
            .engine
            .write(vec![set_mutation("rooms/a", 1)], callback)
            .await
            .unwrap();

        let snapshots = harness.listener.snapshots.lock().unwrap().clone();
        let latest = snapshots.last().unwrap();
        assert_eq!(harness.listener.last_keys(), vec!["rooms/a"]);
        assert!(latest.has_pending_writes());
        assert!(latest.from_cache);
        assert_eq!(acknowledged.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn rejected_write_reverts_view_and_fails_callback() {
        let harness = harness("sync-engine-reject-write").await;
        harness.engine.listen(rooms()).await.unwrap();
        let (callback, rejected) = oneshot::channel();
        harness
            .engine
            .write(vec![set_mutation("rooms/a", 1)], callback)
            .await
            .unwrap();

        let batch_id = harness
            .local_store
            .get_highest_unacknowledged_batch_id()
            .await
            .unwrap();
        harness
            .engine
            .reject_failed_write(batch_id, permission_denied("no access"))
            .await
            .unwrap();

        let err = rejected.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
        assert!(harness.listener.last_keys().is_empty());
    }

    #[tokio::test]
    async fn pending_writes_callback_resolves_without_writes() {
        let harness = harness("sync-engine-no-pending").await;
        let (callback, done) = oneshot::channel();
        harness.engine.register_pending_writes_callback(callback).await;
        assert!(done.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn user_change_cancels_pending_writes_callbacks() {
        let harness = harness("sync-engine-user-change").await;
        harness.engine.listen(rooms()).await.unwrap();
        let (callback, _acknowledged) = oneshot::channel();
        harness
            .engine
            .write(vec![set_mutation("rooms/a", 1)], callback)
            .await
            .unwrap();
        let (waiter, waited) = oneshot::channel();
        harness.engine.register_pending_writes_callback(waiter).await;

        harness
            .engine
            .handle_credential_change(User::new("bob"))
            .await
            .unwrap();

        let err = waited.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        assert_eq!(harness.engine.current_user(), User::new("bob"));
        // The other user's write is no longer visible.
        assert!(harness.listener.last_keys().is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_to_listener() {
        let harness = harness("sync-engine-reject-listen").await;
        let target_id = harness.engine.listen(rooms()).await.unwrap();
        harness
            .engine
            .reject_listen(target_id, permission_denied("denied"))
            .await
            .unwrap();

        let errors = harness.listener.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, rooms().canonical_id());
        assert!(harness.engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn removed_document_goes_to_limbo_until_resolved() {
        let harness = harness("sync-engine-limbo").await;
        let target_id = harness.engine.listen(rooms()).await.unwrap();
        harness
            .engine
            .apply_remote_event(target_event(1_000_000, target_id, &["rooms/a", "rooms/b"], &[]))
            .await
            .unwrap();
        assert_eq!(harness.listener.last_keys(), vec!["rooms/a", "rooms/b"]);

        // The target drops both documents without reporting their deletion.
        harness
            .engine
            .apply_remote_event(target_event(2_000_000, target_id, &[], &["rooms/a", "rooms/b"]))
            .await
            .unwrap();
        let active = harness.engine.active_limbo_document_resolutions();
        assert_eq!(active.len(), 1);
        assert!(active.contains_key(&key("rooms/a")));
        assert_eq!(
            harness.engine.enqueued_limbo_document_resolutions(),
            vec![key("rooms/b")]
        );
        let limbo_target = active[&key("rooms/a")];
        assert_eq!(limbo_target % 2, 1);
        assert!(harness.engine.get_remote_keys_for_target(limbo_target).is_empty());

        // A rejected limbo listen resolves the document as deleted and frees
        // the slot for the next one.
        harness
            .engine
            .reject_listen(limbo_target, permission_denied("denied"))
            .await
            .unwrap();
        assert_eq!(harness.listener.last_keys(), vec!["rooms/b"]);
        let active = harness.engine.active_limbo_document_resolutions();
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        assert!(harness.engine.enqueued_limbo_document_resolutions().is_empty());
        assert!(harness.listener.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn primary_follows_its_own_online_state() {
        let harness = harness("sync-engine-online").await;
        harness.engine.listen(rooms()).await.unwrap();

        harness.engine.apply_shared_online_state(OnlineState::Online);
        assert!(harness.listener.online_states.lock().unwrap().is_empty());

        RemoteSyncer::apply_online_state_change(&*harness.engine, OnlineState::Offline);
        assert_eq!(
            *harness.listener.online_states.lock().unwrap(),
            vec![OnlineState::Offline]
        );
    }
}
