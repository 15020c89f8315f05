//! The local half of the client: pending writes, cached documents and the
//! targets the client listens to, all behind persistence transactions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{ignore_if_primary_lease_loss, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentChangeBuffer;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::value::BytesValue;
use crate::util::hard_assert;

const LOG_TAG: &str = "LocalStore";

/// A target's resume token is persisted at least this often (in
/// microseconds) even when no documents changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of a local write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MaybeDocumentMap,
}

/// Result of a user change.
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    /// Local views of every document a batch of either user touches.
    pub affected_documents: MaybeDocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Keys a view added or removed in one snapshot.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::default();
        let mut removed_keys = DocumentKeySet::default();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => added_keys = added_keys.add(change.doc.key().clone()),
                ChangeType::Removed => removed_keys = removed_keys.add(change.doc.key().clone()),
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

struct LocalStoreState {
    user: User,
    mutation_queue: MutationQueue,
    local_documents: LocalDocumentsView,
    /// Targets this client currently listens to.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
    /// Documents held by a view. They are exempt from garbage collection.
    local_view_references: ReferenceSet,
    /// Read time up to which document changes were replayed, per
    /// collection group.
    collection_group_read_time: HashMap<String, SnapshotVersion>,
    last_document_change_read_time: SnapshotVersion,
}

pub struct LocalStore {
    persistence: Arc<Persistence>,
    query_engine: QueryEngine,
    state: Mutex<LocalStoreState>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, initial_user: User) -> Arc<Self> {
        let mutation_queue = persistence.mutation_queue(&initial_user);
        let local_documents = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            mutation_queue.clone(),
            persistence.index_manager(),
        );
        Arc::new(Self {
            persistence,
            query_engine: QueryEngine,
            state: Mutex::new(LocalStoreState {
                user: initial_user,
                mutation_queue,
                local_documents,
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: HashMap::new(),
                local_view_references: ReferenceSet::new(),
                collection_group_read_time: HashMap::new(),
                last_document_change_read_time: SnapshotVersion::min(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LocalStoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn current_user(&self) -> User {
        self.state().user.clone()
    }

    /// Loads the read time document change replay starts from.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.synchronize_last_document_change_read_time().await
    }

    pub async fn synchronize_last_document_change_read_time(&self) -> FirestoreResult<()> {
        let cache = self.persistence.remote_document_cache();
        let read_time = self
            .persistence
            .run_transaction(
                "Synchronize last document change read time",
                TransactionMode::ReadOnly,
                |txn| cache.get_last_read_time(txn),
            )
            .await?;
        let mut state = self.state();
        state.last_document_change_read_time = read_time;
        state.collection_group_read_time.clear();
        Ok(())
    }

    /// Switches to `user`'s mutation queue and returns the documents whose
    /// local view may differ between the two users.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_queue = self.state().mutation_queue.clone();
        let new_queue = self.persistence.mutation_queue(&user);
        let new_view = LocalDocumentsView::new(
            self.persistence.remote_document_cache(),
            new_queue.clone(),
            self.persistence.index_manager(),
        );
        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old_queue.get_all_mutation_batches(txn)?;
                let new_batches = new_queue.get_all_mutation_batches(txn)?;
                let mut changed_keys = DocumentKeySet::default();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    for mutation in &batch.mutations {
                        changed_keys = changed_keys.add(mutation.key().clone());
                    }
                }
                Ok(UserChangeResult {
                    affected_documents: new_view.get_documents(txn, &changed_keys)?,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;
        log::debug!("{LOG_TAG}: switched mutation queue to user {:?}", user.uid());
        let mut state = self.state();
        state.user = user;
        state.mutation_queue = new_queue;
        state.local_documents = new_view;
        Ok(result)
    }

    /// Queues a batch for `mutations`. Transforms that are not idempotent
    /// get a base mutation pinning the value they transform, so replaying
    /// the batch on a newer document keeps the same result.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();
        let view = self.state().local_documents.clone();
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let existing_docs = view.get_documents(txn, &keys)?;
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    if let Some(base_value) =
                        mutation.extract_base_value(existing_docs.get(mutation.key()))
                    {
                        let field_mask = base_value.field_mask();
                        base_mutations.push(Mutation::patch(
                            mutation.key().clone(),
                            base_value,
                            field_mask,
                            Precondition::Exists(true),
                        ));
                    }
                }
                let batch = view.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: batch.apply_to_local_document_set(existing_docs),
                })
            })
            .await
    }

    /// Applies an acknowledged batch to the cache and drops it from the
    /// queue. Returns the new local views of the documents it touched.
    pub async fn acknowledge_batch(
        &self,
        batch_result: MutationBatchResult,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let (queue, view) = {
            let state = self.state();
            (state.mutation_queue.clone(), state.local_documents.clone())
        };
        let cache = self.persistence.remote_document_cache();
        let delegate = self.persistence.reference_delegate();
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let affected = batch_result.batch.keys();
                let mut buffer = cache.new_change_buffer();
                queue.acknowledge_batch(txn, &batch_result.batch, &batch_result.stream_token)?;
                apply_write_to_remote_documents(txn, &batch_result, &mut buffer)?;
                buffer.apply_changes(txn)?;
                queue.remove_mutation_batch(txn, &delegate, &batch_result.batch)?;
                queue.perform_consistency_check(txn)?;
                view.get_documents(txn, &affected)
            })
            .await
    }

    /// Drops a batch the backend rejected. Returns the local views of the
    /// documents it touched, which no longer include the batch.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<MaybeDocumentMap> {
        let (queue, view) = {
            let state = self.state();
            (state.mutation_queue.clone(), state.local_documents.clone())
        };
        let delegate = self.persistence.reference_delegate();
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = queue.lookup_mutation_batch(txn, batch_id)?;
                hard_assert(batch.is_some(), "Attempt to reject nonexistent batch!");
                let Some(batch) = batch else {
                    return Ok(MaybeDocumentMap::default());
                };
                let affected = batch.keys();
                queue.remove_mutation_batch(txn, &delegate, &batch)?;
                queue.perform_consistency_check(txn)?;
                view.get_documents(txn, &affected)
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.state().mutation_queue.clone();
        self.persistence
            .run_transaction(
                "Get highest unacknowledged batch id",
                TransactionMode::ReadOnly,
                |txn| queue.get_highest_unacknowledged_batch_id(txn),
            )
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<BytesValue> {
        let queue = self.state().mutation_queue.clone();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.get_last_stream_token(txn)
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: BytesValue) -> FirestoreResult<()> {
        let queue = self.state().mutation_queue.clone();
        self.persistence
            .run_transaction(
                "Set last stream token",
                TransactionMode::ReadWritePrimary,
                |txn| queue.set_last_stream_token(txn, &stream_token),
            )
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let targets = self.persistence.target_cache();
        self.persistence
            .run_transaction(
                "Get last remote snapshot version",
                TransactionMode::ReadOnly,
                |txn| targets.get_last_remote_snapshot_version(txn),
            )
            .await
    }

    /// Writes a consistent watch snapshot to the cache: target membership,
    /// resume tokens and documents. Returns the local views of every
    /// document the event changed.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<MaybeDocumentMap> {
        let (target_data_by_target, view) = {
            let state = self.state();
            (state.target_data_by_target.clone(), state.local_documents.clone())
        };
        let targets = self.persistence.target_cache();
        let cache = self.persistence.remote_document_cache();
        let delegate = self.persistence.reference_delegate();
        let remote_version = event.snapshot_version;

        let (changes, new_target_data) = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                let mut new_target_data = target_data_by_target.clone();
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = new_target_data.get(target_id).cloned() else {
                        continue;
                    };
                    targets.remove_matching_keys(txn, &change.removed_documents, *target_id, &delegate)?;
                    targets.add_matching_keys(txn, &change.added_documents, *target_id, &delegate)?;

                    if !change.resume_token.is_empty() {
                        let updated = old_target_data
                            .with_resume_token(change.resume_token.clone(), remote_version)
                            .with_sequence_number(txn.current_sequence_number());
                        if should_persist_target_data(&old_target_data, &updated, change) {
                            targets.update_target_data(txn, &updated)?;
                        }
                        new_target_data.insert(*target_id, updated);
                    }
                }

                let mut buffer = cache.new_change_buffer();
                let mut changed_keys = DocumentKeySet::default();
                let mut changed_docs = MaybeDocumentMap::default();
                let update_keys: DocumentKeySet = event.document_updates.keys().cloned().collect();
                let existing_docs = buffer.get_entries(txn, &update_keys)?;
                for (key, doc) in event.document_updates.iter() {
                    let existing = existing_docs.get(key);
                    if doc.is_no_document() && doc.version().is_min() {
                        // A missing document reported by a document lookup.
                        // It is removed rather than cached.
                        buffer.remove_entry(key.clone());
                        changed_docs = changed_docs.insert(key.clone(), doc.clone());
                        changed_keys = changed_keys.add(key.clone());
                    } else if existing.map_or(true, |existing| {
                        doc.version() > existing.version()
                            || (doc.version() == existing.version() && existing.has_pending_writes())
                    }) {
                        hard_assert(
                            !remote_version.is_min(),
                            "Cannot add a document when the remote version is zero",
                        );
                        buffer.add_entry(doc.clone(), remote_version);
                        changed_docs = changed_docs.insert(key.clone(), doc.clone());
                        changed_keys = changed_keys.add(key.clone());
                    } else {
                        log::debug!(
                            "{LOG_TAG}: ignoring outdated watch update for {key}. Current version: {:?} Watch version: {:?}",
                            existing.map(MaybeDocument::version),
                            doc.version()
                        );
                    }
                    if event.resolved_limbo_documents.has(key) {
                        delegate.update_limbo_document(txn, key)?;
                    }
                }

                if !remote_version.is_min() {
                    let last_remote_version = targets.get_last_remote_snapshot_version(txn)?;
                    hard_assert(
                        remote_version >= last_remote_version,
                        format!(
                            "Watch stream reverted to previous snapshot?? {remote_version:?} < {last_remote_version:?}"
                        ),
                    );
                    targets.set_target_metadata(
                        txn,
                        txn.current_sequence_number(),
                        Some(remote_version),
                    )?;
                }

                buffer.apply_changes(txn)?;
                let changes = view.get_local_view_of_documents(txn, &changed_keys, &changed_docs)?;
                Ok((changes, new_target_data))
            })
            .await?;

        let mut state = self.state();
        for (target_id, target_data) in new_target_data {
            // Targets released while the transaction ran stay released.
            if state.target_data_by_target.contains_key(&target_id) {
                state.target_data_by_target.insert(target_id, target_data);
            }
        }
        Ok(changes)
    }

    /// Records which documents the views hold, and marks targets whose view
    /// is in sync as limbo-free at their snapshot version.
    pub async fn notify_local_view_changes(
        &self,
        view_changes: Vec<LocalViewChanges>,
    ) -> FirestoreResult<()> {
        let delegate = self.persistence.reference_delegate();
        self.persistence
            .run_transaction("notifyLocalViewChanges", TransactionMode::ReadWrite, |txn| {
                for change in &view_changes {
                    for key in change.removed_keys.iter() {
                        delegate.remove_reference(txn, key)?;
                    }
                }
                Ok(())
            })
            .await?;

        let mut state = self.state();
        for change in &view_changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            if !change.from_cache {
                if let Some(target_data) = state.target_data_by_target.get(&change.target_id) {
                    let limbo_free = target_data.snapshot_version;
                    let updated = target_data.with_last_limbo_free_snapshot_version(limbo_free);
                    state.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// First queued batch after `after_batch_id`, if any.
    pub async fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.state().mutation_queue.clone();
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after_batch_id)
            })
            .await
    }

    pub async fn read_document(
        &self,
        key: &crate::firestore::model::DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let view = self.state().local_documents.clone();
        self.persistence
            .run_transaction("read document", TransactionMode::ReadOnly, |txn| {
                view.get_document(txn, key)
            })
            .await
    }

    /// Assigns a target id to `target`, reusing the persisted one when the
    /// target was listened to before.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let targets = self.persistence.target_cache();
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = targets.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = targets.allocate_target_id(txn)?;
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                targets.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })
            .await?;

        let mut state = self.state();
        if !state.target_data_by_target.contains_key(&target_data.target_id) {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// The target data of `target`, from the active targets or persistence.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(active) = self.active_target_data(target) {
            return Ok(Some(active));
        }
        let targets = self.persistence.target_cache();
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                targets.get_target_data(txn, target)
            })
            .await
    }

    /// Persisted target for `target_id`, used by clients that learn about
    /// targets through shared state.
    pub async fn get_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        if let Some(active) = self.state().target_data_by_target.get(&target_id) {
            return Ok(Some(active.target.clone()));
        }
        let targets = self.persistence.target_cache();
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                Ok(targets
                    .get_target_data_by_id(txn, target_id)?
                    .map(|target_data| target_data.target))
            })
            .await
    }

    /// Stops tracking `target_id`. Unless `keep_persisted_target_data` is
    /// set, the persisted target is stamped with the current sequence number
    /// and left for garbage collection.
    pub async fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let (target_data, referenced_keys) = {
            let state = self.state();
            (
                state.target_data_by_target.get(&target_id).cloned(),
                state.local_view_references.referenced_keys(target_id),
            )
        };
        hard_assert(
            target_data.is_some(),
            format!("Tried to release nonexistent target: {target_id}"),
        );
        let Some(target_data) = target_data else {
            return Ok(());
        };
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        let delegate = self.persistence.reference_delegate();
        let result = self
            .persistence
            .run_transaction("Release target", mode, |txn| {
                for key in &referenced_keys {
                    delegate.remove_reference(txn, key)?;
                }
                if !keep_persisted_target_data {
                    delegate.remove_target(txn, &target_data)?;
                }
                Ok(())
            })
            .await;

        // The target is released in memory even when the lease was lost;
        // the new primary owns the persisted state.
        let mut state = self.state();
        state.local_view_references.remove_references_for_id(target_id);
        state.target_data_by_target.remove(&target_id);
        let canonical_id = target_data.target.canonical_id();
        if state.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            state.target_id_by_canonical_id.remove(&canonical_id);
        }
        drop(state);
        ignore_if_primary_lease_loss(result)
    }

    /// Runs `query` against the cache. With `use_previous_results` the
    /// target's last limbo-free result narrows the documents read.
    pub async fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let active = self.active_target_data(&target);
        let view = self.state().local_documents.clone();
        let targets = self.persistence.target_cache();
        let query_engine = self.query_engine;
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let target_data = match &active {
                    Some(target_data) => Some(target_data.clone()),
                    None => targets.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        targets.get_matching_keys_for_target_id(txn, target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::default()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(
                        txn,
                        &view,
                        query,
                        last_limbo_free,
                        &remote_keys,
                    )?
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        &view,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::default(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys: if use_previous_results {
                        remote_keys
                    } else {
                        DocumentKeySet::default()
                    },
                })
            })
            .await
    }

    /// Keys the backend reported as matching `target_id`.
    pub async fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        let targets = self.persistence.target_cache();
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                targets.get_matching_keys_for_target_id(txn, target_id)
            })
            .await
    }

    pub fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        self.persistence.get_active_clients()
    }

    /// Local views of the documents a batch touches, or `None` when the
    /// batch is gone (another client acknowledged or rejected it).
    pub async fn lookup_mutation_documents(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MaybeDocumentMap>> {
        let view = self.state().local_documents.clone();
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                match view.mutation_queue().lookup_mutation_batch(txn, batch_id)? {
                    Some(batch) => view.get_documents(txn, &batch.keys()).map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Documents of `collection_group` another client wrote to the cache
    /// since the last call.
    pub async fn get_new_document_changes(
        &self,
        collection_group: &str,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let since = {
            let state = self.state();
            state
                .collection_group_read_time
                .get(collection_group)
                .copied()
                .unwrap_or(state.last_document_change_read_time)
        };
        let cache = self.persistence.remote_document_cache();
        let query_engine = self.query_engine;
        let changes = self
            .persistence
            .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                query_engine.get_new_document_changes(txn, &cache, collection_group, since)
            })
            .await?;
        self.state()
            .collection_group_read_time
            .insert(collection_group.to_string(), changes.read_time);
        Ok(changes.changed_docs)
    }

    /// One garbage collection pass. Active targets and documents held by
    /// views are kept.
    pub async fn collect_garbage(
        &self,
        garbage_collector: &LruGarbageCollector,
    ) -> FirestoreResult<LruResults> {
        let (active_target_ids, pins) = {
            let state = self.state();
            (
                state
                    .target_data_by_target
                    .keys()
                    .copied()
                    .collect::<BTreeSet<_>>(),
                state.local_view_references.clone(),
            )
        };
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                garbage_collector.collect(txn, &active_target_ids, &pins)
            })
            .await
    }

    fn active_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state();
        let target_id = state.target_id_by_canonical_id.get(&target.canonical_id())?;
        state
            .target_data_by_target
            .get(target_id)
            .filter(|target_data| &target_data.target == target)
            .cloned()
    }
}

fn apply_write_to_remote_documents(
    txn: &mut PersistenceTransaction<'_, '_>,
    batch_result: &MutationBatchResult,
    buffer: &mut RemoteDocumentChangeBuffer,
) -> FirestoreResult<()> {
    let batch = &batch_result.batch;
    for key in batch.keys().iter() {
        let doc = buffer.get_entry(txn, key)?;
        let ack_version = batch_result.doc_versions.get(key).copied();
        hard_assert(
            ack_version.is_some(),
            "docVersions should contain every doc in the write.",
        );
        let ack_version = ack_version.unwrap_or_default();
        if doc.as_ref().map_or(true, |doc| doc.version() < ack_version) {
            match batch.apply_to_remote_document(key, doc, batch_result) {
                Some(updated) => buffer.add_entry(updated, batch_result.commit_version),
                None => log::debug!(
                    "{LOG_TAG}: mutation batch {} applied to document {key} resulted in no document",
                    batch.batch_id
                ),
            }
        }
    }
    Ok(())
}

/// Whether the new resume token is worth a write. Tokens are persisted when
/// none was stored yet, when the stored one is old, or when documents
/// changed along with it.
fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    let changes = change.added_documents.len()
        + change.modified_documents.len()
        + change.removed_documents.len();
    changes > 0
}
