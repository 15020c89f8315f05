use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::{
    ignore_if_primary_lease_loss, internal_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::connectivity_monitor::{ConnectivityMonitor, NetworkStatus};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::datastore::Datastore;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::persistent_stream::{
    WatchStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::value::BytesValue;
use crate::util::assert::hard_assert;
use crate::util::async_queue::AsyncQueue;

const LOG_TAG: &str = "RemoteStore";

/// Maximum number of mutation batches sent but not yet acknowledged.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams closed. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// Another client holds the primary lease.
    IsSecondary,
    CredentialChange,
    ConnectivityChange,
    /// A local persistence transaction failed; a retry is scheduled.
    PersistenceFailed,
    Shutdown,
}

type ListenTargets = Arc<std::sync::Mutex<BTreeMap<TargetId, TargetData>>>;

fn lock_targets(
    targets: &ListenTargets,
) -> std::sync::MutexGuard<'_, BTreeMap<TargetId, TargetData>> {
    targets.lock().unwrap_or_else(|poison| poison.into_inner())
}

struct SyncerMetadataProvider {
    inner: Weak<RemoteStoreInner>,
    listen_targets: ListenTargets,
}

impl TargetMetadataProvider for SyncerMetadataProvider {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.inner
            .upgrade()
            .and_then(|inner| inner.syncer().ok())
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        lock_targets(&self.listen_targets).get(&target_id).cloned()
    }
}

struct RemoteStoreState {
    offline_causes: BTreeSet<OfflineCause>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) on the write stream, oldest first.
    /// The backend acknowledges them in order.
    write_pipeline: VecDeque<MutationBatch>,
}

/// Owns the watch and write streams and keeps them in sync with what the
/// sync engine listens to and what the local store has queued.
///
/// Every method must run on the client's [`AsyncQueue`].
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        datastore: Arc<Datastore>,
        connectivity_monitor: Arc<dyn ConnectivityMonitor>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let listener = Arc::new(RemoteStreamListener {
                inner: weak.clone(),
            });
            let watch_listener: Arc<dyn WatchStreamListener> = listener.clone();
            let write_listener: Arc<dyn WriteStreamListener> = listener;
            let handler_ref = weak.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue.clone(),
                Arc::new(move |state| {
                    if let Some(syncer) = handler_ref
                        .upgrade()
                        .and_then(|inner| inner.syncer().ok())
                    {
                        syncer.apply_online_state_change(state);
                    }
                }),
            );

            RemoteStoreInner {
                watch_stream: WatchStream::with_listener(
                    queue.clone(),
                    Arc::clone(&datastore),
                    watch_listener,
                ),
                write_stream: WriteStream::with_listener(
                    queue.clone(),
                    Arc::clone(&datastore),
                    write_listener,
                ),
                queue: queue.clone(),
                local_store,
                datastore,
                connectivity_monitor,
                syncer: std::sync::Mutex::new(None),
                listen_targets: Arc::new(std::sync::Mutex::new(BTreeMap::new())),
                state: Mutex::new(RemoteStoreState {
                    offline_causes: BTreeSet::from([OfflineCause::IsSecondary]),
                    watch_change_aggregator: None,
                    write_pipeline: VecDeque::new(),
                }),
                online_state_tracker,
            }
        });

        let weak = Arc::downgrade(&inner);
        let queue = inner.queue.clone();
        inner
            .connectivity_monitor
            .add_callback(Arc::new(move |status: NetworkStatus| {
                let weak = weak.clone();
                queue.enqueue_and_forget(move || async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_connectivity_change(status).await;
                    }
                });
            }));

        Self { inner }
    }

    /// Installs the callbacks for backend results. Only a weak reference is
    /// kept.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self
            .inner
            .syncer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(syncer);
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.inner.datastore
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    /// Re-enables the network after [`RemoteStore::disable_network`].
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Closes both streams and reports `Offline` until re-enabled. Pending
    /// writes stay queued locally.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) {
        log::debug!("{LOG_TAG}: shutting down");
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.connectivity_monitor.shutdown();
        self.inner.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Starts watching `target_data`. A target that is already watched is
    /// left alone.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = lock_targets(&self.inner.listen_targets);
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }

        if self.inner.should_start_watch_stream().await {
            self.inner.start_watch_stream().await;
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(&target_data).await;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let (removed, now_empty) = {
            let mut targets = lock_targets(&self.inner.listen_targets);
            let removed = targets.remove(&target_id).is_some();
            (removed, targets.is_empty())
        };
        if !removed {
            log::debug!("{LOG_TAG}: unlisten for unknown target {target_id}");
            return Ok(());
        }

        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(target_id).await;
        }

        if now_empty {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if self.inner.can_use_network().await {
                // Nothing is listened to, so connectivity is unknown again.
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Pulls queued batches from the local store into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.queue.verify_operation_in_progress();
        log::debug!("{LOG_TAG}: received new credentials");
        let uses_network = self.inner.can_use_network().await;
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.inner.disable_network_internal().await;
        if uses_network {
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
        self.inner.syncer()?.handle_credential_change(user).await?;
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal().await
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner
                .state
                .lock()
                .await
                .offline_causes
                .remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await
        } else {
            self.inner
                .state
                .lock()
                .await
                .offline_causes
                .insert(OfflineCause::IsSecondary);
            self.inner.disable_network_internal().await;
            self.inner.online_state_tracker.set(OnlineState::Unknown);
            Ok(())
        }
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.can_use_network().await
    }

    /// Number of batches sent and not yet acknowledged.
    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

struct RemoteStoreInner {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    datastore: Arc<Datastore>,
    connectivity_monitor: Arc<dyn ConnectivityMonitor>,
    syncer: std::sync::Mutex<Option<Weak<dyn RemoteSyncer>>>,
    /// Targets the sync engine listens to, with the resume token last
    /// received for each.
    listen_targets: ListenTargets,
    state: Mutex<RemoteStoreState>,
    watch_stream: Arc<WatchStream>,
    write_stream: Arc<WriteStream>,
    online_state_tracker: OnlineStateTracker,
}

impl RemoteStoreInner {
    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("RemoteStore has no syncer"))
    }

    async fn can_use_network(&self) -> bool {
        self.state.lock().await.offline_causes.is_empty()
    }

    async fn should_start_watch_stream(&self) -> bool {
        self.can_use_network().await
            && !self.watch_stream.is_started()
            && !lock_targets(&self.listen_targets).is_empty()
    }

    async fn should_start_write_stream(&self) -> bool {
        self.can_use_network().await
            && !self.write_stream.is_started()
            && !self.state.lock().await.write_pipeline.is_empty()
    }

    async fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    async fn enable_network_internal(self: &Arc<Self>) -> FirestoreResult<()> {
        if !self.can_use_network().await {
            return Ok(());
        }
        let stream_token = self.local_store.get_last_stream_token().await?;
        self.write_stream.set_last_stream_token(stream_token);
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;

        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "{LOG_TAG}: stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_change_aggregator = None;
    }

    async fn handle_connectivity_change(self: &Arc<Self>, status: NetworkStatus) {
        if !self.can_use_network().await {
            return;
        }
        log::debug!("{LOG_TAG}: restarting streams for network reachability change ({status:?})");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Unknown);
        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::ConnectivityChange);
        if let Err(err) = self.enable_network_internal().await {
            log::warn!("{LOG_TAG}: failed to restart the network: {err}");
        }
    }

    /// Recovers from failed persistence transactions by going offline until
    /// the local store is readable again. Other errors are returned.
    fn disable_network_until_recovery(
        self: &Arc<Self>,
        error: FirestoreError,
    ) -> futures::future::BoxFuture<'_, FirestoreResult<()>> {
        Box::pin(async move {
            if !error.is_persistence_transaction_error() {
                return Err(error);
            }
            log::debug!("{LOG_TAG}: persistence failed, going offline until recovery: {error}");
            self.state
                .lock()
                .await
                .offline_causes
                .insert(OfflineCause::PersistenceFailed);
            self.disable_network_internal().await;
            self.online_state_tracker.set(OnlineState::Offline);

            let weak = Arc::downgrade(self);
            self.queue.enqueue_retryable(move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    // Probe the local store; a failure keeps the retry going.
                    inner.local_store.get_last_remote_snapshot_version().await?;
                    inner
                        .state
                        .lock()
                        .await
                        .offline_causes
                        .remove(&OfflineCause::PersistenceFailed);
                    inner.enable_network_internal().await
                }
            });
            Ok(())
        })
    }

    // Watch stream

    async fn start_watch_stream(self: &Arc<Self>) {
        hard_assert(
            self.should_start_watch_stream().await,
            "start_watch_stream() called when should_start_watch_stream() is false",
        );
        let provider = Arc::new(SyncerMetadataProvider {
            inner: Arc::downgrade(self),
            listen_targets: Arc::clone(&self.listen_targets),
        });
        self.state.lock().await.watch_change_aggregator =
            Some(WatchChangeAggregator::new(provider));
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, target_data: &TargetData) {
        if let Some(aggregator) = self.state.lock().await.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(target_data).await;
    }

    async fn send_unwatch_request(&self, target_id: TargetId) {
        if let Some(aggregator) = self.state.lock().await.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await;
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = lock_targets(&self.listen_targets).values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(target_data).await;
        }
        Ok(())
    }

    async fn on_watch_stream_close(
        self: &Arc<Self>,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if error.is_none() {
            // Only the client closes the stream without an error, and it
            // does so only when the stream should stay closed.
            hard_assert(
                !self.should_start_watch_stream().await,
                "Watch stream was stopped gracefully while still needed",
            );
        }
        self.state.lock().await.watch_change_aggregator = None;

        if self.should_start_watch_stream().await {
            self.online_state_tracker
                .handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream().await;
        } else {
            // No targets or the network is off: connectivity is unknown.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    async fn on_watch_change(
        self: &Arc<Self>,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        // Any message from the backend proves connectivity.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = target_change.cause.clone() {
                    log::debug!(
                        "{LOG_TAG}: targets {:?} rejected: {cause}",
                        target_change.target_ids
                    );
                    if let Err(err) = self
                        .handle_target_error(&target_change.target_ids, cause)
                        .await
                    {
                        self.disable_network_until_recovery(err).await?;
                    }
                    return Ok(());
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            match change {
                WatchChange::Document(document_change) => {
                    aggregator.handle_document_change(document_change)
                }
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(filter),
                WatchChange::Target(target_change) => {
                    aggregator.handle_target_change(&target_change)
                }
            }
        }

        if !snapshot_version.is_min() {
            let result = async {
                let last_remote = self.local_store.get_last_remote_snapshot_version().await?;
                if snapshot_version >= last_remote {
                    // Older snapshots can arrive right after a stream restart;
                    // they were already applied.
                    self.raise_watch_snapshot(snapshot_version).await?;
                }
                Ok(())
            }
            .await;
            if let Err(err) = result {
                log::debug!("{LOG_TAG}: failed to raise snapshot: {err}");
                self.disable_network_until_recovery(err).await?;
            }
        }
        Ok(())
    }

    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(
            !snapshot_version.is_min(),
            "Can't raise event for unknown SnapshotVersion",
        );
        let event = {
            let mut state = self.state.lock().await;
            match state.watch_change_aggregator.as_mut() {
                Some(aggregator) => aggregator.create_remote_event(snapshot_version),
                None => return Ok(()),
            }
        };

        let mut resends = Vec::new();
        {
            let mut targets = lock_targets(&self.listen_targets);
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get_mut(target_id) {
                    *target_data = target_data
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            // Mismatched targets are re-listened from scratch so the backend
            // resends every document.
            for target_id in &event.target_mismatches {
                let Some(target_data) = targets.get_mut(target_id) else {
                    continue;
                };
                *target_data =
                    target_data.with_resume_token(BytesValue::empty(), target_data.snapshot_version);
                resends.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    TargetPurpose::ExistenceFilterMismatch,
                    target_data.sequence_number,
                ));
            }
        }
        for request in resends {
            self.send_unwatch_request(request.target_id).await;
            self.send_watch_request(&request).await;
        }

        self.syncer()?.apply_remote_event(event).await
    }

    async fn handle_target_error(
        &self,
        target_ids: &[TargetId],
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let syncer = self.syncer()?;
        for target_id in target_ids {
            let removed = lock_targets(&self.listen_targets).remove(target_id).is_some();
            if !removed {
                continue;
            }
            if let Some(aggregator) = self.state.lock().await.watch_change_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
            syncer.reject_listen(*target_id, error.clone()).await?;
        }
        Ok(())
    }

    // Write stream

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .state
            .lock()
            .await
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);

        while self.can_add_to_write_pipeline().await {
            match self.local_store.next_mutation_batch(last_batch_id).await {
                Ok(Some(batch)) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch).await;
                }
                Ok(None) => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => {
                    self.disable_network_until_recovery(err).await?;
                    break;
                }
            }
        }

        if self.should_start_write_stream().await {
            self.start_write_stream();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        let mutations = batch.mutations.clone();
        self.state.lock().await.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await;
        }
    }

    fn start_write_stream(&self) {
        self.write_stream.start();
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake().await;
        Ok(())
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        ignore_if_primary_lease_loss(
            self.local_store
                .set_last_stream_token(self.write_stream.last_stream_token())
                .await,
        )?;
        let batches: Vec<_> = self
            .state
            .lock()
            .await
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in batches {
            self.write_stream.write_mutations(&mutations).await;
        }
        Ok(())
    }

    async fn on_mutation_result(
        self: &Arc<Self>,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Err(internal_error("Got a write result without a pending batch"));
        };

        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        );
        if let Err(err) = self.syncer()?.apply_successful_write(result).await {
            self.disable_network_until_recovery(err).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(
        self: &Arc<Self>,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if error.is_none() {
            hard_assert(
                !self.should_start_write_stream().await,
                "Write stream was stopped gracefully while still needed",
            );
        }

        if let Some(error) = error {
            let has_pending = !self.state.lock().await.write_pipeline.is_empty();
            if has_pending {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(error).await?;
                } else {
                    self.handle_handshake_error(&error).await?;
                }
            }
        }

        if self.should_start_write_stream().await {
            self.start_write_stream();
        }
        Ok(())
    }

    async fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        // A permanent handshake failure usually means the stream token is
        // stale; the next handshake starts without one.
        if is_permanent_error(error.code) {
            log::debug!(
                "{LOG_TAG}: write stream handshake failed permanently, resetting stream token: {error}"
            );
            self.write_stream.set_last_stream_token(BytesValue::empty());
            return ignore_if_primary_lease_loss(
                self.local_store.set_last_stream_token(BytesValue::empty()).await,
            );
        }
        Ok(())
    }

    async fn handle_write_error(self: &Arc<Self>, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        // Only the head batch failed. Reject it and retry the rest right away.
        let batch = self.state.lock().await.write_pipeline.pop_front();
        let Some(batch) = batch else {
            return Ok(());
        };
        self.write_stream.inhibit_backoff();
        if let Err(err) = self
            .syncer()?
            .reject_failed_write(batch.batch_id, error)
            .await
        {
            self.disable_network_until_recovery(err).await?;
        }
        self.fill_write_pipeline().await
    }
}

/// Routes stream callbacks back into the remote store without keeping it
/// alive.
struct RemoteStreamListener {
    inner: Weak<RemoteStoreInner>,
}

impl RemoteStreamListener {
    fn inner(&self) -> FirestoreResult<Arc<RemoteStoreInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| internal_error("RemoteStore was dropped"))
    }
}

#[async_trait]
impl WatchStreamListener for RemoteStreamListener {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        self.inner()?.on_watch_stream_open().await
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.inner()?.on_watch_change(change, snapshot_version).await
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.inner()?.on_watch_stream_close(error).await
    }
}

#[async_trait]
impl WriteStreamListener for RemoteStreamListener {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.inner()?.on_write_stream_open().await
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        self.inner()?.on_write_handshake_complete().await
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        self.inner()?
            .on_mutation_result(commit_version, results)
            .await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.inner()?.on_write_stream_close(error).await
    }
}
