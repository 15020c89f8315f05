//! Durable storage shared by every client opened on the same persistence key.
//!
//! All reads and writes go through [`Persistence::run_transaction`]. When
//! several clients share one [`KvDatabase`], exactly one of them holds the
//! primary lease: only the primary talks to the backend, writes remote
//! documents and runs garbage collection. Each client refreshes its metadata
//! row every few seconds and re-evaluates whether it should hold the lease.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::core::listen_sequence::ListenSequence;
use crate::firestore::core::types::ClientId;
use crate::firestore::error::{failed_precondition, primary_lease_lost, FirestoreResult};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::kv_store::{KvDatabase, KvTransaction, KvTransactionMode};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::lru_garbage_collector::LruDelegate;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::schema::{
    DbClientMetadata, DbPrimaryClient, DbTargetGlobal, SchemaConverter, CLIENT_METADATA_STORE,
    OWNER_KEY, OWNER_STORE, SCHEMA_VERSION, TARGET_GLOBAL_KEY, TARGET_GLOBAL_STORE,
};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::web_storage::{StorageHandle, WebStorageArea};
use crate::firestore::model::ListenSequenceNumber;
use crate::firestore::remote::credentials::User;
use crate::firestore::settings::LruParams;
use crate::platform::runtime::now_millis;
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "Persistence";

/// Clients whose metadata is older than this are removed by the primary.
pub const MAX_CLIENT_AGE_MS: i64 = 30 * 60 * 1000;

/// A lease or metadata row older than this no longer counts.
pub const MAX_PRIMARY_ELIGIBLE_AGE_MS: i64 = 5000;

pub const CLIENT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_millis(4000);

const ZOMBIED_CLIENTS_KEY_PREFIX: &str = "firestore_zombie";

pub const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "There is another tab open with offline persistence enabled. Only one such tab is allowed \
     at a time. The other tab must be closed or persistence must be disabled.";

/// Called with the new primary state whenever it changes.
pub type PrimaryStateListener = Arc<dyn Fn(bool) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Fails with a lease-lost error unless this client holds the primary
    /// lease. The lease is extended once the operation succeeds.
    ReadWritePrimary,
}

type CommittedListener = Box<dyn FnOnce() + Send>;

/// Handle passed to transaction bodies. Dereferences to the underlying
/// key-value transaction and carries the sequence number stamped on every
/// document the transaction touches.
pub struct PersistenceTransaction<'t, 'db> {
    store: &'t mut KvTransaction<'db>,
    sequence_number: ListenSequenceNumber,
    committed_listeners: Vec<CommittedListener>,
}

impl<'t, 'db> PersistenceTransaction<'t, 'db> {
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Runs `listener` after the transaction committed. Listeners of aborted
    /// attempts are dropped.
    pub fn add_on_committed_listener(&mut self, listener: impl FnOnce() + Send + 'static) {
        self.committed_listeners.push(Box::new(listener));
    }
}

impl<'t, 'db> Deref for PersistenceTransaction<'t, 'db> {
    type Target = KvTransaction<'db>;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl<'t, 'db> DerefMut for PersistenceTransaction<'t, 'db> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store
    }
}

struct PersistenceState {
    started: bool,
    is_primary: bool,
    network_enabled: bool,
    in_foreground: bool,
    last_garbage_collection_ms: Option<i64>,
    refresher: Option<DelayedOperation>,
    primary_state_listener: Option<PrimaryStateListener>,
}

pub struct Persistence {
    persistence_key: String,
    client_id: ClientId,
    allow_tab_synchronization: bool,
    queue: AsyncQueue,
    db: Arc<KvDatabase>,
    web_storage: Arc<WebStorageArea>,
    storage_handle: StorageHandle,
    serializer: LocalSerializer,
    lru_params: LruParams,
    listen_sequence: Arc<ListenSequence>,
    state: Mutex<PersistenceState>,
    self_ref: Weak<Persistence>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("persistence_key", &self.persistence_key)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

pub struct PersistenceParams {
    pub persistence_key: String,
    pub client_id: ClientId,
    pub allow_tab_synchronization: bool,
    pub lru_params: LruParams,
}

impl Persistence {
    pub fn new(
        params: PersistenceParams,
        queue: AsyncQueue,
        db: Arc<KvDatabase>,
        web_storage: Arc<WebStorageArea>,
        serializer: LocalSerializer,
    ) -> Arc<Self> {
        let storage_handle = web_storage.attach();
        Arc::new_cyclic(|self_ref| Self {
            persistence_key: params.persistence_key,
            client_id: params.client_id,
            allow_tab_synchronization: params.allow_tab_synchronization,
            queue,
            db,
            web_storage,
            storage_handle,
            serializer,
            lru_params: params.lru_params,
            listen_sequence: Arc::new(ListenSequence::new(0)),
            state: Mutex::new(PersistenceState {
                started: false,
                is_primary: false,
                network_enabled: true,
                in_foreground: false,
                last_garbage_collection_ms: None,
                refresher: None,
                primary_state_listener: None,
            }),
            self_ref: self_ref.clone(),
        })
    }

    /// Opens the database, takes part in the lease election and starts the
    /// periodic metadata refresh.
    ///
    /// Without tab synchronization, failing to obtain the lease is an error:
    /// another client owns the cache exclusively.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.db
            .open(SCHEMA_VERSION, SchemaConverter::create_or_upgrade)?;
        self.update_client_metadata_and_try_become_primary()?;
        if !self.allow_tab_synchronization && !self.is_primary() {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        self.schedule_client_metadata_and_primary_lease_refreshes();

        let highest = self.db.run_transaction(
            "getHighestListenSequenceNumber",
            KvTransactionMode::ReadOnly,
            |txn| {
                Ok(txn
                    .get::<DbTargetGlobal>(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?
                    .map_or(0, |global| global.highest_listen_sequence_number))
            },
        )?;
        self.listen_sequence.set_previous_value(highest);
        self.state().started = true;
        log::debug!("{LOG_TAG}: started client '{}'", self.client_id);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn persistence_key(&self) -> &str {
        &self.persistence_key
    }

    pub fn is_primary(&self) -> bool {
        self.state().is_primary
    }

    pub fn lru_params(&self) -> LruParams {
        self.lru_params
    }

    pub fn listen_sequence(&self) -> &Arc<ListenSequence> {
        &self.listen_sequence
    }

    pub fn serializer(&self) -> &LocalSerializer {
        &self.serializer
    }

    pub fn mutation_queue(&self, user: &User) -> MutationQueue {
        MutationQueue::new(user.storage_key(), self.serializer.clone())
    }

    pub fn target_cache(&self) -> TargetCache {
        TargetCache::new(self.serializer.clone())
    }

    pub fn remote_document_cache(&self) -> RemoteDocumentCache {
        RemoteDocumentCache::new(self.serializer.clone())
    }

    pub fn index_manager(&self) -> IndexManager {
        IndexManager
    }

    pub fn reference_delegate(&self) -> LruDelegate {
        LruDelegate::new(self.serializer.clone())
    }

    /// Registers the listener and immediately reports the current state.
    pub async fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        let is_primary = {
            let mut state = self.state();
            state.primary_state_listener = Some(Arc::clone(&listener));
            state.is_primary
        };
        listener(is_primary).await;
    }

    pub fn set_network_enabled(&self, network_enabled: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.network_enabled != network_enabled;
            state.network_enabled = network_enabled;
            changed
        };
        if changed {
            self.schedule_immediate_refresh();
        }
    }

    /// Foreground clients are preferred when the lease is up for grabs.
    pub fn set_in_foreground(&self, in_foreground: bool) {
        let changed = {
            let mut state = self.state();
            let changed = state.in_foreground != in_foreground;
            state.in_foreground = in_foreground;
            changed
        };
        if changed {
            self.schedule_immediate_refresh();
        }
    }

    fn schedule_immediate_refresh(&self) {
        let weak = self.self_ref.clone();
        self.queue.enqueue_and_forget(move || async move {
            let Some(persistence) = weak.upgrade() else {
                return;
            };
            if persistence.is_started() {
                if let Err(err) = persistence.update_client_metadata_and_try_become_primary() {
                    log::error!("{LOG_TAG}: failed to refresh the primary lease: {err}");
                }
            }
        });
    }

    /// Ids of the clients that refreshed their metadata recently and are not
    /// zombied.
    pub fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>> {
        let clients = self.db.run_transaction(
            "getActiveClients",
            KvTransactionMode::ReadOnly,
            |txn| load_client_metadata(txn),
        )?;
        Ok(self
            .filter_active_clients(clients, MAX_CLIENT_AGE_MS)
            .into_iter()
            .map(|client| client.client_id)
            .collect())
    }

    /// Runs `operation` in one storage transaction stamped with a fresh
    /// sequence number.
    pub async fn run_transaction<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        mut operation: F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_, '_>) -> FirestoreResult<T> + Send,
        T: Send,
    {
        log::debug!("{LOG_TAG}: starting transaction '{action}'");
        let sequence_number = self.listen_sequence.next();
        let kv_mode = match mode {
            TransactionMode::ReadOnly => KvTransactionMode::ReadOnly,
            TransactionMode::ReadWrite | TransactionMode::ReadWritePrimary => {
                KvTransactionMode::ReadWrite
            }
        };
        let (result, listeners) = self.db.run_transaction(action, kv_mode, |store| {
            if mode == TransactionMode::ReadWritePrimary {
                if !self.verify_primary_lease(store)? {
                    log::error!("{LOG_TAG}: failed to obtain primary lease for action '{action}'");
                    self.mark_not_primary();
                    return Err(primary_lease_lost());
                }
            } else {
                self.verify_allow_tab_synchronization(store)?;
            }
            let mut txn = PersistenceTransaction {
                store: &mut *store,
                sequence_number,
                committed_listeners: Vec::new(),
            };
            let result = operation(&mut txn)?;
            let listeners = txn.committed_listeners;
            if mode == TransactionMode::ReadWritePrimary {
                self.acquire_or_extend_primary_lease(store)?;
            }
            Ok((result, listeners))
        })?;
        for listener in listeners {
            listener();
        }
        Ok(result)
    }

    /// Marks the client as zombied, stops refreshing, gives up the lease and
    /// removes the metadata row. Safe to call more than once.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        let refresher = {
            let mut state = self.state();
            state.started = false;
            state.refresher.take()
        };
        self.mark_client_zombied();
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        self.db.run_transaction("shutdown", KvTransactionMode::ReadWrite, |txn| {
            self.release_primary_lease_if_held(txn)?;
            txn.delete(CLIENT_METADATA_STORE, &self.client_id)
        })?;
        self.state().is_primary = false;
        self.remove_client_zombied_entry();
        Ok(())
    }

    fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        self.db.run_transaction(
            "updateClientMetadataAndTryBecomePrimary",
            KvTransactionMode::ReadWrite,
            |txn| {
                let (network_enabled, in_foreground, was_primary) = {
                    let state = self.state();
                    (state.network_enabled, state.in_foreground, state.is_primary)
                };
                txn.put(
                    CLIENT_METADATA_STORE,
                    &self.client_id,
                    &DbClientMetadata {
                        client_id: self.client_id.clone(),
                        update_time_ms: now_millis(),
                        network_enabled,
                        in_foreground,
                    },
                )?;

                let mut was_primary = was_primary;
                if was_primary && !self.verify_primary_lease(txn)? {
                    was_primary = false;
                    self.mark_not_primary();
                }

                let can_act_as_primary =
                    self.can_act_as_primary(txn, network_enabled, in_foreground)?;
                let changed = {
                    let mut state = self.state();
                    let changed = state.is_primary != can_act_as_primary;
                    state.is_primary = can_act_as_primary;
                    changed
                };
                if changed {
                    self.notify_primary_state(can_act_as_primary);
                }

                if was_primary && !can_act_as_primary {
                    self.release_primary_lease_if_held(txn)?;
                } else if can_act_as_primary {
                    self.acquire_or_extend_primary_lease(txn)?;
                }
                Ok(())
            },
        )
    }

    fn can_act_as_primary(
        &self,
        txn: &mut KvTransaction<'_>,
        network_enabled: bool,
        in_foreground: bool,
    ) -> FirestoreResult<bool> {
        let current_primary: Option<DbPrimaryClient> = txn.get(OWNER_STORE, OWNER_KEY)?;
        if let Some(primary) = current_primary.as_ref().filter(|p| self.is_lease_valid(p)) {
            if self.is_local_client(Some(primary)) {
                if network_enabled {
                    return Ok(true);
                }
            } else if !primary.allow_tab_synchronization {
                return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
            } else {
                return Ok(false);
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }

        let clients = load_client_metadata(txn)?;
        let preferred_candidate = self
            .filter_active_clients(clients, MAX_PRIMARY_ELIGIBLE_AGE_MS)
            .into_iter()
            .find(|other| {
                if other.client_id == self.client_id {
                    return false;
                }
                let better_network = !network_enabled && other.network_enabled;
                let better_visibility = !in_foreground && other.in_foreground;
                let same_network = network_enabled == other.network_enabled;
                better_network || (better_visibility && same_network)
            });
        let eligible = preferred_candidate.is_none();
        if self.state().is_primary != eligible {
            log::debug!(
                "{LOG_TAG}: client {} eligible for a primary lease",
                if eligible { "is" } else { "is not" }
            );
        }
        Ok(eligible)
    }

    fn verify_primary_lease(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<bool> {
        let primary: Option<DbPrimaryClient> = txn.get(OWNER_STORE, OWNER_KEY)?;
        Ok(self.is_local_client(primary.as_ref()))
    }

    fn verify_allow_tab_synchronization(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let primary: Option<DbPrimaryClient> = txn.get(OWNER_STORE, OWNER_KEY)?;
        if let Some(primary) = primary {
            if self.is_lease_valid(&primary)
                && !self.is_local_client(Some(&primary))
                && !primary.allow_tab_synchronization
            {
                return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
            }
        }
        Ok(())
    }

    fn acquire_or_extend_primary_lease(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        txn.put(
            OWNER_STORE,
            OWNER_KEY,
            &DbPrimaryClient {
                owner_id: self.client_id.clone(),
                allow_tab_synchronization: self.allow_tab_synchronization,
                lease_timestamp_ms: now_millis(),
            },
        )
    }

    fn release_primary_lease_if_held(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let primary: Option<DbPrimaryClient> = txn.get(OWNER_STORE, OWNER_KEY)?;
        if self.is_local_client(primary.as_ref()) {
            log::debug!("{LOG_TAG}: releasing primary lease");
            txn.delete(OWNER_STORE, OWNER_KEY)?;
        }
        Ok(())
    }

    fn mark_not_primary(&self) {
        self.state().is_primary = false;
        self.notify_primary_state(false);
    }

    fn notify_primary_state(&self, is_primary: bool) {
        let weak = self.self_ref.clone();
        self.queue.enqueue_and_forget(move || async move {
            let Some(persistence) = weak.upgrade() else {
                return;
            };
            let listener = {
                let state = persistence.state();
                if !state.started {
                    return;
                }
                state.primary_state_listener.clone()
            };
            if let Some(listener) = listener {
                listener(is_primary).await;
            }
        });
    }

    fn schedule_client_metadata_and_primary_lease_refreshes(&self) {
        let weak = self.self_ref.clone();
        let refresher = self.queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            CLIENT_METADATA_REFRESH_INTERVAL,
            move || async move {
                let Some(persistence) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = persistence.update_client_metadata_and_try_become_primary() {
                    log::error!("{LOG_TAG}: failed to refresh client metadata: {err}");
                }
                if let Err(err) = persistence.maybe_garbage_collect_multi_client_state().await {
                    log::debug!("{LOG_TAG}: skipping client metadata cleanup: {err}");
                }
                if persistence.is_started() {
                    persistence.schedule_client_metadata_and_primary_lease_refreshes();
                }
            },
        );
        self.state().refresher = Some(refresher);
    }

    /// Deletes metadata rows and zombie markers of clients that have been
    /// inactive for longer than [`MAX_CLIENT_AGE_MS`]. Primary only, at most
    /// once per that interval.
    async fn maybe_garbage_collect_multi_client_state(&self) -> FirestoreResult<()> {
        let now = now_millis();
        {
            let mut state = self.state();
            let due = state
                .last_garbage_collection_ms
                .map_or(true, |last| now - last > MAX_CLIENT_AGE_MS);
            if !state.is_primary || !due {
                return Ok(());
            }
            state.last_garbage_collection_ms = Some(now);
        }

        let inactive = self
            .run_transaction(
                "maybeGarbageCollectMultiClientState",
                TransactionMode::ReadWritePrimary,
                |txn| {
                    let clients = load_client_metadata(txn)?;
                    let active: Vec<ClientId> = self
                        .filter_active_clients(clients.clone(), MAX_CLIENT_AGE_MS)
                        .into_iter()
                        .map(|client| client.client_id)
                        .collect();
                    let inactive: Vec<ClientId> = clients
                        .into_iter()
                        .map(|client| client.client_id)
                        .filter(|id| !active.contains(id))
                        .collect();
                    for client_id in &inactive {
                        txn.delete(CLIENT_METADATA_STORE, client_id)?;
                    }
                    Ok(inactive)
                },
            )
            .await?;

        for client_id in inactive {
            log::debug!("{LOG_TAG}: removing inactive client '{client_id}'");
            self.web_storage
                .remove_item(self.storage_handle, &self.zombied_client_key(&client_id));
        }
        Ok(())
    }

    fn filter_active_clients(
        &self,
        clients: Vec<DbClientMetadata>,
        activity_threshold_ms: i64,
    ) -> Vec<DbClientMetadata> {
        clients
            .into_iter()
            .filter(|client| {
                is_within_age(client.update_time_ms, activity_threshold_ms)
                    && !self.is_client_zombied(&client.client_id)
            })
            .collect()
    }

    fn is_lease_valid(&self, primary: &DbPrimaryClient) -> bool {
        is_within_age(primary.lease_timestamp_ms, MAX_PRIMARY_ELIGIBLE_AGE_MS)
            && !self.is_client_zombied(&primary.owner_id)
    }

    fn is_local_client(&self, primary: Option<&DbPrimaryClient>) -> bool {
        primary.is_some_and(|primary| primary.owner_id == self.client_id)
    }

    fn is_client_zombied(&self, client_id: &str) -> bool {
        let zombied = self
            .web_storage
            .get_item(&self.zombied_client_key(client_id))
            .is_some();
        if zombied {
            log::debug!("{LOG_TAG}: client '{client_id}' is zombied");
        }
        zombied
    }

    /// Records that this client is going away so others can take over the
    /// lease without waiting for it to expire.
    pub fn mark_client_zombied(&self) {
        self.web_storage.set_item(
            self.storage_handle,
            &self.zombied_client_key(&self.client_id),
            &now_millis().to_string(),
        );
    }

    fn remove_client_zombied_entry(&self) {
        self.web_storage
            .remove_item(self.storage_handle, &self.zombied_client_key(&self.client_id));
    }

    fn zombied_client_key(&self, client_id: &str) -> String {
        format!(
            "{ZOMBIED_CLIENTS_KEY_PREFIX}_{}_{client_id}",
            self.persistence_key
        )
    }

    fn state(&self) -> MutexGuard<'_, PersistenceState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn load_client_metadata(txn: &KvTransaction<'_>) -> FirestoreResult<Vec<DbClientMetadata>> {
    Ok(txn
        .scan::<DbClientMetadata>(CLIENT_METADATA_STORE, None, None)?
        .into_iter()
        .map(|(_, client)| client)
        .collect())
}

fn is_within_age(update_time_ms: i64, max_age_ms: i64) -> bool {
    let now = now_millis();
    if update_time_ms < now - max_age_ms {
        return false;
    }
    if update_time_ms > now {
        log::error!("{LOG_TAG}: detected an update time that is in the future: {update_time_ms} > {now}");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn persistence(
        db: &Arc<KvDatabase>,
        storage: &Arc<WebStorageArea>,
        client_id: &str,
        multi_tab: bool,
    ) -> Arc<Persistence> {
        Persistence::new(
            PersistenceParams {
                persistence_key: "test".into(),
                client_id: client_id.into(),
                allow_tab_synchronization: multi_tab,
                lru_params: LruParams::default(),
            },
            AsyncQueue::new(),
            Arc::clone(db),
            Arc::clone(storage),
            LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        )
    }

    #[tokio::test]
    async fn first_client_takes_the_lease() {
        let db = KvDatabase::new("lease");
        let storage = WebStorageArea::new();
        let first = persistence(&db, &storage, "first", true);
        let second = persistence(&db, &storage, "second", true);
        first.start().await.unwrap();
        second.start().await.unwrap();

        assert!(first.is_primary());
        assert!(!second.is_primary());
        let mut clients = second.get_active_clients().unwrap();
        clients.sort();
        assert_eq!(clients, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn exclusive_lease_rejects_second_client() {
        let db = KvDatabase::new("exclusive");
        let storage = WebStorageArea::new();
        let first = persistence(&db, &storage, "first", false);
        first.start().await.unwrap();
        let second = persistence(&db, &storage, "second", false);
        let err = second.start().await.unwrap_err();
        assert_eq!(err.message(), PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG);
    }

    #[tokio::test]
    async fn zombied_primary_loses_its_lease() {
        let db = KvDatabase::new("zombie");
        let storage = WebStorageArea::new();
        let first = persistence(&db, &storage, "first", true);
        let second = persistence(&db, &storage, "second", true);
        first.start().await.unwrap();
        second.start().await.unwrap();

        first.mark_client_zombied();
        second.update_client_metadata_and_try_become_primary().unwrap();
        assert!(second.is_primary());

        let err = first
            .run_transaction("write", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_primary_lease_lost());
        assert!(!first.is_primary());
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease() {
        let db = KvDatabase::new("shutdown");
        let storage = WebStorageArea::new();
        let first = persistence(&db, &storage, "first", true);
        first.start().await.unwrap();
        first.shutdown().await.unwrap();
        first.shutdown().await.unwrap();

        let second = persistence(&db, &storage, "second", true);
        second.start().await.unwrap();
        assert!(second.is_primary());
        assert_eq!(second.get_active_clients().unwrap(), vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn committed_listeners_run_once_after_commit() {
        let db = KvDatabase::new("listeners");
        let storage = WebStorageArea::new();
        let client = persistence(&db, &storage, "only", true);
        client.start().await.unwrap();

        db.inject_failures(1);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let sequence = client
            .run_transaction("listen", TransactionMode::ReadWrite, |txn| {
                let flag = Arc::clone(&flag);
                txn.add_on_committed_listener(move || flag.store(true, Ordering::SeqCst));
                Ok(txn.current_sequence_number())
            })
            .await
            .unwrap();
        assert!(fired.load(Ordering::SeqCst));
        assert!(sequence > 0);
    }
}
