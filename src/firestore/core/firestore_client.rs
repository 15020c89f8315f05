//! Owns and wires the components of one client.
//!
//! Every operation is funnelled through the client's [`AsyncQueue`], so the
//! local store, remote store and sync engine never run concurrently.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use futures::channel::oneshot;
use futures::FutureExt;

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, QueryListener, SnapshotObserver, SyncEngineListener,
};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{
    cancelled, failed_precondition, internal_error, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::kv_store::KvDatabase;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_garbage_collector::LruGarbageCollector;
use crate::firestore::local::lru_scheduler::LruScheduler;
use crate::firestore::local::persistence::{Persistence, PersistenceParams, PrimaryStateListener};
use crate::firestore::local::shared_client_state::{
    MemorySharedClientState, SharedClientState, SharedClientStateSyncer,
    WebStorageSharedClientState,
};
use crate::firestore::local::web_storage::WebStorageArea;
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, MaybeDocumentMap, Mutation,
};
use crate::firestore::remote::connectivity_monitor::ConnectivityMonitor;
use crate::firestore::remote::credentials::{CredentialsProvider, User};
use crate::firestore::remote::datastore::{Connection, Datastore};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::ClientSettings;
use crate::util::async_queue::AsyncQueue;

const LOG_TAG: &str = "FirestoreClient";

/// Platform pieces a client is built from. Clients that share a cache are
/// given the same database and storage area.
#[derive(Clone)]
pub struct ClientComponents {
    pub connection: Arc<dyn Connection>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub connectivity_monitor: Arc<dyn ConnectivityMonitor>,
    pub database: Arc<KvDatabase>,
    pub web_storage: Arc<WebStorageArea>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientLifecycle {
    Running,
    Terminated,
}

pub struct FirestoreClient {
    settings: ClientSettings,
    queue: AsyncQueue,
    credentials: Arc<dyn CredentialsProvider>,
    persistence: Arc<Persistence>,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    shared_client_state: Arc<dyn SharedClientState>,
    lru_scheduler: Arc<LruScheduler>,
    lifecycle: Mutex<ClientLifecycle>,
}

impl std::fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("client_id", &self.settings.client_id)
            .field("lifecycle", &*self.lifecycle())
            .finish_non_exhaustive()
    }
}

/// Components created on the queue during start up.
struct StartedComponents {
    persistence: Arc<Persistence>,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    shared_client_state: Arc<dyn SharedClientState>,
    lru_scheduler: Arc<LruScheduler>,
}

impl FirestoreClient {
    /// Starts a client: opens persistence, joins the primary election and
    /// brings up the network if this client becomes primary.
    pub async fn start(
        settings: ClientSettings,
        components: ClientComponents,
    ) -> FirestoreResult<Arc<Self>> {
        settings.validate()?;
        let queue = AsyncQueue::new();

        // The first call reports the current user. Later calls are user
        // changes and go to the running client.
        let client_slot: Arc<OnceLock<Weak<FirestoreClient>>> = Arc::new(OnceLock::new());
        let (initial_user_tx, initial_user_rx) = oneshot::channel::<User>();
        let initial_user_tx = Mutex::new(Some(initial_user_tx));
        let listener_slot = Arc::clone(&client_slot);
        components
            .credentials
            .set_change_listener(Arc::new(move |user: User| {
                let first = initial_user_tx
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(first) = first {
                    let _ = first.send(user);
                    return;
                }
                if let Some(client) = listener_slot.get().and_then(Weak::upgrade) {
                    client.queue_credential_change(user);
                }
            }));
        let initial_user = initial_user_rx
            .await
            .map_err(|_| internal_error("Credentials provider never reported a user"))?;
        log::debug!(
            "{LOG_TAG}: initializing client {} for user {}",
            settings.client_id,
            initial_user.storage_key()
        );

        let init_settings = settings.clone();
        let init_components = components.clone();
        let init_queue = queue.clone();
        let started = queue
            .enqueue(move || async move {
                Self::initialize_components(init_queue, init_settings, init_components, initial_user)
                    .await
            })
            .await?;

        let client = Arc::new(Self {
            settings,
            queue,
            credentials: components.credentials,
            persistence: started.persistence,
            local_store: started.local_store,
            remote_store: started.remote_store,
            sync_engine: started.sync_engine,
            event_manager: started.event_manager,
            shared_client_state: started.shared_client_state,
            lru_scheduler: started.lru_scheduler,
            lifecycle: Mutex::new(ClientLifecycle::Running),
        });
        let _ = client_slot.set(Arc::downgrade(&client));
        Ok(client)
    }

    async fn initialize_components(
        queue: AsyncQueue,
        settings: ClientSettings,
        components: ClientComponents,
        user: User,
    ) -> FirestoreResult<StartedComponents> {
        let persistence = Persistence::new(
            PersistenceParams {
                persistence_key: settings.persistence_key.clone(),
                client_id: settings.client_id.clone(),
                allow_tab_synchronization: settings.synchronize_tabs,
                lru_params: settings.lru_params(),
            },
            queue.clone(),
            components.database,
            Arc::clone(&components.web_storage),
            LocalSerializer::new(JsonProtoSerializer::new(settings.database_id.clone())),
        );
        let shared_client_state: Arc<dyn SharedClientState> = if settings.synchronize_tabs {
            WebStorageSharedClientState::new(
                queue.clone(),
                components.web_storage,
                &settings.persistence_key,
                settings.client_id.clone(),
                user.clone(),
            )
        } else {
            MemorySharedClientState::new()
        };
        persistence.start().await?;

        let local_store = LocalStore::new(Arc::clone(&persistence), user.clone());
        local_store.start().await?;

        let datastore = Arc::new(Datastore::new(
            components.connection,
            Arc::clone(&components.credentials),
            JsonProtoSerializer::new(settings.database_id.clone()),
        ));
        let remote_store = RemoteStore::new(
            queue.clone(),
            Arc::clone(&local_store),
            datastore,
            components.connectivity_monitor,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::clone(&shared_client_state),
            user,
            settings.max_concurrent_limbo_resolutions,
        );
        let event_manager = EventManager::new(sync_engine.clone());
        let engine_listener: Weak<dyn SyncEngineListener> = Arc::<EventManager>::downgrade(&event_manager);
        sync_engine.set_listener(engine_listener);
        let remote_syncer: Weak<dyn RemoteSyncer> = Arc::<SyncEngine>::downgrade(&sync_engine);
        remote_store.set_syncer(remote_syncer);
        let shared_syncer: Weak<dyn SharedClientStateSyncer> = Arc::<SyncEngine>::downgrade(&sync_engine);
        shared_client_state.set_syncer(shared_syncer);

        let weak_engine = Arc::downgrade(&sync_engine);
        shared_client_state.set_online_state_handler(Arc::new(move |online_state| {
            if let Some(engine) = weak_engine.upgrade() {
                engine.apply_shared_online_state(online_state);
            }
        }));
        let listen_sequence = Arc::clone(persistence.listen_sequence());
        shared_client_state.set_sequence_number_handler(Arc::new(move |sequence_number| {
            listen_sequence.set_previous_value(sequence_number);
        }));
        let weak_shared = Arc::downgrade(&shared_client_state);
        persistence
            .listen_sequence()
            .set_handler(Arc::new(move |sequence_number| {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.write_sequence_number(sequence_number);
                }
            }));
        shared_client_state.start().await?;

        let lru_scheduler = LruScheduler::new(
            LruGarbageCollector::new(persistence.reference_delegate(), persistence.lru_params()),
            queue,
        );
        persistence
            .set_primary_state_listener(primary_state_listener(
                Arc::downgrade(&sync_engine),
                Arc::downgrade(&local_store),
                Arc::downgrade(&lru_scheduler),
            ))
            .await;

        Ok(StartedComponents {
            persistence,
            local_store,
            remote_store,
            sync_engine,
            event_manager,
            shared_client_state,
            lru_scheduler,
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, ClientLifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_terminated(&self) -> bool {
        *self.lifecycle() == ClientLifecycle::Terminated
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    /// The queue every operation of this client runs on. Tests use it to
    /// fast-forward timers.
    pub fn async_queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn is_primary_client(&self) -> bool {
        self.sync_engine.is_primary_client()
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    /// Registers `observer` for the snapshots of `query`. Listen failures
    /// reach the observer's `on_error`.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: Arc<dyn SnapshotObserver>,
    ) -> FirestoreResult<Arc<QueryListener>> {
        self.verify_not_terminated()?;
        let listener = QueryListener::new(query, options, observer);
        let event_manager = Arc::clone(&self.event_manager);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(move || async move {
                if let Err(err) = event_manager.listen(registered).await {
                    log::debug!("{LOG_TAG}: listen failed: {err}");
                }
                Ok(())
            })
            .await?;
        Ok(listener)
    }

    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        // Listeners detach silently once the client is gone.
        if self.is_terminated() {
            return Ok(());
        }
        let event_manager = Arc::clone(&self.event_manager);
        let listener = Arc::clone(listener);
        self.queue
            .enqueue(move || async move { event_manager.unlisten(&listener).await })
            .await
    }

    /// Applies `mutations` locally at once and resolves when the backend
    /// accepted or rejected them.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let (callback, completion) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || async move { sync_engine.write(mutations, callback).await })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("The write was dropped before it completed"))?
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    /// A user change rejects the wait with `Cancelled`.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let (callback, completion) = oneshot::channel();
        let sync_engine = Arc::clone(&self.sync_engine);
        self.queue
            .enqueue(move || async move {
                sync_engine.register_pending_writes_callback(callback).await;
                Ok(())
            })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("The client was terminated while waiting for pending writes"))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let persistence = Arc::clone(&self.persistence);
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || async move {
                persistence.set_network_enabled(true);
                remote_store.enable_network().await
            })
            .await
    }

    /// Takes the client offline. Writes keep queueing locally and listeners
    /// are served from the cache.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let persistence = Arc::clone(&self.persistence);
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || async move {
                persistence.set_network_enabled(false);
                remote_store.disable_network().await
            })
            .await
    }

    /// Reads `key` from the cache, local writes included. `Ok(None)` means
    /// the document is known to be missing.
    pub async fn get_document_from_local_cache(
        &self,
        key: DocumentKey,
    ) -> FirestoreResult<Option<Document>> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                match local_store.read_document(&key).await? {
                    Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
                    Some(MaybeDocument::NoDocument(_)) => Ok(None),
                    _ => Err(unavailable(
                        "Failed to get document from cache. (However, this document may exist on the server. Run again without setting 'source' in the GetOptions to attempt to retrieve the document from the server.)",
                    )),
                }
            })
            .await
    }

    /// Runs `query` against the cache and returns the snapshot a new
    /// listener would see.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                let result = local_store.execute_query(&query, true).await?;
                let mut view = View::new(query, result.remote_keys);
                let documents = result
                    .documents
                    .iter()
                    .fold(MaybeDocumentMap::default(), |map, (key, doc)| {
                        map.insert(key.clone(), MaybeDocument::Document(doc.clone()))
                    });
                let changes = view.compute_doc_changes(&documents, None);
                view.apply_changes(changes, false, None)
                    .snapshot
                    .ok_or_else(|| internal_error("A new view always produces a snapshot"))
            })
            .await
    }

    /// Switches the client to `user`: streams restart with the new
    /// credentials and views show that user's pending writes.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.remote_store.clone();
        self.queue
            .enqueue(move || async move { remote_store.handle_credential_change(user).await })
            .await
    }

    fn queue_credential_change(&self, user: User) {
        let remote_store = self.remote_store.clone();
        self.queue.enqueue_and_forget(move || async move {
            if let Err(err) = remote_store.handle_credential_change(user).await {
                log::warn!("{LOG_TAG}: failed to switch user: {err}");
            }
        });
    }

    /// Shuts the client down. Later operations fail with
    /// `FailedPrecondition`; calling it again does nothing.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle == ClientLifecycle::Terminated {
                return Ok(());
            }
            *lifecycle = ClientLifecycle::Terminated;
        }
        log::debug!("{LOG_TAG}: terminating client {}", self.settings.client_id);
        self.queue.enter_restricted_mode();

        let remote_store = self.remote_store.clone();
        let shared_client_state = Arc::clone(&self.shared_client_state);
        let persistence = Arc::clone(&self.persistence);
        let lru_scheduler = Arc::clone(&self.lru_scheduler);
        let credentials = Arc::clone(&self.credentials);
        self.queue
            .enqueue_even_while_restricted(move || async move {
                lru_scheduler.stop();
                remote_store.shutdown().await;
                remote_store.datastore().terminate();
                shared_client_state.shutdown();
                credentials.remove_change_listener();
                persistence.shutdown().await
            })
            .await
    }
}

/// Follows the primary lease: the sync engine switches roles and only the
/// primary collects garbage.
fn primary_state_listener(
    sync_engine: Weak<SyncEngine>,
    local_store: Weak<LocalStore>,
    lru_scheduler: Weak<LruScheduler>,
) -> PrimaryStateListener {
    Arc::new(move |is_primary: bool| {
        let sync_engine = sync_engine.clone();
        let local_store = local_store.clone();
        let lru_scheduler = lru_scheduler.clone();
        async move {
            let Some(engine) = sync_engine.upgrade() else {
                return;
            };
            if let Err(err) = engine.apply_primary_state(is_primary).await {
                log::warn!("{LOG_TAG}: failed to apply primary state {is_primary}: {err}");
            }
            if let Some(scheduler) = lru_scheduler.upgrade() {
                match local_store.upgrade() {
                    Some(local_store) if is_primary => scheduler.start(&local_store),
                    _ => scheduler.stop(),
                }
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::types::OnlineState;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{DatabaseId, FieldPath, ResourcePath};
    use crate::firestore::remote::connectivity_monitor::NoopConnectivityMonitor;
    use crate::firestore::remote::credentials::UserCredentialsProvider;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::ObjectValue;

    #[derive(Default)]
    struct Collector {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<FirestoreError>>,
    }

    impl SnapshotObserver for Collector {
        fn on_next(&self, snapshot: ViewSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot);
        }

        fn on_error(&self, error: FirestoreError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    async fn offline_client(
        name: &str,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> (Arc<FirestoreClient>, MultiplexedConnection) {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let settings = ClientSettings {
            persistence_key: name.to_string(),
            database_id: DatabaseId::new("p", "(default)"),
            ..ClientSettings::default()
        };
        let client = FirestoreClient::start(
            settings,
            ClientComponents {
                connection: Arc::new(MultiplexedConnection::new(client_transport)),
                credentials,
                connectivity_monitor: Arc::new(NoopConnectivityMonitor),
                database: KvDatabase::new(name),
                web_storage: WebStorageArea::new(),
            },
        )
        .await
        .unwrap();
        client.disable_network().await.unwrap();
        (client, MultiplexedConnection::new_acceptor(server_transport))
    }

    fn set_mutation(path: &str, value: i64) -> Mutation {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single("x"), value.into());
        Mutation::set(DocumentKey::from_string(path).unwrap(), data)
    }

    #[tokio::test]
    async fn single_client_becomes_primary() {
        let credentials = Arc::new(UserCredentialsProvider::new(User::new("alice"), None));
        let (client, _server) = offline_client("client-primary", credentials).await;
        assert!(client.is_primary_client());
        assert_eq!(client.event_manager.online_state(), OnlineState::Offline);
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn cached_reads_see_pending_writes() {
        let credentials = Arc::new(UserCredentialsProvider::new(User::new("alice"), None));
        let (client, _server) = offline_client("client-cache", credentials).await;
        let write = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.write(vec![set_mutation("rooms/a", 1)]).await })
        };
        client.async_queue().drain().await;

        let doc = client
            .get_document_from_local_cache(DocumentKey::from_string("rooms/a").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(doc.has_local_mutations());

        let snapshot = client
            .get_documents_from_local_cache(Query::new(ResourcePath::from_string("rooms").unwrap()))
            .await
            .unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.has_pending_writes());

        let missing = client
            .get_document_from_local_cache(DocumentKey::from_string("rooms/b").unwrap())
            .await
            .unwrap_err();
        assert_eq!(missing.code, FirestoreErrorCode::Unavailable);
        write.abort();
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn user_change_cancels_wait_for_pending_writes() {
        let credentials = Arc::new(UserCredentialsProvider::new(User::new("alice"), None));
        let (client, _server) = offline_client("client-user-change", credentials.clone()).await;
        let observer = Arc::new(Collector::default());
        client
            .listen(
                Query::new(ResourcePath::from_string("rooms").unwrap()),
                ListenOptions::default(),
                observer.clone(),
            )
            .await
            .unwrap();
        let _write = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.write(vec![set_mutation("rooms/a", 1)]).await })
        };
        client.async_queue().drain().await;
        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.wait_for_pending_writes().await })
        };
        client.async_queue().drain().await;

        credentials.change_user(User::new("bob"), None);
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);

        client.async_queue().drain().await;
        let snapshots = observer.snapshots.lock().unwrap();
        assert!(snapshots.last().unwrap().docs.is_empty());
        assert!(observer.errors.lock().unwrap().is_empty());
        drop(snapshots);
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_rejects_later_calls() {
        let credentials = Arc::new(UserCredentialsProvider::new(User::new("alice"), None));
        let (client, _server) = offline_client("client-terminate", credentials).await;
        client.terminate().await.unwrap();
        client.terminate().await.unwrap();
        assert!(client.is_terminated());
        let err = client.write(vec![set_mutation("rooms/a", 1)]).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }
}
