//! Fans view snapshots out to query listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::TargetId;
use crate::util::hard_assert;

const LOG_TAG: &str = "EventManager";

/// Receives the snapshots of one listen.
pub trait SnapshotObserver: Send + Sync {
    fn on_next(&self, snapshot: ViewSnapshot);
    /// Terminal. No snapshots follow.
    fn on_error(&self, error: FirestoreError);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change `from_cache` or pending writes.
    pub include_metadata_changes: bool,
    /// Hold back a cached first snapshot while the client may be online.
    pub wait_for_sync_when_online: bool,
}

/// Where the event manager starts and stops listens.
#[async_trait]
pub trait ListenSource: Send + Sync {
    async fn listen(&self, query: Query) -> FirestoreResult<TargetId>;
    async fn unlisten(&self, query: &Query) -> FirestoreResult<()>;
}

/// Callbacks the sync engine raises towards the listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);
    fn on_watch_error(&self, query: &Query, error: FirestoreError);
    fn on_online_state_change(&self, online_state: OnlineState);
}

struct ListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// One listen on a query. Decides which view snapshots reach the observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: Arc<dyn SnapshotObserver>,
    state: Mutex<ListenerState>,
}

impl std::fmt::Debug for QueryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryListener")
            .field("query", &self.query)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: Arc<dyn SnapshotObserver>) -> Arc<Self> {
        Arc::new(Self {
            query,
            options,
            observer,
            state: Mutex::new(ListenerState {
                raised_initial_event: false,
                snapshot: None,
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns whether a snapshot reached the observer.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        hard_assert(
            !snapshot.doc_changes.is_empty() || snapshot.sync_state_changed,
            "We got a new snapshot with no changes?",
        );
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let mut filtered = snapshot;
            filtered
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            filtered.excludes_metadata_changes = true;
            filtered
        };

        let raised = {
            let mut state = self.state();
            let raised = if !state.raised_initial_event {
                if self.should_raise_initial_event(&state, &snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_snapshot(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&state, &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            raised
        };
        match raised {
            Some(snapshot) => {
                self.observer.on_next(snapshot);
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        self.observer.on_error(error);
    }

    /// Returns whether the held back first snapshot was raised.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let raised = {
            let mut state = self.state();
            state.online_state = online_state;
            match state.snapshot.clone() {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(&state, &snapshot, online_state) =>
                {
                    state.raised_initial_event = true;
                    Some(initial_snapshot(&snapshot))
                }
                _ => None,
            }
        };
        match raised {
            Some(snapshot) => {
                self.observer.on_next(snapshot);
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(
        &self,
        state: &ListenerState,
        snapshot: &ViewSnapshot,
        online_state: OnlineState,
    ) -> bool {
        hard_assert(
            !state.raised_initial_event,
            "Determining whether to raise first event but already had first event",
        );
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is not worth raising until the backend
        // answered or the client is known to be offline.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, state: &ListenerState, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let had_pending_writes = state
            .snapshot
            .as_ref()
            .is_some_and(ViewSnapshot::has_pending_writes);
        let pending_writes_changed = had_pending_writes != snapshot.has_pending_writes();
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_snapshot(snapshot: &ViewSnapshot) -> ViewSnapshot {
    let mut initial = ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
    );
    initial.excludes_metadata_changes = snapshot.excludes_metadata_changes;
    initial
}

struct QueryListenersInfo {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    target_id: Option<TargetId>,
    listeners: Vec<Arc<QueryListener>>,
}

struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Shares one sync-engine listen between every listener of a query.
pub struct EventManager {
    source: Arc<dyn ListenSource>,
    state: Mutex<EventManagerState>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager").finish_non_exhaustive()
    }
}

impl EventManager {
    pub fn new(source: Arc<dyn ListenSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            state: Mutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `listener`. The first listener of a query starts the
    /// listen; later ones get the current snapshot right away.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<Option<TargetId>> {
        let query = listener.query().clone();
        let canonical_id = query.canonical_id();
        let (first_listen, online_state, existing) = {
            let mut state = self.state();
            let online_state = state.online_state;
            let first_listen = !state.queries.contains_key(&canonical_id);
            let info = state
                .queries
                .entry(canonical_id.clone())
                .or_insert_with(|| QueryListenersInfo {
                    query: query.clone(),
                    view_snapshot: None,
                    target_id: None,
                    listeners: Vec::new(),
                });
            info.listeners.push(Arc::clone(&listener));
            (first_listen, online_state, info.view_snapshot.clone())
        };

        // Raises nothing yet, the listener has no snapshot.
        let raised = listener.apply_online_state_change(online_state);
        hard_assert(!raised, "applyOnlineStateChange() shouldn't raise an event for brand-new listeners.");
        if let Some(snapshot) = existing {
            listener.on_view_snapshot(snapshot);
        }

        if !first_listen {
            return Ok(self.state().queries.get(&canonical_id).and_then(|info| info.target_id));
        }
        match self.source.listen(query).await {
            Ok(target_id) => {
                if let Some(info) = self.state().queries.get_mut(&canonical_id) {
                    info.target_id = Some(target_id);
                }
                Ok(Some(target_id))
            }
            Err(err) => {
                log::debug!("{LOG_TAG}: listen failed: {err}");
                let removed = self.state().queries.remove(&canonical_id);
                for listener in removed.map(|info| info.listeners).unwrap_or_default() {
                    listener.on_error(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Removes `listener`. The last listener of a query stops the listen.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = self.state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id).map(|info| info.query)
            } else {
                None
            }
        };
        match last_listen {
            Some(query) => self.source.unlisten(&query).await,
            None => Ok(()),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.state().online_state
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let listeners = {
                let mut state = self.state();
                match state.queries.get_mut(&snapshot.query.canonical_id()) {
                    Some(info) => {
                        info.view_snapshot = Some(snapshot.clone());
                        info.listeners.clone()
                    }
                    None => Vec::new(),
                }
            };
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.state().queries.remove(&query.canonical_id());
        if let Some(info) = removed {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::{
        Document, DocumentKey, DocumentKeySet, DocumentSet, FieldPath, ResourcePath,
        SnapshotVersion,
    };
    use crate::firestore::value::ObjectValue;

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<FirestoreError>>,
    }

    impl SnapshotObserver for Recorder {
        fn on_next(&self, snapshot: ViewSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot);
        }

        fn on_error(&self, error: FirestoreError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    #[derive(Default)]
    struct FakeSource {
        listens: Mutex<Vec<String>>,
        unlistens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ListenSource for FakeSource {
        async fn listen(&self, query: Query) -> FirestoreResult<TargetId> {
            let mut listens = self.listens.lock().unwrap();
            listens.push(query.canonical_id());
            Ok(listens.len() as TargetId * 2)
        }

        async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
            self.unlistens.lock().unwrap().push(query.canonical_id());
            Ok(())
        }
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn snapshot(from_cache: bool, docs: &[&str], sync_state_changed: bool) -> ViewSnapshot {
        let query = rooms();
        let mut set = DocumentSet::new(query.comparator());
        let mut changes = Vec::new();
        for path in docs {
            let mut data = ObjectValue::empty();
            data.set(&FieldPath::from_single("n"), 1i64.into());
            let doc = Document::synced(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::from_micros(1),
                data,
            );
            set = set.add(doc.clone());
            changes.push(DocumentViewChange {
                change_type: ChangeType::Added,
                doc,
            });
        }
        ViewSnapshot {
            old_docs: DocumentSet::new(query.comparator()),
            query,
            docs: set,
            doc_changes: changes,
            mutated_keys: DocumentKeySet::default(),
            from_cache,
            sync_state_changed,
            excludes_metadata_changes: false,
        }
    }

    #[tokio::test]
    async fn listeners_share_one_listen() {
        let source = Arc::new(FakeSource::default());
        let manager = EventManager::new(source.clone());
        let first_observer = Arc::new(Recorder::default());
        let second_observer = Arc::new(Recorder::default());
        let first = QueryListener::new(rooms(), ListenOptions::default(), first_observer.clone());
        let second = QueryListener::new(rooms(), ListenOptions::default(), second_observer.clone());

        assert_eq!(manager.listen(Arc::clone(&first)).await.unwrap(), Some(2));
        manager.on_watch_change(vec![snapshot(false, &["rooms/a"], true)]);
        assert_eq!(manager.listen(Arc::clone(&second)).await.unwrap(), Some(2));

        assert_eq!(source.listens.lock().unwrap().len(), 1);
        assert_eq!(first_observer.snapshots.lock().unwrap().len(), 1);
        assert_eq!(second_observer.snapshots.lock().unwrap().len(), 1);

        manager.unlisten(&first).await.unwrap();
        assert!(source.unlistens.lock().unwrap().is_empty());
        manager.unlisten(&second).await.unwrap();
        assert_eq!(source.unlistens.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_cached_snapshot_waits_until_offline() {
        let manager = EventManager::new(Arc::new(FakeSource::default()));
        let observer = Arc::new(Recorder::default());
        let listener = QueryListener::new(rooms(), ListenOptions::default(), observer.clone());
        manager.listen(listener).await.unwrap();

        manager.on_watch_change(vec![snapshot(true, &[], true)]);
        assert!(observer.snapshots.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        let snapshots = observer.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache);
    }

    #[tokio::test]
    async fn wait_for_sync_holds_back_cached_documents() {
        let manager = EventManager::new(Arc::new(FakeSource::default()));
        let observer = Arc::new(Recorder::default());
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..Default::default()
        };
        let listener = QueryListener::new(rooms(), options, observer.clone());
        manager.listen(listener).await.unwrap();
        manager.on_online_state_change(OnlineState::Online);

        manager.on_watch_change(vec![snapshot(true, &["rooms/a"], true)]);
        assert!(observer.snapshots.lock().unwrap().is_empty());
        manager.on_watch_change(vec![snapshot(false, &["rooms/b"], true)]);
        assert_eq!(observer.snapshots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metadata_only_changes_need_opt_in() {
        let manager = EventManager::new(Arc::new(FakeSource::default()));
        let plain = Arc::new(Recorder::default());
        let with_metadata = Arc::new(Recorder::default());
        manager
            .listen(QueryListener::new(rooms(), ListenOptions::default(), plain.clone()))
            .await
            .unwrap();
        let options = ListenOptions {
            include_metadata_changes: true,
            ..Default::default()
        };
        manager
            .listen(QueryListener::new(rooms(), options, with_metadata.clone()))
            .await
            .unwrap();

        manager.on_watch_change(vec![snapshot(true, &["rooms/a"], true)]);
        manager.on_watch_change(vec![snapshot(false, &[], true)]);

        assert_eq!(plain.snapshots.lock().unwrap().len(), 1);
        let seen = with_metadata.snapshots.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[1].from_cache);
    }

    #[tokio::test]
    async fn watch_error_detaches_listeners() {
        let source = Arc::new(FakeSource::default());
        let manager = EventManager::new(source.clone());
        let observer = Arc::new(Recorder::default());
        let listener = QueryListener::new(rooms(), ListenOptions::default(), observer.clone());
        manager.listen(Arc::clone(&listener)).await.unwrap();

        manager.on_watch_error(&rooms(), permission_denied("denied"));
        manager.on_watch_change(vec![snapshot(false, &["rooms/a"], true)]);

        assert_eq!(observer.errors.lock().unwrap().len(), 1);
        assert!(observer.snapshots.lock().unwrap().is_empty());
        manager.unlisten(&listener).await.unwrap();
        assert!(source.unlistens.lock().unwrap().is_empty());
    }
}
