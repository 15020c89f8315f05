//! State shared between clients that use the same persistence key: pending
//! batches, target states, each client's active targets, the online state
//! of the primary and the latest LRU sequence number.
//!
//! [`WebStorageSharedClientState`] keeps that state as JSON entries in a
//! [`WebStorageArea`] and reacts to the entries other clients write.
//! [`MemorySharedClientState`] is the single-client stand-in.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::core::types::{ClientId, MutationBatchState, OnlineState, QueryTargetState};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::web_storage::{StorageEvent, StorageHandle, WebStorageArea};
use crate::firestore::model::{BatchId, ListenSequenceNumber, TargetId};
use crate::firestore::remote::credentials::User;
use crate::util::async_queue::AsyncQueue;
use crate::util::hard_assert;

const LOG_TAG: &str = "SharedClientState";

const CLIENT_STATE_KEY_PREFIX: &str = "firestore_clients";
const MUTATION_BATCH_KEY_PREFIX: &str = "firestore_mutations";
const QUERY_TARGET_KEY_PREFIX: &str = "firestore_targets";
const ONLINE_STATE_KEY_PREFIX: &str = "firestore_online_state";
const SEQUENCE_NUMBER_KEY_PREFIX: &str = "firestore_sequence_number";

/// Callbacks into the sync engine for changes other clients made.
#[async_trait]
pub trait SharedClientStateSyncer: Send + Sync {
    /// A batch changed state in another client.
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    /// The primary reported a new state for a target.
    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    /// Targets that became active or inactive across all clients.
    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>>;
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;
pub type SequenceNumberHandler = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

#[async_trait]
pub trait SharedClientState: Send + Sync {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);
    fn set_online_state_handler(&self, handler: OnlineStateHandler);
    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler);

    /// Publishes a batch this client queued.
    fn add_pending_mutation(&self, batch_id: BatchId);

    /// Publishes the outcome of a batch. `error` is set only for rejections.
    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    );

    /// Marks a target as listened to by this client and returns the state
    /// other clients reported for it.
    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState;
    fn remove_local_query_target(&self, target_id: TargetId);
    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    );
    fn clear_query_state(&self, target_id: TargetId);

    /// Targets any client listens to.
    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    async fn start(&self) -> FirestoreResult<()>;
    fn shutdown(&self);

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);
    fn set_online_state(&self, online_state: OnlineState);
    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber);
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct ErrorSchema {
    code: String,
    message: String,
}

impl ErrorSchema {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code.name().to_string(),
            message: error.message().to_string(),
        }
    }

    fn to_error(&self) -> Option<FirestoreError> {
        FirestoreErrorCode::from_name(&self.code)
            .map(|code| FirestoreError::new(code, self.message.clone()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationMetadataSchema {
    state: MutationBatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorSchema>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryTargetStateSchema {
    state: QueryTargetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorSchema>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStateSchema {
    active_target_ids: Vec<TargetId>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedOnlineStateSchema {
    client_id: ClientId,
    online_state: OnlineState,
}

/// A batch state read back from storage.
#[derive(Clone, Debug, PartialEq)]
struct MutationMetadata {
    user: User,
    batch_id: BatchId,
    state: MutationBatchState,
    error: Option<FirestoreError>,
}

/// A target state read back from storage.
#[derive(Clone, Debug, PartialEq)]
struct QueryTargetMetadata {
    target_id: TargetId,
    state: QueryTargetState,
    error: Option<FirestoreError>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parses a stored batch or target state. The error must be present
/// exactly when the state is a rejection.
fn parse_state_with_error<S, T>(
    value: &str,
    kind: &str,
    id: i32,
    rejected: fn(&S) -> bool,
    split: fn(T) -> (S, Option<ErrorSchema>),
) -> Option<(S, Option<FirestoreError>)>
where
    T: for<'de> Deserialize<'de>,
{
    let parsed = serde_json::from_str::<T>(value).ok().and_then(|schema| {
        let (state, error) = split(schema);
        let error = match error {
            Some(error) => Some(error.to_error()?),
            None => None,
        };
        (error.is_some() == rejected(&state)).then_some((state, error))
    });
    if parsed.is_none() {
        log::error!("{LOG_TAG}: failed to parse {kind} state for ID '{id}': {value}");
    }
    parsed
}

fn mutation_metadata_json(state: MutationBatchState, error: Option<&FirestoreError>) -> String {
    hard_assert(
        error.is_some() == (state == MutationBatchState::Rejected),
        "MutationMetadata must contain an error iff state is 'rejected'",
    );
    let schema = MutationMetadataSchema {
        state,
        error: error.map(ErrorSchema::from_error),
        update_time_ms: now_ms(),
    };
    serde_json::to_string(&schema).unwrap_or_default()
}

fn query_target_json(state: QueryTargetState, error: Option<&FirestoreError>) -> String {
    hard_assert(
        error.is_some() == (state == QueryTargetState::Rejected),
        "QueryTargetMetadata must contain an error iff state is 'rejected'",
    );
    let schema = QueryTargetStateSchema {
        state,
        error: error.map(ErrorSchema::from_error),
        update_time_ms: now_ms(),
    };
    serde_json::to_string(&schema).unwrap_or_default()
}

fn client_state_json(active_target_ids: &BTreeSet<TargetId>) -> String {
    let schema = ClientStateSchema {
        active_target_ids: active_target_ids.iter().copied().collect(),
        update_time_ms: now_ms(),
    };
    serde_json::to_string(&schema).unwrap_or_default()
}

/// Storage keys of one persistence key.
#[derive(Clone, Debug)]
struct StorageKeys {
    persistence_key: String,
}

impl StorageKeys {
    fn client_state(&self, client_id: &str) -> String {
        hard_assert(
            !client_id.contains('_'),
            format!("Client key cannot contain '_', but was '{client_id}'"),
        );
        format!("{CLIENT_STATE_KEY_PREFIX}_{}_{client_id}", self.persistence_key)
    }

    fn mutation_batch(&self, batch_id: BatchId, user: &User) -> String {
        match user.uid() {
            Some(uid) => format!(
                "{MUTATION_BATCH_KEY_PREFIX}_{}_{batch_id}_{uid}",
                self.persistence_key
            ),
            None => format!("{MUTATION_BATCH_KEY_PREFIX}_{}_{batch_id}", self.persistence_key),
        }
    }

    fn query_target(&self, target_id: TargetId) -> String {
        format!("{QUERY_TARGET_KEY_PREFIX}_{}_{target_id}", self.persistence_key)
    }

    fn online_state(&self) -> String {
        format!("{ONLINE_STATE_KEY_PREFIX}_{}", self.persistence_key)
    }

    fn sequence_number(&self) -> String {
        format!("{SEQUENCE_NUMBER_KEY_PREFIX}_{}", self.persistence_key)
    }

    fn strip<'k>(&self, prefix: &str, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(prefix)?
            .strip_prefix('_')?
            .strip_prefix(self.persistence_key.as_str())?
            .strip_prefix('_')
    }

    fn parse_client_state(&self, key: &str) -> Option<ClientId> {
        self.strip(CLIENT_STATE_KEY_PREFIX, key)
            .filter(|client_id| !client_id.contains('_'))
            .map(str::to_string)
    }

    /// Batch id and user of a mutation key.
    fn parse_mutation_batch(&self, key: &str) -> Option<(BatchId, User)> {
        let rest = self.strip(MUTATION_BATCH_KEY_PREFIX, key)?;
        let (batch_id, uid) = match rest.split_once('_') {
            Some((batch_id, uid)) => (batch_id, Some(uid)),
            None => (rest, None),
        };
        if batch_id.is_empty() || !batch_id.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let user = match uid {
            Some(uid) => User::new(uid),
            None => User::unauthenticated(),
        };
        Some((batch_id.parse().ok()?, user))
    }

    fn parse_query_target(&self, key: &str) -> Option<TargetId> {
        let rest = self.strip(QUERY_TARGET_KEY_PREFIX, key)?;
        if rest.is_empty() || !rest.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }
}

struct WebStorageState {
    started: bool,
    current_user: User,
    /// Active targets per client, this one included.
    active_clients: BTreeMap<ClientId, BTreeSet<TargetId>>,
    early_events: Vec<StorageEvent>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    online_state_handler: Option<OnlineStateHandler>,
    sequence_number_handler: Option<SequenceNumberHandler>,
}

/// Shared client state kept in a [`WebStorageArea`].
pub struct WebStorageSharedClientState {
    queue: AsyncQueue,
    storage: Arc<WebStorageArea>,
    handle: StorageHandle,
    keys: StorageKeys,
    local_client_id: ClientId,
    local_client_storage_key: String,
    state: Mutex<WebStorageState>,
}

impl std::fmt::Debug for WebStorageSharedClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebStorageSharedClientState")
            .field("client_id", &self.local_client_id)
            .finish_non_exhaustive()
    }
}

impl WebStorageSharedClientState {
    pub fn new(
        queue: AsyncQueue,
        storage: Arc<WebStorageArea>,
        persistence_key: &str,
        local_client_id: ClientId,
        initial_user: User,
    ) -> Arc<Self> {
        let keys = StorageKeys {
            persistence_key: persistence_key.to_string(),
        };
        let local_client_storage_key = keys.client_state(&local_client_id);
        let handle = storage.attach();
        let mut active_clients = BTreeMap::new();
        active_clients.insert(local_client_id.clone(), BTreeSet::new());

        let client = Arc::new(Self {
            queue,
            storage,
            handle,
            keys,
            local_client_id,
            local_client_storage_key,
            state: Mutex::new(WebStorageState {
                started: false,
                current_user: initial_user,
                active_clients,
                early_events: Vec::new(),
                syncer: None,
                online_state_handler: None,
                sequence_number_handler: None,
            }),
        });

        let weak = Arc::downgrade(&client);
        client.storage.add_listener(
            handle,
            Arc::new(move |event| {
                if let Some(client) = weak.upgrade() {
                    client.handle_web_storage_event(event);
                }
            }),
        );
        client
    }

    fn state(&self) -> MutexGuard<'_, WebStorageState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_item(&self, key: &str) -> Option<String> {
        let value = self.storage.get_item(key);
        log::debug!("{LOG_TAG}: READ {key} {value:?}");
        value
    }

    fn set_item(&self, key: &str, value: &str) {
        log::debug!("{LOG_TAG}: SET {key} {value}");
        self.storage.set_item(self.handle, key, value);
    }

    fn remove_item(&self, key: &str) {
        log::debug!("{LOG_TAG}: REMOVE {key}");
        self.storage.remove_item(self.handle, key);
    }

    fn syncer(&self) -> Option<Arc<dyn SharedClientStateSyncer>> {
        self.state().syncer.as_ref().and_then(Weak::upgrade)
    }

    fn persist_client_state(&self) {
        let json = {
            let state = self.state();
            let empty = BTreeSet::new();
            let local = state
                .active_clients
                .get(&self.local_client_id)
                .unwrap_or(&empty);
            client_state_json(local)
        };
        self.set_item(&self.local_client_storage_key, &json);
    }

    fn persist_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) {
        let user = self.state().current_user.clone();
        let key = self.keys.mutation_batch(batch_id, &user);
        self.set_item(&key, &mutation_metadata_json(state, error));
    }

    fn remove_mutation_state(&self, batch_id: BatchId) {
        let user = self.state().current_user.clone();
        self.remove_item(&self.keys.mutation_batch(batch_id, &user));
    }

    fn read_client_state(&self, value: &str, client_id: &str) -> Option<BTreeSet<TargetId>> {
        match serde_json::from_str::<ClientStateSchema>(value) {
            Ok(schema) => Some(schema.active_target_ids.into_iter().collect()),
            Err(_) => {
                log::error!("{LOG_TAG}: failed to parse client data for instance '{client_id}': {value}");
                None
            }
        }
    }

    fn read_online_state(&self, value: &str) -> Option<SharedOnlineStateSchema> {
        let parsed = serde_json::from_str::<SharedOnlineStateSchema>(value).ok();
        if parsed.is_none() {
            log::error!("{LOG_TAG}: failed to parse online state: {value}");
        }
        parsed
    }

    fn handle_web_storage_event(self: &Arc<Self>, event: StorageEvent) {
        log::debug!("{LOG_TAG}: EVENT {} {:?}", event.key, event.new_value);
        if event.key == self.local_client_storage_key {
            log::error!(
                "{LOG_TAG}: received storage notification for local change. Another client might have garbage-collected our state"
            );
            return;
        }
        let weak = Arc::downgrade(self);
        self.queue.enqueue_and_forget(move || async move {
            if let Some(client) = weak.upgrade() {
                client.process_event(event).await;
            }
        });
    }

    async fn process_event(&self, event: StorageEvent) {
        {
            let mut state = self.state();
            if !state.started {
                state.early_events.push(event);
                return;
            }
        }
        let result = self.dispatch_event(event).await;
        if let Err(err) = result {
            log::error!("{LOG_TAG}: failed to apply change from another client: {err}");
        }
    }

    async fn dispatch_event(&self, event: StorageEvent) -> FirestoreResult<()> {
        let key = event.key.as_str();
        if let Some(client_id) = self.keys.parse_client_state(key) {
            return match event.new_value {
                Some(value) => match self.read_client_state(&value, &client_id) {
                    Some(targets) => self.handle_client_state_event(client_id, Some(targets)).await,
                    None => Ok(()),
                },
                None => self.handle_client_state_event(client_id, None).await,
            };
        }
        if let Some((batch_id, user)) = self.keys.parse_mutation_batch(key) {
            let Some(value) = event.new_value else {
                return Ok(());
            };
            let Some((state, error)) = parse_state_with_error(
                &value,
                "mutation",
                batch_id,
                |state: &MutationBatchState| *state == MutationBatchState::Rejected,
                |schema: MutationMetadataSchema| (schema.state, schema.error),
            ) else {
                return Ok(());
            };
            return self
                .handle_mutation_batch_event(MutationMetadata {
                    user,
                    batch_id,
                    state,
                    error,
                })
                .await;
        }
        if let Some(target_id) = self.keys.parse_query_target(key) {
            let Some(value) = event.new_value else {
                return Ok(());
            };
            let Some((state, error)) = parse_state_with_error(
                &value,
                "target",
                target_id,
                |state: &QueryTargetState| *state == QueryTargetState::Rejected,
                |schema: QueryTargetStateSchema| (schema.state, schema.error),
            ) else {
                return Ok(());
            };
            return self
                .handle_query_target_event(QueryTargetMetadata {
                    target_id,
                    state,
                    error,
                })
                .await;
        }
        if key == self.keys.online_state() {
            if let Some(online_state) = event.new_value.as_deref().and_then(|value| self.read_online_state(value)) {
                self.handle_online_state_event(online_state);
            }
            return Ok(());
        }
        if key == self.keys.sequence_number() {
            let handler = self.state().sequence_number_handler.clone();
            hard_assert(handler.is_some(), "Missing sequence number handler");
            if let Some(sequence_number) = event.new_value.as_deref().and_then(parse_sequence_number) {
                if let Some(handler) = handler {
                    handler(sequence_number);
                }
            }
        }
        Ok(())
    }

    async fn handle_mutation_batch_event(&self, metadata: MutationMetadata) -> FirestoreResult<()> {
        let current_user = self.state().current_user.clone();
        if metadata.user != current_user {
            log::debug!(
                "{LOG_TAG}: ignoring mutation for non-active user {:?}",
                metadata.user.uid()
            );
            return Ok(());
        }
        match self.syncer() {
            Some(syncer) => {
                syncer
                    .apply_batch_state(metadata.batch_id, metadata.state, metadata.error)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn handle_query_target_event(&self, metadata: QueryTargetMetadata) -> FirestoreResult<()> {
        match self.syncer() {
            Some(syncer) => {
                syncer
                    .apply_target_state(metadata.target_id, metadata.state, metadata.error)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn handle_client_state_event(
        &self,
        client_id: ClientId,
        client_state: Option<BTreeSet<TargetId>>,
    ) -> FirestoreResult<()> {
        let (added, removed) = {
            let mut state = self.state();
            let existing = all_targets(&state.active_clients);
            match client_state {
                Some(targets) => {
                    state.active_clients.insert(client_id, targets);
                }
                None => {
                    state.active_clients.remove(&client_id);
                }
            }
            let updated = all_targets(&state.active_clients);
            (
                updated.difference(&existing).copied().collect::<Vec<_>>(),
                existing.difference(&updated).copied().collect::<Vec<_>>(),
            )
        };
        match self.syncer() {
            Some(syncer) => syncer.apply_active_targets_change(added, removed).await,
            None => Ok(()),
        }
    }

    /// Only states written by a known client count; a stale entry of a
    /// client that went away is ignored.
    fn handle_online_state_event(&self, online_state: SharedOnlineStateSchema) {
        let handler = {
            let state = self.state();
            if !state.active_clients.contains_key(&online_state.client_id) {
                return;
            }
            state.online_state_handler.clone()
        };
        if let Some(handler) = handler {
            handler(online_state.online_state);
        }
    }
}

fn all_targets(active_clients: &BTreeMap<ClientId, BTreeSet<TargetId>>) -> BTreeSet<TargetId> {
    active_clients.values().flatten().copied().collect()
}

fn parse_sequence_number(value: &str) -> Option<ListenSequenceNumber> {
    match serde_json::from_str::<ListenSequenceNumber>(value) {
        Ok(sequence_number) => Some(sequence_number),
        Err(err) => {
            log::error!("{LOG_TAG}: failed to read sequence number from storage: {err}");
            None
        }
    }
}

#[async_trait]
impl SharedClientState for WebStorageSharedClientState {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        self.state().syncer = Some(syncer);
    }

    fn set_online_state_handler(&self, handler: OnlineStateHandler) {
        self.state().online_state_handler = Some(handler);
    }

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler) {
        self.state().sequence_number_handler = Some(handler);
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.persist_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) {
        self.persist_mutation_state(batch_id, state, error.as_ref());
        // Other clients already saw the update; the entry is not needed
        // anymore.
        self.remove_mutation_state(batch_id);
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut query_state = QueryTargetState::NotCurrent;
        if self.is_active_query_target(target_id) {
            if let Some(value) = self.get_item(&self.keys.query_target(target_id)) {
                if let Some((state, _)) = parse_state_with_error(
                    &value,
                    "target",
                    target_id,
                    |state: &QueryTargetState| *state == QueryTargetState::Rejected,
                    |schema: QueryTargetStateSchema| (schema.state, schema.error),
                ) {
                    query_state = state;
                }
            }
        }
        {
            let mut state = self.state();
            let local = state
                .active_clients
                .entry(self.local_client_id.clone())
                .or_default();
            hard_assert(
                !local.contains(&target_id),
                format!("Target with ID '{target_id}' already active."),
            );
            local.insert(target_id);
        }
        self.persist_client_state();
        query_state
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        if let Some(local) = self.state().active_clients.get_mut(&self.local_client_id) {
            local.remove(&target_id);
        }
        self.persist_client_state();
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.state()
            .active_clients
            .get(&self.local_client_id)
            .is_some_and(|targets| targets.contains(&target_id))
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) {
        let key = self.keys.query_target(target_id);
        self.set_item(&key, &query_target_json(state, error.as_ref()));
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.remove_item(&self.keys.query_target(target_id));
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        all_targets(&self.state().active_clients)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.state()
            .active_clients
            .values()
            .any(|targets| targets.contains(&target_id))
    }

    async fn start(&self) -> FirestoreResult<()> {
        hard_assert(!self.state().started, "WebStorageSharedClientState already started");
        let syncer = self.syncer();
        hard_assert(
            syncer.is_some(),
            "syncer must be set before calling start()",
        );
        let existing_clients = match &syncer {
            Some(syncer) => syncer.get_active_clients()?,
            None => Vec::new(),
        };

        for client_id in existing_clients {
            if client_id == self.local_client_id {
                continue;
            }
            let Some(value) = self.get_item(&self.keys.client_state(&client_id)) else {
                continue;
            };
            if let Some(targets) = self.read_client_state(&value, &client_id) {
                self.state().active_clients.insert(client_id, targets);
            }
        }

        self.persist_client_state();

        if let Some(value) = self.storage.get_item(&self.keys.online_state()) {
            if let Some(online_state) = self.read_online_state(&value) {
                self.handle_online_state_event(online_state);
            }
        }

        let early_events = std::mem::take(&mut self.state().early_events);
        self.state().started = true;
        for event in early_events {
            if event.key == self.local_client_storage_key {
                continue;
            }
            if let Err(err) = self.dispatch_event(event).await {
                log::error!("{LOG_TAG}: failed to apply early change from another client: {err}");
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let was_started = std::mem::replace(&mut self.state().started, false);
        if was_started {
            self.storage.remove_listener(self.handle);
            self.remove_item(&self.local_client_storage_key);
        }
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        for batch_id in removed_batch_ids {
            self.remove_mutation_state(*batch_id);
        }
        self.state().current_user = user.clone();
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id);
        }
    }

    fn set_online_state(&self, online_state: OnlineState) {
        let entry = SharedOnlineStateSchema {
            client_id: self.local_client_id.clone(),
            online_state,
        };
        if let Ok(json) = serde_json::to_string(&entry) {
            self.set_item(&self.keys.online_state(), &json);
        }
    }

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        self.set_item(&self.keys.sequence_number(), &sequence_number.to_string());
    }
}

#[derive(Default)]
struct MemoryState {
    active_targets: BTreeSet<TargetId>,
    query_state: HashMap<TargetId, QueryTargetState>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    online_state_handler: Option<OnlineStateHandler>,
    sequence_number_handler: Option<SequenceNumberHandler>,
}

/// Shared client state of a client that shares nothing.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: Mutex<MemoryState>,
}

impl MemorySharedClientState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemorySharedClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySharedClientState")
            .field("active_targets", &self.state().active_targets)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedClientState for MemorySharedClientState {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        self.state().syncer = Some(syncer);
    }

    fn set_online_state_handler(&self, handler: OnlineStateHandler) {
        self.state().online_state_handler = Some(handler);
    }

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler) {
        self.state().sequence_number_handler = Some(handler);
    }

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(
        &self,
        _batch_id: BatchId,
        _state: MutationBatchState,
        _error: Option<FirestoreError>,
    ) {
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut state = self.state();
        hard_assert(
            !state.active_targets.contains(&target_id),
            format!("Target with ID '{target_id}' already active."),
        );
        state.active_targets.insert(target_id);
        state
            .query_state
            .get(&target_id)
            .copied()
            .unwrap_or(QueryTargetState::NotCurrent)
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.state().active_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.state().active_targets.contains(&target_id)
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        _error: Option<FirestoreError>,
    ) {
        self.state().query_state.insert(target_id, state);
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.state().query_state.remove(&target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.state().active_targets.clone()
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.state().active_targets.contains(&target_id)
    }

    async fn start(&self) -> FirestoreResult<()> {
        self.state().active_targets.clear();
        Ok(())
    }

    fn shutdown(&self) {}

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, _online_state: OnlineState) {}

    fn write_sequence_number(&self, _sequence_number: ListenSequenceNumber) {}
}
