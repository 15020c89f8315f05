use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion, TargetId};
use crate::firestore::remote::datastore::{Datastore, StreamHandle, RPC_LISTEN, RPC_WRITE};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{decode_snapshot_version, decode_watch_change, WatchChange};
use crate::firestore::value::BytesValue;
use crate::platform::runtime;
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

const LOG_TAG: &str = "PersistentStream";

/// How long an open stream without outstanding work stays open.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Starting
///                          \------------> Initial (stop, idle)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    /// Never started, or stopped by the client. `start()` connects right away.
    Initial,
    /// Fetching a token and opening the channel.
    Starting,
    Open,
    /// Closed by an error. The next `start()` waits for the backoff first.
    Error,
    /// Waiting for the backoff timer before restarting.
    Backoff,
}

/// Per-RPC behaviour plugged into a [`PersistentStream`].
#[async_trait]
pub trait StreamDelegate: Send + Sync + 'static {
    const RPC: &'static str;
    const IDLE_TIMER: TimerId;
    const BACKOFF_TIMER: TimerId;

    /// Called synchronously before a new channel is opened.
    fn on_start(&self) {}

    async fn on_open(&self) -> FirestoreResult<()>;

    /// Whether `message` proves the backend healthy enough to reset the
    /// backoff.
    fn resets_backoff(&self, _message: &JsonValue) -> bool {
        true
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;

    /// `error` is `None` when the client closed the stream.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamState {
    state: PersistentStreamState,
    /// Bumped on every close so callbacks of an earlier channel are dropped.
    close_count: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedOperation>,
}

/// A long-lived bidirectional RPC that reconnects with exponential backoff.
///
/// Every method must be called from an operation running on the queue the
/// stream was created with. Inbound messages and channel events are
/// re-dispatched onto that queue and dropped once the channel they belong to
/// has been closed.
pub struct PersistentStream<D: StreamDelegate> {
    queue: AsyncQueue,
    datastore: Arc<Datastore>,
    delegate: D,
    state: Mutex<StreamState>,
    backoff: Mutex<ExponentialBackoff>,
}

impl<D: StreamDelegate> PersistentStream<D> {
    pub fn new(queue: AsyncQueue, datastore: Arc<Datastore>, delegate: D) -> Arc<Self> {
        let backoff = ExponentialBackoff::new(queue.clone(), D::BACKOFF_TIMER);
        Arc::new(Self {
            queue,
            datastore,
            delegate,
            state: Mutex::new(StreamState {
                state: PersistentStreamState::Initial,
                close_count: 0,
                handle: None,
                idle_timer: None,
            }),
            backoff: Mutex::new(backoff),
        })
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock_state().state
    }

    /// True from `start()` until the stream is closed, including while it
    /// waits for its backoff.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Backoff
                | PersistentStreamState::Open
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    /// Starts the stream. After an error the restart is delayed by the
    /// backoff; otherwise the channel is opened immediately.
    pub fn start(self: &Arc<Self>) {
        if self.state() == PersistentStreamState::Error {
            self.perform_backoff();
            return;
        }
        hard_assert(
            self.state() == PersistentStreamState::Initial,
            "Stream is already started",
        );
        self.delegate.on_start();

        let close_count = {
            let mut state = self.lock_state();
            state.state = PersistentStreamState::Starting;
            state.close_count
        };

        let weak = Arc::downgrade(self);
        runtime::spawn_detached(async move {
            let Some(stream) = weak.upgrade() else {
                return;
            };
            let result = stream.datastore.open_stream(D::RPC).await;
            let queue = stream.queue.clone();
            drop(stream);

            queue.enqueue_and_forget(move || async move {
                let Some(stream) = weak.upgrade() else {
                    return;
                };
                if !stream.is_current(close_count) {
                    if let Ok(handle) = result {
                        handle.close().await;
                    }
                    return;
                }
                match result {
                    Ok(handle) => stream.on_channel_open(handle, close_count).await,
                    Err(err) => stream.handle_stream_close(Some(err)).await,
                }
            });
        });
    }

    /// Closes the stream without error. The next `start()` connects
    /// immediately.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    /// Lets a stream that failed restart without waiting for the backoff.
    pub fn inhibit_backoff(&self) {
        hard_assert(
            !self.is_started(),
            "Can only inhibit backoff in a stopped state",
        );
        self.lock_state().state = PersistentStreamState::Initial;
        self.lock_backoff().reset();
    }

    /// Schedules the stream to close after [`IDLE_TIMEOUT`] unless more work
    /// is sent first.
    pub fn mark_idle(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.state != PersistentStreamState::Open || state.idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        state.idle_timer = Some(self.queue.enqueue_after_delay(
            D::IDLE_TIMER,
            IDLE_TIMEOUT,
            move || async move {
                if let Some(stream) = weak.upgrade() {
                    stream.handle_idle_close_timer().await;
                }
            },
        ));
    }

    /// Sends `message` on the open channel. Send failures surface through the
    /// channel's close event.
    pub async fn send(&self, message: JsonValue) {
        let handle = {
            let mut state = self.lock_state();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.handle.clone()
        };
        match handle {
            Some(handle) => {
                if let Err(err) = handle.send(message).await {
                    log::debug!("{LOG_TAG}: {} send failed: {err}", D::RPC);
                }
            }
            None => log::debug!("{LOG_TAG}: {} dropping message, no open channel", D::RPC),
        }
    }

    fn is_current(&self, close_count: u64) -> bool {
        self.lock_state().close_count == close_count
    }

    async fn on_channel_open(self: &Arc<Self>, handle: Arc<dyn StreamHandle>, close_count: u64) {
        {
            let mut state = self.lock_state();
            state.state = PersistentStreamState::Open;
            state.handle = Some(Arc::clone(&handle));
        }
        log::debug!("{LOG_TAG}: {} stream open", D::RPC);
        self.spawn_reader(handle, close_count);
        if let Err(err) = self.delegate.on_open().await {
            log::warn!("{LOG_TAG}: {} open callback failed: {err}", D::RPC);
        }
    }

    fn spawn_reader(self: &Arc<Self>, handle: Arc<dyn StreamHandle>, close_count: u64) {
        let weak = Arc::downgrade(self);
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            loop {
                let next = handle.next().await;
                if weak.strong_count() == 0 {
                    break;
                }
                let (event, done) = match next {
                    Some(Ok(message)) => (Ok(message), false),
                    Some(Err(err)) => (Err(err), true),
                    None => (Err(unavailable("Stream closed by the backend")), true),
                };
                let weak = weak.clone();
                queue.enqueue_and_forget(move || async move {
                    let Some(stream) = weak.upgrade() else {
                        return;
                    };
                    if !stream.is_current(close_count) {
                        return;
                    }
                    match event {
                        Ok(message) => stream.handle_message(message).await,
                        Err(err) => stream.handle_stream_close(Some(err)).await,
                    }
                });
                if done {
                    break;
                }
            }
        });
    }

    async fn handle_message(&self, message: JsonValue) {
        if self.delegate.resets_backoff(&message) {
            self.lock_backoff().reset();
        }
        if let Err(err) = self.delegate.on_message(message).await {
            log::warn!("{LOG_TAG}: {} failed to handle message: {err}", D::RPC);
            self.close(PersistentStreamState::Error, Some(err)).await;
        }
    }

    async fn handle_stream_close(&self, error: Option<FirestoreError>) {
        hard_assert(self.is_started(), "Can't handle server close on a stopped stream");
        if let Some(err) = &error {
            log::debug!("{LOG_TAG}: {} stream closed with error: {err}", D::RPC);
        }
        self.close(PersistentStreamState::Error, error).await;
    }

    async fn handle_idle_close_timer(&self) {
        if self.is_open() {
            log::debug!("{LOG_TAG}: {} stream idle, closing", D::RPC);
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    fn perform_backoff(self: &Arc<Self>) {
        self.lock_state().state = PersistentStreamState::Backoff;
        let weak = Arc::downgrade(self);
        self.lock_backoff().backoff_and_run(move || async move {
            if let Some(stream) = weak.upgrade() {
                if stream.state() == PersistentStreamState::Backoff {
                    stream.lock_state().state = PersistentStreamState::Initial;
                    stream.start();
                }
            }
        });
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        let handle = {
            let mut state = self.lock_state();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.close_count += 1;
            state.state = final_state;
            state.handle.take()
        };

        {
            let mut backoff = self.lock_backoff();
            backoff.cancel();
            if final_state != PersistentStreamState::Error {
                backoff.reset();
            } else if let Some(err) = &error {
                match err.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::debug!("{LOG_TAG}: {} using maximum backoff delay", D::RPC);
                        backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated => {
                        self.datastore.credentials().invalidate_token();
                    }
                    _ => {}
                }
            }
        }

        if let Some(handle) = handle {
            handle.close().await;
        }

        if let Err(err) = self.delegate.on_close(error).await {
            log::warn!("{LOG_TAG}: {} close callback failed: {err}", D::RPC);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_backoff(&self) -> MutexGuard<'_, ExponentialBackoff> {
        self.backoff.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Callbacks of the watch stream.
#[async_trait]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is the global snapshot the change completes, or the
    /// minimum version when the change does not complete one.
    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

pub struct WatchStreamDelegate {
    serializer: JsonProtoSerializer,
    listener: Arc<dyn WatchStreamListener>,
}

#[async_trait]
impl StreamDelegate for WatchStreamDelegate {
    const RPC: &'static str = RPC_LISTEN;
    const IDLE_TIMER: TimerId = TimerId::ListenStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::ListenStreamConnectionBackoff;

    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_watch_stream_open().await
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let change = decode_watch_change(&self.serializer, &message)?;
        let snapshot_version = decode_snapshot_version(&self.serializer, &message)?;
        self.listener.on_watch_change(change, snapshot_version).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_watch_stream_close(error).await
    }
}

/// The `Listen` stream: adds and removes targets and reports watch changes.
pub type WatchStream = PersistentStream<WatchStreamDelegate>;

impl PersistentStream<WatchStreamDelegate> {
    pub fn with_listener(
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        listener: Arc<dyn WatchStreamListener>,
    ) -> Arc<Self> {
        let serializer = datastore.serializer().clone();
        Self::new(queue, datastore, WatchStreamDelegate { serializer, listener })
    }

    /// Asks the backend to start sending changes for `target_data`.
    pub async fn watch(&self, target_data: &TargetData) {
        let request = json!({
            "database": self.delegate.serializer.database_name(),
            "addTarget": self.delegate.serializer.encode_target(target_data),
        });
        self.send(request).await;
    }

    pub async fn unwatch(&self, target_id: TargetId) {
        let request = json!({
            "database": self.delegate.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.send(request).await;
    }
}

/// Callbacks of the write stream.
#[async_trait]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;

    /// The handshake was acknowledged; writes may now be sent.
    async fn on_write_handshake_complete(&self) -> FirestoreResult<()>;

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: BytesValue,
}

pub struct WriteStreamDelegate {
    serializer: JsonProtoSerializer,
    listener: Arc<dyn WriteStreamListener>,
    state: Mutex<WriteStreamState>,
}

impl WriteStreamDelegate {
    fn lock(&self) -> MutexGuard<'_, WriteStreamState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[async_trait]
impl StreamDelegate for WriteStreamDelegate {
    const RPC: &'static str = RPC_WRITE;
    const IDLE_TIMER: TimerId = TimerId::WriteStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::WriteStreamConnectionBackoff;

    fn on_start(&self) {
        self.lock().handshake_complete = false;
    }

    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_write_stream_open().await
    }

    /// The handshake reply alone does not reset the backoff; only write
    /// results do.
    fn resets_backoff(&self, _message: &JsonValue) -> bool {
        self.lock().handshake_complete
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let stream_token = self.serializer.decode_bytes(message.get("streamToken"))?;
        let was_handshake = {
            let mut state = self.lock();
            state.last_stream_token = stream_token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };

        if was_handshake {
            let has_results = message
                .get("writeResults")
                .and_then(JsonValue::as_array)
                .is_some_and(|results| !results.is_empty());
            hard_assert(!has_results, "Got mutation results for the write handshake");
            return self.listener.on_write_handshake_complete().await;
        }

        let commit_version = self.serializer.decode_version(message.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(message.get("writeResults"), commit_version)?;
        self.listener.on_mutation_result(commit_version, results).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_write_stream_close(error).await
    }
}

/// The `Write` stream: a handshake followed by ordered mutation batches.
pub type WriteStream = PersistentStream<WriteStreamDelegate>;

impl PersistentStream<WriteStreamDelegate> {
    pub fn with_listener(
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        listener: Arc<dyn WriteStreamListener>,
    ) -> Arc<Self> {
        let serializer = datastore.serializer().clone();
        Self::new(
            queue,
            datastore,
            WriteStreamDelegate {
                serializer,
                listener,
                state: Mutex::new(WriteStreamState::default()),
            },
        )
    }

    pub fn handshake_complete(&self) -> bool {
        self.delegate.lock().handshake_complete
    }

    /// Token the backend returned with its last response. Empty before the
    /// first handshake.
    pub fn last_stream_token(&self) -> BytesValue {
        self.delegate.lock().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: BytesValue) {
        self.delegate.lock().last_stream_token = token;
    }

    /// First request on a new channel. Writes may only follow once the
    /// handshake response arrived.
    pub async fn write_handshake(&self) {
        hard_assert(self.is_open(), "Writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete(), "Handshake already completed");
        let mut request = json!({ "database": self.delegate.serializer.database_name() });
        let token = self.last_stream_token();
        if !token.is_empty() {
            request["streamToken"] = self.delegate.serializer.encode_bytes(&token);
        }
        self.send(request).await;
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) {
        hard_assert(self.is_open(), "Writing mutations requires an opened stream");
        hard_assert(
            self.handshake_complete(),
            "Handshake must be complete before writing mutations",
        );
        let serializer = &self.delegate.serializer;
        let request = json!({
            "streamToken": serializer.encode_bytes(&self.last_stream_token()),
            "writes": mutations
                .iter()
                .map(|mutation| serializer.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        });
        self.send(request).await;
    }
}
