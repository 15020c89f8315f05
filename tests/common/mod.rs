#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_sync::firestore::core::{ClientComponents, FirestoreClient, SnapshotObserver, ViewSnapshot};
use firestore_sync::firestore::local::kv_store::KvDatabase;
use firestore_sync::firestore::local::WebStorageArea;
use firestore_sync::firestore::model::{DatabaseId, TargetId};
use firestore_sync::firestore::remote::stream::AcceptedStream;
use firestore_sync::firestore::remote::{
    InMemoryTransport, MultiplexedConnection, NoopConnectivityMonitor, StreamHandle, User,
    UserCredentialsProvider,
};
use firestore_sync::firestore::{ClientSettings, FirestoreError};
use serde_json::{json, Value};

pub const DOCUMENTS_ROOT: &str = "projects/p/databases/(default)/documents";
const TIMEOUT: Duration = Duration::from_secs(5);

pub fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("{prefix}-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

pub fn settings(persistence_key: &str) -> ClientSettings {
    ClientSettings {
        persistence_key: persistence_key.to_string(),
        database_id: DatabaseId::new("p", "(default)"),
        ..ClientSettings::default()
    }
}

/// Starts a client whose backend is played by the returned [`Backend`].
pub async fn start_client(
    settings: ClientSettings,
    database: Arc<KvDatabase>,
    web_storage: Arc<WebStorageArea>,
) -> (Arc<FirestoreClient>, Backend) {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let client = FirestoreClient::start(
        settings,
        ClientComponents {
            connection: Arc::new(MultiplexedConnection::new(client_transport)),
            credentials: Arc::new(UserCredentialsProvider::new(User::new("alice"), None)),
            connectivity_monitor: Arc::new(NoopConnectivityMonitor),
            database,
            web_storage,
        },
    )
    .await
    .expect("start client");
    let backend = Backend {
        server: MultiplexedConnection::new_acceptor(server_transport),
        stashed: Vec::new(),
    };
    (client, backend)
}

pub async fn start_single_client(prefix: &str) -> (Arc<FirestoreClient>, Backend) {
    let name = unique_name(prefix);
    start_client(settings(&name), KvDatabase::new(&name), WebStorageArea::new()).await
}

/// Scripted server side of a client connection.
pub struct Backend {
    server: MultiplexedConnection,
    stashed: Vec<AcceptedStream>,
}

impl Backend {
    /// Waits for the client to open a stream for `rpc`. Streams for other
    /// RPCs that arrive first are kept for later calls.
    pub async fn stream(&mut self, rpc: &str) -> ServerStream {
        if let Some(index) = self.stashed.iter().position(|accepted| accepted.rpc == rpc) {
            return ServerStream {
                accepted: self.stashed.remove(index),
            };
        }
        loop {
            let accepted = tokio::time::timeout(TIMEOUT, self.server.accept_stream())
                .await
                .unwrap_or_else(|_| panic!("client never opened a {rpc} stream"))
                .expect("accept stream");
            if accepted.rpc == rpc {
                return ServerStream { accepted };
            }
            self.stashed.push(accepted);
        }
    }

    pub async fn watch(&mut self) -> ServerStream {
        self.stream("Listen").await
    }

    pub async fn write(&mut self) -> ServerStream {
        self.stream("Write").await
    }
}

pub struct ServerStream {
    accepted: AcceptedStream,
}

impl ServerStream {
    pub async fn request(&self) -> Value {
        tokio::time::timeout(TIMEOUT, StreamHandle::next(&self.accepted.stream))
            .await
            .expect("client request")
            .expect("stream still open")
            .expect("well-formed request")
    }

    /// Next `addTarget` request, skipping anything else.
    pub async fn add_target(&self) -> (TargetId, Value) {
        loop {
            let request = self.request().await;
            if let Some(target) = request.get("addTarget") {
                let target_id = target["targetId"].as_i64().expect("target id") as TargetId;
                return (target_id, target.clone());
            }
        }
    }

    pub async fn remove_target(&self) -> TargetId {
        loop {
            let request = self.request().await;
            if let Some(target_id) = request.get("removeTarget").and_then(Value::as_i64) {
                return target_id as TargetId;
            }
        }
    }

    pub async fn send(&self, message: Value) {
        StreamHandle::send(&self.accepted.stream, message)
            .await
            .expect("send to client");
    }

    pub async fn fail(&self, error: FirestoreError) {
        self.accepted.stream.fail(error).await;
    }

    pub async fn target_change(&self, change_type: &str, target_ids: &[TargetId]) {
        self.send(json!({
            "targetChange": { "targetChangeType": change_type, "targetIds": target_ids }
        }))
        .await;
    }

    pub async fn current(&self, target_ids: &[TargetId], resume_token: &str) {
        self.send(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": target_ids,
                "resumeToken": resume_token,
            }
        }))
        .await;
    }

    /// Global snapshot at `seconds`: raises a remote event.
    pub async fn snapshot(&self, seconds: u32) {
        self.send(json!({
            "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": timestamp(seconds) }
        }))
        .await;
    }

    pub async fn document(&self, path: &str, fields: Value, seconds: u32, target_ids: &[TargetId]) {
        self.send(json!({
            "documentChange": {
                "document": {
                    "name": document_name(path),
                    "fields": fields,
                    "updateTime": timestamp(seconds),
                },
                "targetIds": target_ids,
            }
        }))
        .await;
    }

    pub async fn delete(&self, path: &str, seconds: u32, target_ids: &[TargetId]) {
        self.send(json!({
            "documentDelete": {
                "document": document_name(path),
                "readTime": timestamp(seconds),
                "removedTargetIds": target_ids,
            }
        }))
        .await;
    }

    pub async fn existence_filter(&self, target_id: TargetId, count: i64) {
        self.send(json!({ "filter": { "targetId": target_id, "count": count } }))
            .await;
    }
}

pub fn document_name(path: &str) -> String {
    format!("{DOCUMENTS_ROOT}/{path}")
}

pub fn timestamp(seconds: u32) -> String {
    format!("1970-01-01T00:{:02}:{:02}Z", seconds / 60, seconds % 60)
}

pub fn int(value: i64) -> Value {
    json!({ "integerValue": value.to_string() })
}

/// Collects snapshots and errors of one listen.
#[derive(Default)]
pub struct Collector {
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

impl Collector {
    pub fn snapshots(&self) -> Vec<ViewSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<FirestoreError> {
        self.errors.lock().unwrap().clone()
    }

    /// Latest snapshot matching `predicate`, waiting for the client to
    /// raise it.
    pub async fn wait_for<F>(&self, client: &FirestoreClient, predicate: F) -> ViewSnapshot
    where
        F: Fn(&ViewSnapshot) -> bool,
    {
        let found = eventually(client, || self.snapshots().iter().rev().any(&predicate)).await;
        assert!(found, "no matching snapshot, got: {:#?}", self.snapshots());
        self.snapshots()
            .into_iter()
            .rev()
            .find(|snapshot| predicate(snapshot))
            .expect("matching snapshot")
    }
}

/// Polls `condition` between queue drains. Returns whether it held in time.
pub async fn eventually<F>(client: &FirestoreClient, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        client.async_queue().drain().await;
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
