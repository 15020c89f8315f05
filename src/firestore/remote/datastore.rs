use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{
    failed_precondition, invalid_argument, unknown, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MaybeDocument, Mutation, MutationResult};
use crate::firestore::remote::credentials::{CredentialsProvider, Token};
use crate::firestore::remote::serializer::JsonProtoSerializer;

const LOG_TAG: &str = "Datastore";

pub const RPC_LISTEN: &str = "Listen";
pub const RPC_WRITE: &str = "Write";
pub const RPC_COMMIT: &str = "Commit";
pub const RPC_BATCH_GET_DOCUMENTS: &str = "BatchGetDocuments";

/// Bidirectional message stream opened by a [`Connection`].
#[async_trait]
pub trait StreamHandle: Send + Sync + 'static {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()>;

    /// Next inbound message. `None` once the server closed the stream.
    async fn next(&self) -> Option<FirestoreResult<JsonValue>>;

    async fn close(&self);
}

/// Transport to the backend.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(
        &self,
        rpc: &str,
        token: Option<&Token>,
    ) -> FirestoreResult<Arc<dyn StreamHandle>>;

    async fn invoke_rpc(
        &self,
        rpc: &str,
        token: Option<&Token>,
        request: JsonValue,
    ) -> FirestoreResult<JsonValue>;
}

/// Authenticated RPC surface the remote store talks to.
pub struct Datastore {
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    serializer: JsonProtoSerializer,
    terminated: AtomicBool,
}

impl Datastore {
    pub fn new(
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        serializer: JsonProtoSerializer,
    ) -> Self {
        Self {
            connection,
            credentials,
            serializer,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialsProvider> {
        &self.credentials
    }

    /// Opens a streaming RPC with a fresh token. A failed token fetch closes
    /// with `Unknown` so the stream retries with backoff.
    pub async fn open_stream(&self, rpc: &str) -> FirestoreResult<Arc<dyn StreamHandle>> {
        self.verify_initialized()?;
        let token = self.credentials.get_token().await.map_err(|err| {
            unknown(format!("Fetching auth token failed: {}", err.message()))
        })?;
        let result = self.connection.open_stream(rpc, token.as_ref()).await;
        self.note_result(&result);
        result
    }

    /// Commits `mutations` atomically, outside the write stream.
    pub async fn commit(&self, mutations: &[Mutation]) -> FirestoreResult<Vec<MutationResult>> {
        let request = json!({
            "database": self.serializer.database_name(),
            "writes": mutations
                .iter()
                .map(|mutation| self.serializer.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        });
        let response = self.invoke(RPC_COMMIT, request).await?;
        let commit_version = self.serializer.decode_version(response.get("commitTime"))?;
        self.serializer
            .decode_write_results(response.get("writeResults"), commit_version)
    }

    /// Reads the current backend state of `keys`, in request order.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MaybeDocument>> {
        let request = json!({
            "database": self.serializer.database_name(),
            "documents": keys
                .iter()
                .map(|key| self.serializer.document_name(key))
                .collect::<Vec<_>>(),
        });
        let response = self.invoke(RPC_BATCH_GET_DOCUMENTS, request).await?;
        let entries = response
            .as_array()
            .ok_or_else(|| invalid_argument("BatchGetDocuments response is not an array"))?;

        let mut by_key = BTreeMap::new();
        for entry in entries {
            let doc = self.serializer.decode_maybe_document(entry)?;
            by_key.insert(doc.key().clone(), doc);
        }

        keys.iter()
            .map(|key| {
                by_key.remove(key).ok_or_else(|| {
                    invalid_argument(format!("BatchGetDocuments did not return {key}"))
                })
            })
            .collect()
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    async fn invoke(&self, rpc: &str, request: JsonValue) -> FirestoreResult<JsonValue> {
        self.verify_initialized()?;
        let token = self.credentials.get_token().await?;
        log::debug!("{LOG_TAG}: invoking {rpc}");
        let result = self.connection.invoke_rpc(rpc, token.as_ref(), request).await;
        self.note_result(&result);
        result
    }

    fn note_result<T>(&self, result: &FirestoreResult<T>) {
        if let Err(err) = result {
            if err.code == FirestoreErrorCode::Unauthenticated {
                self.credentials.invalidate_token();
            }
        }
    }

    fn verify_initialized(&self) -> FirestoreResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition(
                "The client has already been terminated.",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreError;
    use crate::firestore::model::{DatabaseId, FieldPath, SnapshotVersion};
    use crate::firestore::remote::credentials::{User, UserCredentialsProvider};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    const ROOT: &str = "projects/p/databases/(default)/documents";

    fn datastore(credentials: Arc<dyn CredentialsProvider>) -> (Datastore, MultiplexedConnection) {
        let (client, server) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client));
        let server = MultiplexedConnection::new_acceptor(server);
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        (Datastore::new(connection, credentials, serializer), server)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn commit_decodes_write_results() {
        let credentials = Arc::new(UserCredentialsProvider::new(
            User::new("alice"),
            Some("token-1".into()),
        ));
        let (datastore, server) = datastore(credentials);
        let server_task = tokio::spawn(async move {
            let accepted = server.accept_stream().await.unwrap();
            assert_eq!(accepted.rpc, RPC_COMMIT);
            assert_eq!(accepted.token.as_deref(), Some("token-1"));
            let request = StreamHandle::next(&accepted.stream).await.unwrap().unwrap();
            assert_eq!(request["writes"].as_array().unwrap().len(), 1);
            StreamHandle::send(
                &accepted.stream,
                json!({ "commitTime": "1970-01-01T00:00:09Z", "writeResults": [{}] }),
            )
            .await
            .unwrap();
        });

        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single("a"), FirestoreValue::from_integer(1));
        let results = datastore
            .commit(&[Mutation::set(key("rooms/eros"), data)])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].version, SnapshotVersion::from_micros(9_000_000));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn lookup_returns_documents_in_request_order() {
        let (datastore, server) = datastore(Arc::new(EmptyCredentialsProvider));
        let server_task = tokio::spawn(async move {
            let accepted = server.accept_stream().await.unwrap();
            assert_eq!(accepted.rpc, RPC_BATCH_GET_DOCUMENTS);
            let _ = StreamHandle::next(&accepted.stream).await;
            StreamHandle::send(
                &accepted.stream,
                json!([
                    { "missing": format!("{ROOT}/rooms/b"), "readTime": "1970-01-01T00:00:02Z" },
                    { "found": {
                        "name": format!("{ROOT}/rooms/a"),
                        "fields": {},
                        "updateTime": "1970-01-01T00:00:01Z"
                    } }
                ]),
            )
            .await
            .unwrap();
        });

        let docs = datastore
            .lookup(&[key("rooms/a"), key("rooms/b")])
            .await
            .unwrap();
        assert!(docs[0].is_document());
        assert!(docs[1].is_no_document());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn terminated_datastore_rejects_calls() {
        let (datastore, _server) = datastore(Arc::new(EmptyCredentialsProvider));
        datastore.terminate();
        let err: FirestoreError = datastore.lookup(&[key("rooms/a")]).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }
}
