use std::sync::Arc;

use crate::firestore::local::kv_store::KvDatabase;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::persistence::{Persistence, PersistenceParams};
use crate::firestore::local::web_storage::WebStorageArea;
use crate::firestore::model::{DatabaseId, Document, DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::LruParams;
use crate::firestore::value::ObjectValue;
use crate::util::async_queue::AsyncQueue;

pub fn serializer() -> LocalSerializer {
    LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")))
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

/// Synced document at `version` (in micros) holding `{n: value}`.
pub fn doc(path: &str, version: i64, value: i64) -> Document {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_single("n"), value.into());
    Document::synced(key(path), SnapshotVersion::from_micros(version), data)
}

pub async fn started_persistence(name: &str) -> Arc<Persistence> {
    started_persistence_with(name, LruParams::default()).await
}

pub async fn started_persistence_with(name: &str, lru_params: LruParams) -> Arc<Persistence> {
    let persistence = Persistence::new(
        PersistenceParams {
            persistence_key: name.into(),
            client_id: format!("{name}-client"),
            allow_tab_synchronization: false,
            lru_params,
        },
        AsyncQueue::new(),
        KvDatabase::new(name),
        WebStorageArea::new(),
        serializer(),
    );
    persistence.start().await.unwrap();
    persistence
}
