//! Persisted record types and the versioned schema.
//!
//! Every store holds JSON encoded records under string keys built with
//! [`super::encoded_resource_path`]. Secondary indexes are stores of their
//! own whose keys carry the indexed columns followed by the primary key.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_resource_path::{
    composite_key, decode_resource_path, encode_number, encode_resource_path, KEY_SEPARATOR,
};
use crate::firestore::local::kv_store::KvTransaction;
use crate::firestore::model::{BatchId, ListenSequenceNumber, ResourcePath, TargetId, Timestamp};

const LOG_TAG: &str = "SchemaConverter";

pub const SCHEMA_VERSION: u32 = 5;

pub const OWNER_STORE: &str = "owner";
pub const OWNER_KEY: &str = "owner";
pub const CLIENT_METADATA_STORE: &str = "clientMetadata";
pub const MUTATION_QUEUES_STORE: &str = "mutationQueues";
pub const MUTATIONS_STORE: &str = "mutations";
pub const USER_MUTATIONS_STORE: &str = "userMutations";
pub const MUTATION_GLOBAL_STORE: &str = "mutationGlobal";
pub const MUTATION_GLOBAL_KEY: &str = "mutationGlobalKey";
pub const DOCUMENT_MUTATIONS_STORE: &str = "documentMutations";
pub const REMOTE_DOCUMENTS_STORE: &str = "remoteDocuments";
pub const REMOTE_DOCUMENTS_READ_TIME_STORE: &str = "remoteDocumentsReadTime";
pub const REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE: &str = "remoteDocumentsCollectionReadTime";
pub const REMOTE_DOCUMENT_GLOBAL_STORE: &str = "remoteDocumentGlobal";
pub const REMOTE_DOCUMENT_GLOBAL_KEY: &str = "remoteDocumentGlobalKey";
pub const TARGETS_STORE: &str = "targets";
pub const TARGETS_BY_CANONICAL_ID_STORE: &str = "targetsByCanonicalId";
pub const TARGET_GLOBAL_STORE: &str = "targetGlobal";
pub const TARGET_GLOBAL_KEY: &str = "targetGlobalKey";
pub const TARGET_DOCUMENTS_STORE: &str = "targetDocuments";
pub const DOCUMENT_TARGETS_STORE: &str = "documentTargets";
pub const COLLECTION_PARENTS_STORE: &str = "collectionParents";

/// Holder of the primary lease. At most one row exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPrimaryClient {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

/// Liveness record each client refreshes periodically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

/// Per-user mutation queue state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Base64 write stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationBatch {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    #[serde(default)]
    pub base_mutations: Vec<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

/// Counter behind batch id allocation; ids are never reused.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationGlobal {
    pub highest_batch_id: BatchId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbNoDocument {
    pub read_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUnknownDocument {
    pub version: Timestamp,
}

/// Cached state of one document. Exactly one of the three variants is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_document: Option<DbUnknownDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_document: Option<DbNoDocument>,
    /// Wire encoded document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<JsonValue>,
    pub has_committed_mutations: bool,
    /// When this client wrote the entry, used for incremental query runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<Timestamp>,
    /// Encoded path of the containing collection.
    #[serde(default)]
    pub parent_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTarget {
    pub target_id: TargetId,
    pub canonical_id: String,
    pub read_time: Timestamp,
    /// Base64 resume token.
    pub resume_token: String,
    pub last_listen_sequence_number: ListenSequenceNumber,
    pub last_limbo_free_snapshot_version: Timestamp,
    /// Wire encoded `documents` or `query` target.
    pub query: JsonValue,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: Timestamp,
    pub target_count: i64,
}

/// Association between a target and a document. Rows with target id 0 are
/// sentinels that only carry the document's last-use sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetDocument {
    pub target_id: TargetId,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<ListenSequenceNumber>,
}

pub fn mutation_key(batch_id: BatchId) -> String {
    encode_number(i64::from(batch_id))
}

pub fn user_mutation_key(user_id: &str, batch_id: BatchId) -> String {
    composite_key(&[user_id, &encode_number(i64::from(batch_id))])
}

pub fn document_mutation_key(user_id: &str, encoded_path: &str, batch_id: BatchId) -> String {
    composite_key(&[user_id, encoded_path, &encode_number(i64::from(batch_id))])
}

pub fn target_key(target_id: TargetId) -> String {
    encode_number(i64::from(target_id))
}

pub fn canonical_id_key(canonical_id: &str, target_id: TargetId) -> String {
    composite_key(&[canonical_id, &encode_number(i64::from(target_id))])
}

pub fn target_document_key(target_id: TargetId, encoded_path: &str) -> String {
    composite_key(&[&encode_number(i64::from(target_id)), encoded_path])
}

pub fn document_target_key(encoded_path: &str, target_id: TargetId) -> String {
    composite_key(&[encoded_path, &encode_number(i64::from(target_id))])
}

pub fn read_time_key(read_time: Timestamp, encoded_path: &str) -> String {
    composite_key(&[&encode_number(read_time.to_micros()), encoded_path])
}

pub fn collection_read_time_key(
    parent_path: &str,
    read_time: Timestamp,
    encoded_path: &str,
) -> String {
    composite_key(&[parent_path, &encode_number(read_time.to_micros()), encoded_path])
}

pub fn collection_parent_key(collection_id: &str, encoded_parent: &str) -> String {
    composite_key(&[collection_id, encoded_parent])
}

/// Size charged against the cache for one remote document record.
pub fn document_byte_size(record: &DbRemoteDocument) -> i64 {
    serde_json::to_string(record).map_or(0, |encoded| encoded.len() as i64)
}

/// Creates and migrates the stores. Steps run in ascending order and each
/// one tolerates data already in its target shape.
pub struct SchemaConverter;

impl SchemaConverter {
    pub fn create_or_upgrade(
        txn: &mut KvTransaction<'_>,
        from_version: u32,
        to_version: u32,
    ) -> FirestoreResult<()> {
        for version in (from_version + 1)..=to_version {
            log::debug!("{LOG_TAG}: applying schema step {version}");
            match version {
                1 => Self::create_base_stores(txn)?,
                2 => Self::add_target_count(txn)?,
                3 => Self::remove_acknowledged_mutations(txn)?,
                4 => Self::add_document_size_and_sentinels(txn)?,
                5 => Self::backfill_collection_parents_and_read_times(txn)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn create_base_stores(txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        if txn
            .get::<DbTargetGlobal>(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?
            .is_none()
        {
            txn.put(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY, &DbTargetGlobal::default())?;
        }
        if txn
            .get::<DbMutationGlobal>(MUTATION_GLOBAL_STORE, MUTATION_GLOBAL_KEY)?
            .is_none()
        {
            txn.put(
                MUTATION_GLOBAL_STORE,
                MUTATION_GLOBAL_KEY,
                &DbMutationGlobal::default(),
            )?;
        }
        Ok(())
    }

    fn add_target_count(txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let count = txn.count(TARGETS_STORE) as i64;
        let mut global: DbTargetGlobal = txn
            .get(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?
            .unwrap_or_default();
        global.target_count = count;
        txn.put(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY, &global)
    }

    /// Batches at or below a queue's acknowledged id were applied already.
    fn remove_acknowledged_mutations(txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let queues: Vec<(String, DbMutationQueue)> = txn.scan(MUTATION_QUEUES_STORE, None, None)?;
        for (_, queue) in queues {
            let prefix = composite_key(&[&queue.user_id, ""]);
            let batches: Vec<(String, BatchId)> = txn.scan_prefix(USER_MUTATIONS_STORE, &prefix)?;
            for (user_key, batch_id) in batches {
                if batch_id > queue.last_acknowledged_batch_id {
                    continue;
                }
                let key = mutation_key(batch_id);
                if let Some(batch) = txn.get::<DbMutationBatch>(MUTATIONS_STORE, &key)? {
                    for mutation in &batch.mutations {
                        if let Some(path) = mutation_document_path(mutation) {
                            txn.delete(
                                DOCUMENT_MUTATIONS_STORE,
                                &document_mutation_key(&queue.user_id, &path, batch_id),
                            )?;
                        }
                    }
                }
                txn.delete(MUTATIONS_STORE, &key)?;
                txn.delete(USER_MUTATIONS_STORE, &user_key)?;
            }
        }
        Ok(())
    }

    /// Computes the cache size and gives every cached document a sentinel
    /// row so LRU collection can see it.
    fn add_document_size_and_sentinels(txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let documents: Vec<(String, DbRemoteDocument)> =
            txn.scan(REMOTE_DOCUMENTS_STORE, None, None)?;
        let byte_size = documents
            .iter()
            .map(|(_, record)| document_byte_size(record))
            .sum();
        txn.put(
            REMOTE_DOCUMENT_GLOBAL_STORE,
            REMOTE_DOCUMENT_GLOBAL_KEY,
            &DbRemoteDocumentGlobal { byte_size },
        )?;

        let global: DbTargetGlobal = txn
            .get(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?
            .unwrap_or_default();
        for (path, _) in documents {
            let sentinel_key = document_target_key(&path, 0);
            if !txn.contains(DOCUMENT_TARGETS_STORE, &sentinel_key) {
                let row = DbTargetDocument {
                    target_id: 0,
                    path: path.clone(),
                    sequence_number: Some(global.highest_listen_sequence_number),
                };
                txn.put(TARGET_DOCUMENTS_STORE, &target_document_key(0, &path), &row)?;
                txn.put(DOCUMENT_TARGETS_STORE, &sentinel_key, &row)?;
            }
        }
        Ok(())
    }

    fn backfill_collection_parents_and_read_times(
        txn: &mut KvTransaction<'_>,
    ) -> FirestoreResult<()> {
        let mut paths = Vec::new();
        let documents: Vec<(String, DbRemoteDocument)> =
            txn.scan(REMOTE_DOCUMENTS_STORE, None, None)?;
        for (encoded_path, mut record) in documents {
            let path = decode_resource_path(&encoded_path)?;
            let parent = encode_resource_path(&path.without_last());
            if record.read_time.is_none() || record.parent_path != parent {
                let read_time = record.read_time.unwrap_or_default();
                record.read_time = Some(read_time);
                record.parent_path = parent.clone();
                txn.put(REMOTE_DOCUMENTS_STORE, &encoded_path, &record)?;
            }
            let read_time = record.read_time.unwrap_or_default();
            txn.put(
                REMOTE_DOCUMENTS_READ_TIME_STORE,
                &read_time_key(read_time, &encoded_path),
                &(),
            )?;
            txn.put(
                REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE,
                &collection_read_time_key(&parent, read_time, &encoded_path),
                &(),
            )?;
            paths.push(path);
        }

        let document_mutations = txn.keys_with_prefix(DOCUMENT_MUTATIONS_STORE, "");
        for key in document_mutations {
            let mut parts = key.split(KEY_SEPARATOR);
            if let (Some(_user), Some(encoded_path)) = (parts.next(), parts.next()) {
                paths.push(decode_resource_path(encoded_path)?);
            }
        }

        for path in paths {
            let Some(collection_id) = path.without_last().last_segment().map(str::to_string) else {
                continue;
            };
            let parent = path.without_last().without_last();
            txn.put(
                COLLECTION_PARENTS_STORE,
                &collection_parent_key(&collection_id, &encode_resource_path(&parent)),
                &(),
            )?;
        }
        Ok(())
    }
}

/// Encoded document path a wire-format write targets.
fn mutation_document_path(mutation: &JsonValue) -> Option<String> {
    let name = mutation
        .get("update")
        .and_then(|update| update.get("name"))
        .or_else(|| mutation.get("delete"))
        .or_else(|| mutation.get("verify"))
        .or_else(|| mutation.get("transform").and_then(|t| t.get("document")))
        .and_then(JsonValue::as_str)?;
    let segments: Vec<&str> = name.split('/').collect();
    let documents = segments.iter().position(|segment| *segment == "documents")?;
    let path = ResourcePath::from_segments(
        segments[documents + 1..].iter().copied(),
    );
    Some(encode_resource_path(&path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::{KvDatabase, KvTransactionMode};

    #[test]
    fn fresh_database_is_created_at_the_current_version() {
        let db = KvDatabase::new("schema");
        db.open(SCHEMA_VERSION, SchemaConverter::create_or_upgrade)
            .unwrap();
        assert_eq!(db.version(), SCHEMA_VERSION);
        db.run_transaction(
            "check",
            KvTransactionMode::ReadOnly,
            |txn| {
                let global: Option<DbTargetGlobal> =
                    txn.get(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?;
                assert_eq!(global, Some(DbTargetGlobal::default()));
                Ok(())
            },
        )
        .unwrap();
    }

    #[test]
    fn upgrade_backfills_indexes_for_old_documents() {
        let db = KvDatabase::new("schema");
        db.open(3, SchemaConverter::create_or_upgrade).unwrap();

        let doc_path = ResourcePath::from_string("rooms/eros/messages/1").unwrap();
        let encoded = encode_resource_path(&doc_path);
        db.run_transaction(
            "seed",
            KvTransactionMode::ReadWrite,
            |txn| {
                txn.put(
                    REMOTE_DOCUMENTS_STORE,
                    &encoded,
                    &DbRemoteDocument {
                        unknown_document: None,
                        no_document: Some(DbNoDocument {
                            read_time: Timestamp::new(1, 0),
                        }),
                        document: None,
                        has_committed_mutations: false,
                        read_time: None,
                        parent_path: String::new(),
                    },
                )
            },
        )
        .unwrap();

        db.open(SCHEMA_VERSION, SchemaConverter::create_or_upgrade)
            .unwrap();
        db.run_transaction(
            "check",
            KvTransactionMode::ReadOnly,
            |txn| {
                let parent = encode_resource_path(&ResourcePath::from_string("rooms").unwrap());
                assert!(txn.contains(
                    COLLECTION_PARENTS_STORE,
                    &collection_parent_key("messages", &parent)
                ));
                assert!(txn.contains(DOCUMENT_TARGETS_STORE, &document_target_key(&encoded, 0)));
                let size: Option<DbRemoteDocumentGlobal> =
                    txn.get(REMOTE_DOCUMENT_GLOBAL_STORE, REMOTE_DOCUMENT_GLOBAL_KEY)?;
                assert!(size.unwrap().byte_size > 0);
                assert_eq!(
                    txn.keys_with_prefix(REMOTE_DOCUMENTS_READ_TIME_STORE, "").len(),
                    1
                );
                Ok(())
            },
        )
        .unwrap();
    }

    #[test]
    fn acknowledged_batches_are_dropped() {
        let db = KvDatabase::new("schema");
        db.open(2, SchemaConverter::create_or_upgrade).unwrap();
        db.run_transaction(
            "seed",
            KvTransactionMode::ReadWrite,
            |txn| {
                txn.put(
                    MUTATION_QUEUES_STORE,
                    "alice",
                    &DbMutationQueue {
                        user_id: "alice".into(),
                        last_acknowledged_batch_id: 1,
                        last_stream_token: String::new(),
                    },
                )?;
                for batch_id in [1, 2] {
                    txn.put(
                        MUTATIONS_STORE,
                        &mutation_key(batch_id),
                        &DbMutationBatch {
                            user_id: "alice".into(),
                            batch_id,
                            local_write_time: Timestamp::new(1, 0),
                            base_mutations: vec![],
                            mutations: vec![serde_json::json!({
                                "delete": "projects/p/databases/(default)/documents/coll/a"
                            })],
                        },
                    )?;
                    txn.put(USER_MUTATIONS_STORE, &user_mutation_key("alice", batch_id), &batch_id)?;
                }
                Ok(())
            },
        )
        .unwrap();

        db.open(SCHEMA_VERSION, SchemaConverter::create_or_upgrade)
            .unwrap();
        db.run_transaction(
            "check",
            KvTransactionMode::ReadOnly,
            |txn| {
                assert!(!txn.contains(MUTATIONS_STORE, &mutation_key(1)));
                assert!(txn.contains(MUTATIONS_STORE, &mutation_key(2)));
                Ok(())
            },
        )
        .unwrap();
    }
}
