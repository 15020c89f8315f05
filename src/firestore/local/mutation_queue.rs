use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::encoded_resource_path::{
    composite_key, composite_prefix, decode_number, decode_resource_path, encode_resource_path,
    KEY_SEPARATOR,
};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::lru_garbage_collector::LruDelegate;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    document_mutation_key, mutation_key, user_mutation_key, DbMutationBatch, DbMutationGlobal,
    DbMutationQueue, DOCUMENT_MUTATIONS_STORE, MUTATIONS_STORE, MUTATION_GLOBAL_KEY,
    MUTATION_GLOBAL_STORE, MUTATION_QUEUES_STORE, USER_MUTATIONS_STORE,
};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, ResourcePath, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::value::BytesValue;
use crate::util::hard_assert;

/// The persisted queue of one user's unacknowledged writes.
///
/// Batch ids come from a counter shared by every user, so ids stay unique
/// across a user change.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
    serializer: LocalSerializer,
}

impl MutationQueue {
    pub fn new(user_id: impl Into<String>, serializer: LocalSerializer) -> Self {
        Self {
            user_id: user_id.into(),
            serializer,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_, '_>) -> bool {
        txn.keys_with_prefix(USER_MUTATIONS_STORE, &self.user_prefix())
            .is_empty()
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        batch: &MutationBatch,
        stream_token: &BytesValue,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = stream_token.to_base64();
        txn.put(MUTATION_QUEUES_STORE, &self.user_id, &metadata)
    }

    pub fn get_last_stream_token(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<BytesValue> {
        let metadata = self.metadata(txn)?;
        BytesValue::from_base64(&metadata.last_stream_token)
            .map_err(|err| data_loss(format!("Corrupt stream token: {err}")))
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        stream_token: &BytesValue,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = stream_token.to_base64();
        txn.put(MUTATION_QUEUES_STORE, &self.user_id, &metadata)
    }

    /// Appends a batch with the next batch id and indexes the documents it
    /// touches.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut global: DbMutationGlobal = txn
            .get(MUTATION_GLOBAL_STORE, MUTATION_GLOBAL_KEY)?
            .unwrap_or_default();
        global.highest_batch_id += 1;
        let batch_id = global.highest_batch_id;
        txn.put(MUTATION_GLOBAL_STORE, MUTATION_GLOBAL_KEY, &global)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let record = self.serializer.to_db_mutation_batch(&self.user_id, &batch);
        txn.put(MUTATIONS_STORE, &mutation_key(batch_id), &record)?;
        txn.put(
            USER_MUTATIONS_STORE,
            &user_mutation_key(&self.user_id, batch_id),
            &batch_id,
        )?;
        if !txn.contains(MUTATION_QUEUES_STORE, &self.user_id) {
            let metadata = self.metadata(txn)?;
            txn.put(MUTATION_QUEUES_STORE, &self.user_id, &metadata)?;
        }

        let index_manager = IndexManager;
        for mutation in &batch.mutations {
            let path = encode_resource_path(mutation.key().path());
            txn.put(
                DOCUMENT_MUTATIONS_STORE,
                &document_mutation_key(&self.user_id, &path, batch_id),
                &(),
            )?;
            index_manager.add_to_collection_parent_index(txn, &mutation.key().collection_path())?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        match txn.get::<DbMutationBatch>(MUTATIONS_STORE, &mutation_key(batch_id))? {
            Some(record) if record.user_id == self.user_id => {
                self.serializer.from_db_mutation_batch(&record).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// First batch of this user with an id above `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let start = user_mutation_key(&self.user_id, batch_id.saturating_add(1));
        let end = format!("{}\u{1}", self.user_id);
        let next = txn
            .scan::<BatchId>(USER_MUTATIONS_STORE, Some(&start), Some(&end))?
            .into_iter()
            .next();
        match next {
            Some((_, next_id)) => self.lookup_mutation_batch(txn, next_id),
            None => Ok(None),
        }
    }

    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<BatchId> {
        let ids = txn.scan::<BatchId>(
            USER_MUTATIONS_STORE,
            Some(&self.user_prefix()),
            Some(&self.user_end()),
        )?;
        Ok(ids.last().map_or(BATCH_ID_UNKNOWN, |(_, id)| *id))
    }

    pub fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = txn.scan::<BatchId>(
            USER_MUTATIONS_STORE,
            Some(&self.user_prefix()),
            Some(&self.user_end()),
        )?;
        self.load_batches(txn, ids.into_iter().map(|(_, id)| id))
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = self.batch_ids_for_document(txn, key)?;
        self.load_batches(txn, ids.into_iter())
    }

    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut ids = BTreeSet::new();
        for key in keys.iter() {
            ids.extend(self.batch_ids_for_document(txn, key)?);
        }
        self.load_batches(txn, ids.into_iter())
    }

    /// Batches touching documents directly inside the query's collection.
    /// Collection group queries are resolved by the caller one collection at
    /// a time.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "Collection group queries are resolved per collection",
        );
        let query_path = query.path();
        let prefix = composite_key(&[&self.user_id, &encode_resource_path(query_path)]);
        let mut ids = BTreeSet::new();
        for key in txn.keys_with_prefix(DOCUMENT_MUTATIONS_STORE, &prefix) {
            let (path, batch_id) = parse_document_mutation_key(&key)?;
            // Skip subcollections; only immediate children match.
            if path.len() == query_path.len() + 1 {
                ids.insert(batch_id);
            }
        }
        self.load_batches(txn, ids.into_iter())
    }

    /// Removes the batch and its index rows. Every touched document is
    /// reported to `reference_delegate` so it becomes collectable later.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        reference_delegate: &LruDelegate,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let key = mutation_key(batch.batch_id);
        hard_assert(
            txn.contains(MUTATIONS_STORE, &key),
            format!("Cannot remove unknown mutation batch {}", batch.batch_id),
        );
        txn.delete(MUTATIONS_STORE, &key)?;
        txn.delete(
            USER_MUTATIONS_STORE,
            &user_mutation_key(&self.user_id, batch.batch_id),
        )?;
        for mutation in &batch.mutations {
            let path = encode_resource_path(mutation.key().path());
            txn.delete(
                DOCUMENT_MUTATIONS_STORE,
                &document_mutation_key(&self.user_id, &path, batch.batch_id),
            )?;
            reference_delegate.remove_mutation_reference(txn, mutation.key())?;
        }
        Ok(())
    }

    /// An empty queue must not leave document index rows behind.
    pub fn perform_consistency_check(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<()> {
        if !self.check_empty(txn) {
            return Ok(());
        }
        let dangling = txn.keys_with_prefix(DOCUMENT_MUTATIONS_STORE, &self.user_prefix());
        hard_assert(
            dangling.is_empty(),
            format!(
                "Document leak: {} document mutation rows left for an empty queue",
                dangling.len()
            ),
        );
        Ok(())
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbMutationQueue> {
        Ok(txn
            .get::<DbMutationQueue>(MUTATION_QUEUES_STORE, &self.user_id)?
            .unwrap_or_else(|| DbMutationQueue {
                user_id: self.user_id.clone(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: String::new(),
            }))
    }

    fn batch_ids_for_document(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<BatchId>> {
        let prefix = composite_prefix(&[&self.user_id, &encode_resource_path(key.path())]);
        txn.keys_with_prefix(DOCUMENT_MUTATIONS_STORE, &prefix)
            .iter()
            .map(|row| parse_document_mutation_key(row).map(|(_, batch_id)| batch_id))
            .collect()
    }

    fn load_batches(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        ids: impl Iterator<Item = BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::new();
        for batch_id in ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(data_loss(format!(
                        "Dangling document-mutation reference to batch {batch_id}"
                    )))
                }
            }
        }
        Ok(batches)
    }

    fn user_prefix(&self) -> String {
        composite_prefix(&[&self.user_id])
    }

    fn user_end(&self) -> String {
        format!("{}\u{1}", self.user_id)
    }
}

/// Whether any user's queue still has a write for `key`.
pub fn mutation_queues_contain_key(
    txn: &PersistenceTransaction<'_, '_>,
    key: &DocumentKey,
) -> FirestoreResult<bool> {
    let path = encode_resource_path(key.path());
    let queues: Vec<(String, DbMutationQueue)> = txn.scan(MUTATION_QUEUES_STORE, None, None)?;
    Ok(queues.iter().any(|(user_id, _)| {
        !txn.keys_with_prefix(DOCUMENT_MUTATIONS_STORE, &composite_prefix(&[user_id, &path]))
            .is_empty()
    }))
}

fn parse_document_mutation_key(key: &str) -> FirestoreResult<(ResourcePath, BatchId)> {
    let mut parts = key.split(KEY_SEPARATOR);
    let (Some(_user), Some(path), Some(batch_id)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(data_loss(format!("Invalid document mutation key {key:?}")));
    };
    let batch_id = decode_number(batch_id)?;
    Ok((decode_resource_path(path)?, batch_id as BatchId))
}
