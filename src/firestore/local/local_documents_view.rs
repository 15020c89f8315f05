use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, MutationBatch,
    MutationKind, NoDocument, ResourcePath, SnapshotVersion,
};

/// Read-only view over the remote document cache with the user's pending
/// mutations applied on top.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_document_cache: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    /// Local view of `key`, or `None` when neither the cache nor a pending
    /// write knows about it.
    pub fn get_document(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        let mut document = self.remote_document_cache.get_entry(txn, key)?;
        for batch in &batches {
            document = batch.apply_to_local_view(key, document);
        }
        Ok(document)
    }

    /// Local views of `keys`. Keys nobody knows about map to a
    /// [`NoDocument`] at the minimum version.
    pub fn get_documents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let base_docs = self.remote_document_cache.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, keys, &base_docs)
    }

    /// Applies the pending mutations for `keys` on top of `base_docs`.
    pub fn get_local_view_of_documents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
        base_docs: &MaybeDocumentMap,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, keys)?;
        let mut results = MaybeDocumentMap::default();
        for key in keys.iter() {
            let mut local_view = base_docs.get(key).cloned();
            for batch in &batches {
                local_view = batch.apply_to_local_view(key, local_view);
            }
            let local_view = local_view.unwrap_or_else(|| {
                NoDocument::new(key.clone(), SnapshotVersion::min(), false).into()
            });
            results = results.insert(key.clone(), local_view);
        }
        Ok(results)
    }

    /// Documents matching `query` in the local view. With a non-minimal
    /// `since_read_time` only cache entries read after it are considered,
    /// together with every document a pending write touches.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query.path())
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, since_read_time)
        } else {
            self.get_documents_matching_collection_query(txn, query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        path: &ResourcePath,
    ) -> FirestoreResult<DocumentMap> {
        let key = DocumentKey::from_path(path.clone())?;
        let mut results = DocumentMap::default();
        if let Some(MaybeDocument::Document(doc)) = self.get_document(txn, &key)? {
            results = results.insert(key, doc);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let collection_id = query.collection_group_id().unwrap_or_default();
        let mut results = DocumentMap::default();
        for parent in self.index_manager.get_collection_parents(txn, collection_id)? {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            let collection_results =
                self.get_documents_matching_collection_query(txn, &collection_query, since_read_time)?;
            for (key, doc) in collection_results.iter() {
                results = results.insert(key.clone(), doc.clone());
            }
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut results =
            self.remote_document_cache
                .get_documents_matching_query(txn, query, since_read_time)?;
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_query(txn, query)?;
        let mut base_docs: MaybeDocumentMap = results
            .iter()
            .map(|(key, doc)| (key.clone(), MaybeDocument::Document(doc.clone())))
            .collect();
        base_docs = self.add_missing_base_documents(txn, &batches, base_docs)?;

        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !query.path().is_immediate_parent_of(key.path()) {
                    continue;
                }
                let base_doc = base_docs.get(key).cloned();
                let mutated =
                    mutation.apply_to_local_view(base_doc.clone(), base_doc.as_ref(), batch.local_write_time);
                match mutated {
                    Some(MaybeDocument::Document(doc)) => {
                        base_docs = base_docs.insert(key.clone(), doc.clone().into());
                        results = results.insert(key.clone(), doc);
                    }
                    Some(other) => {
                        base_docs = base_docs.insert(key.clone(), other);
                        results = results.remove(key);
                    }
                    None => results = results.remove(key),
                }
            }
        }

        // A pending write may have moved a document into or out of the
        // result set.
        let non_matching: Vec<DocumentKey> = results
            .iter()
            .filter(|(_, doc)| !query.matches(doc))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &non_matching {
            results = results.remove(key);
        }
        Ok(results)
    }

    /// Patches only apply to existing documents, so cached documents the
    /// query did not return (for example because they did not match before
    /// the patch) are loaded for every patched key.
    fn add_missing_base_documents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        batches: &[MutationBatch],
        mut base_docs: MaybeDocumentMap,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let mut missing = DocumentKeySet::default();
        for batch in batches {
            for mutation in &batch.mutations {
                if matches!(mutation.kind(), MutationKind::Patch { .. })
                    && !base_docs.contains_key(mutation.key())
                {
                    missing = missing.add(mutation.key().clone());
                }
            }
        }
        for (key, doc) in self.remote_document_cache.get_entries(txn, &missing)?.iter() {
            if doc.is_document() {
                base_docs = base_docs.insert(key.clone(), doc.clone());
            }
        }
        Ok(base_docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_helpers::{doc, key, started_persistence};
    use crate::firestore::model::{FieldMask, FieldPath, Mutation, Precondition, Timestamp};
    use crate::firestore::remote::credentials::User;
    use crate::firestore::value::{FirestoreValue, ObjectValue};

    fn patch(path: &str, field: &str, value: i64) -> Mutation {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_single(field), value.into());
        Mutation::patch(
            key(path),
            data,
            FieldMask::new(vec![FieldPath::from_single(field)]),
            Precondition::Exists(true),
        )
    }

    #[tokio::test]
    async fn pending_patch_applies_on_top_of_cached_document() {
        let persistence = started_persistence("ldv").await;
        let cache = persistence.remote_document_cache();
        let view = LocalDocumentsView::new(
            cache.clone(),
            persistence.mutation_queue(&User::unauthenticated()),
            persistence.index_manager(),
        );
        let (single, query_results, missing) = persistence
            .run_transaction("read", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                buffer.get_entry(txn, &key("rooms/a"))?;
                buffer.add_entry(doc("rooms/a", 5, 9).into(), SnapshotVersion::from_micros(5));
                buffer.apply_changes(txn)?;
                view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![patch("rooms/a", "y", 2), patch("rooms/b", "y", 3)],
                )?;

                let query = Query::new(ResourcePath::from_string("rooms").unwrap());
                Ok((
                    view.get_document(txn, &key("rooms/a"))?,
                    view.get_documents_matching_query(txn, &query, SnapshotVersion::min())?,
                    view.get_documents(txn, &DocumentKeySet::default().add(key("rooms/b")))?,
                ))
            })
            .await
            .unwrap();

        let local = single.and_then(MaybeDocument::into_document).unwrap();
        assert!(local.has_local_mutations());
        assert_eq!(local.field(&FieldPath::from_single("n")), Some(&FirestoreValue::from(9i64)));
        assert_eq!(local.field(&FieldPath::from_single("y")), Some(&FirestoreValue::from(2i64)));
        assert_eq!(query_results.len(), 1);
        assert!(missing.get(&key("rooms/b")).is_some_and(MaybeDocument::is_no_document));
    }
}
