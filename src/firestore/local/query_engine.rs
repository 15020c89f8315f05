//! Index-free query execution.
//!
//! A query that was once in sync with the backend knows which documents
//! matched it at its last limbo-free snapshot. Re-running it only needs
//! those documents plus whatever the cache received since then, instead of
//! scanning the whole collection.

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::{DocumentChanges, RemoteDocumentCache};
use crate::firestore::model::{
    DocumentKeySet, DocumentMap, DocumentSet, MaybeDocument, MaybeDocumentMap, SnapshotVersion,
};

const LOG_TAG: &str = "QueryEngine";

#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        // Plain collection scans gain nothing from the previous results.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.execute_full_collection_scan(txn, local_documents, query);
        }

        let documents = local_documents.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, &documents);

        if query.limit().is_some()
            && needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(txn, local_documents, query);
        }

        log::debug!(
            "{LOG_TAG}: re-using previous result from {:?} to execute query: {query}",
            last_limbo_free_snapshot_version
        );

        // Documents written after the last limbo-free snapshot, merged with
        // the previous matches.
        let mut updated_results = local_documents.get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
        )?;
        for doc in previous_results.iter() {
            updated_results = updated_results.insert(doc.key().clone(), doc.clone());
        }
        Ok(updated_results)
    }

    /// Cache entries of `collection_group` read after `since_read_time`.
    pub fn get_new_document_changes(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        remote_document_cache: &RemoteDocumentCache,
        collection_group: &str,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentChanges> {
        remote_document_cache.get_new_document_changes(txn, collection_group, since_read_time)
    }

    fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        local_documents: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        log::debug!("{LOG_TAG}: using full collection scan to execute query: {query}");
        local_documents.get_documents_matching_query(txn, query, SnapshotVersion::min())
    }
}

/// The previous matches of `query`, in query order.
fn apply_query(query: &Query, documents: &MaybeDocumentMap) -> DocumentSet {
    let mut results = DocumentSet::new(query.comparator());
    for (_, maybe_doc) in documents.iter() {
        if let MaybeDocument::Document(doc) = maybe_doc {
            if query.matches(doc) {
                results = results.add(doc.clone());
            }
        }
    }
    results
}

/// Whether a limit query must be re-run from scratch: a previous match
/// disappeared, or the document at the edge of the limit changed since the
/// limbo-free snapshot and may now sort past a document the cache holds.
fn needs_refill(
    limit_type: LimitType,
    sorted_previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match limit_type {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::{Direction, OrderBy};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_helpers::{doc, key, started_persistence};
    use crate::firestore::model::{document_key_set, FieldPath, ResourcePath};
    use crate::firestore::remote::credentials::User;

    #[tokio::test]
    async fn limit_query_refills_when_edge_document_changed() {
        let persistence = started_persistence("query-engine").await;
        let cache = persistence.remote_document_cache();
        let view = LocalDocumentsView::new(
            cache.clone(),
            persistence.mutation_queue(&User::unauthenticated()),
            persistence.index_manager(),
        );
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_order_by(OrderBy::new(FieldPath::from_single("n"), Direction::Descending))
            .with_limit_to_first(2);

        let results = persistence
            .run_transaction("query", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                for (path, version, score) in
                    [("rooms/d1", 20, 3), ("rooms/d2", 1, 8), ("rooms/d3", 1, 5)]
                {
                    buffer.get_entry(txn, &key(path))?;
                    buffer.add_entry(
                        doc(path, version, score).into(),
                        SnapshotVersion::from_micros(version),
                    );
                }
                buffer.apply_changes(txn)?;
                QueryEngine.get_documents_matching_query(
                    txn,
                    &view,
                    &query,
                    SnapshotVersion::from_micros(10),
                    &document_key_set([key("rooms/d1"), key("rooms/d2")]),
                )
            })
            .await
            .unwrap();

        let mut keys: Vec<_> = results.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec![key("rooms/d1"), key("rooms/d2"), key("rooms/d3")]);
    }
}
