use std::collections::{BTreeMap, HashMap};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_resource_path::{
    composite_prefix, decode_number, decode_resource_path, encode_number, encode_resource_path,
    prefix_successor, KEY_SEPARATOR,
};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_serializer::{record_read_time, LocalSerializer};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_read_time_key, document_byte_size, read_time_key, DbRemoteDocument,
    DbRemoteDocumentGlobal, REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE,
    REMOTE_DOCUMENTS_READ_TIME_STORE, REMOTE_DOCUMENTS_STORE, REMOTE_DOCUMENT_GLOBAL_KEY,
    REMOTE_DOCUMENT_GLOBAL_STORE,
};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, SnapshotVersion,
};
use crate::util::hard_assert;

/// Documents changed since some read time, and the newest read time seen.
#[derive(Clone, Debug)]
pub struct DocumentChanges {
    pub changed_docs: MaybeDocumentMap,
    pub read_time: SnapshotVersion,
}

/// The latest known state of every cached document, as last seen from the
/// backend or after an acknowledged write.
#[derive(Clone, Debug)]
pub struct RemoteDocumentCache {
    serializer: LocalSerializer,
}

impl RemoteDocumentCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer {
            cache: self.clone(),
            changes: BTreeMap::new(),
            document_sizes: HashMap::new(),
            applied: false,
        }
    }

    pub fn get_entry(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        Ok(self.read_entry(txn, key)?.map(|(doc, _)| doc))
    }

    /// Cached entries for `keys`. Keys without an entry are absent from the
    /// result.
    pub fn get_entries(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let mut results = MaybeDocumentMap::default();
        for key in keys.iter() {
            if let Some(doc) = self.get_entry(txn, key)? {
                results = results.insert(key.clone(), doc);
            }
        }
        Ok(results)
    }

    /// Cached documents in the query's collection that match it. With a
    /// non-minimal `since_read_time` only entries written after it are read.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        hard_assert(
            !query.is_collection_group_query(),
            "CollectionGroup queries should be handled in LocalDocumentsView",
        );
        let collection = encode_resource_path(query.path());
        let mut results = DocumentMap::default();
        let mut consider = |encoded_path: &str, record: &DbRemoteDocument| -> FirestoreResult<()> {
            let path = decode_resource_path(encoded_path)?;
            if path.len() != query.path().len() + 1 {
                return Ok(());
            }
            let key = DocumentKey::from_path(path)?;
            if let MaybeDocument::Document(doc) =
                self.serializer.from_db_remote_document(&key, record)?
            {
                if query.matches(&doc) {
                    results = results.insert(key, doc);
                }
            }
            Ok(())
        };

        if since_read_time.is_min() {
            let end = prefix_successor(&collection);
            let records: Vec<(String, DbRemoteDocument)> =
                txn.scan(REMOTE_DOCUMENTS_STORE, Some(&collection), Some(&end))?;
            for (encoded_path, record) in &records {
                consider(encoded_path, record)?;
            }
        } else {
            let prefix = composite_prefix(&[&collection]);
            for index_key in txn.keys_with_prefix(REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE, &prefix) {
                let mut parts = index_key[prefix.len()..].split(KEY_SEPARATOR);
                let (Some(read_time), Some(encoded_path)) = (parts.next(), parts.next()) else {
                    continue;
                };
                if decode_number(read_time)? <= since_read_time.to_micros() {
                    continue;
                }
                if let Some(record) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, encoded_path)? {
                    consider(encoded_path, &record)?;
                }
            }
        }
        Ok(results)
    }

    /// Entries of `collection_group` written after `since_read_time`. Other
    /// clients use this to pick up documents the primary wrote.
    pub fn get_new_document_changes(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_group: &str,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentChanges> {
        let mut changed_docs = MaybeDocumentMap::default();
        let mut read_time = since_read_time;
        let start = encode_number(since_read_time.to_micros() + 1);
        let rows: Vec<(String, ())> = txn.scan(REMOTE_DOCUMENTS_READ_TIME_STORE, Some(&start), None)?;
        for (index_key, ()) in rows {
            let mut parts = index_key.split(KEY_SEPARATOR);
            let (Some(_), Some(encoded_path)) = (parts.next(), parts.next()) else {
                continue;
            };
            let key = DocumentKey::from_path(decode_resource_path(encoded_path)?)?;
            if key.collection_group() != collection_group {
                continue;
            }
            if let Some((doc, entry_read_time)) = self.read_entry(txn, &key)? {
                read_time = read_time.max(entry_read_time);
                changed_docs = changed_docs.insert(key, doc);
            }
        }
        Ok(DocumentChanges {
            changed_docs,
            read_time,
        })
    }

    /// Newest read time of any cached entry.
    pub fn get_last_read_time(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<SnapshotVersion> {
        match txn.keys_with_prefix(REMOTE_DOCUMENTS_READ_TIME_STORE, "").last() {
            Some(index_key) => {
                let micros = index_key
                    .split(KEY_SEPARATOR)
                    .next()
                    .map(decode_number)
                    .transpose()?
                    .unwrap_or_default();
                Ok(SnapshotVersion::from_micros(micros))
            }
            None => Ok(SnapshotVersion::min()),
        }
    }

    /// Approximate size in bytes of all cached entries.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        Ok(self.metadata(txn)?.byte_size)
    }

    pub fn update_size(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        delta: i64,
    ) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut metadata = self.metadata(txn)?;
        metadata.byte_size += delta;
        txn.put(REMOTE_DOCUMENT_GLOBAL_STORE, REMOTE_DOCUMENT_GLOBAL_KEY, &metadata)
    }

    /// Deletes the entry and its index rows. Returns the size it occupied;
    /// the caller adjusts the cache size.
    pub fn remove_entry(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<i64> {
        let encoded_path = encode_resource_path(key.path());
        let Some(record) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &encoded_path)? else {
            return Ok(0);
        };
        self.delete_index_rows(txn, &encoded_path, &record)?;
        txn.delete(REMOTE_DOCUMENTS_STORE, &encoded_path)?;
        Ok(document_byte_size(&record))
    }

    /// Writes the entry and its index rows. Returns the size of the new
    /// record.
    fn put_entry(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64> {
        let key = doc.key();
        let encoded_path = encode_resource_path(key.path());
        if let Some(previous) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &encoded_path)? {
            self.delete_index_rows(txn, &encoded_path, &previous)?;
        }
        let record = self.serializer.to_db_remote_document(doc, read_time);
        txn.put(REMOTE_DOCUMENTS_STORE, &encoded_path, &record)?;
        txn.put(
            REMOTE_DOCUMENTS_READ_TIME_STORE,
            &read_time_key(read_time.timestamp(), &encoded_path),
            &(),
        )?;
        txn.put(
            REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE,
            &collection_read_time_key(&record.parent_path, read_time.timestamp(), &encoded_path),
            &(),
        )?;
        IndexManager.add_to_collection_parent_index(txn, &key.collection_path())?;
        Ok(document_byte_size(&record))
    }

    fn delete_index_rows(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        encoded_path: &str,
        record: &DbRemoteDocument,
    ) -> FirestoreResult<()> {
        let read_time = record_read_time(record).timestamp();
        txn.delete(
            REMOTE_DOCUMENTS_READ_TIME_STORE,
            &read_time_key(read_time, encoded_path),
        )?;
        txn.delete(
            REMOTE_DOCUMENTS_COLLECTION_READ_TIME_STORE,
            &collection_read_time_key(&record.parent_path, read_time, encoded_path),
        )
    }

    fn read_entry(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(MaybeDocument, SnapshotVersion)>> {
        let encoded_path = encode_resource_path(key.path());
        match txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &encoded_path)? {
            Some(record) => {
                let doc = self.serializer.from_db_remote_document(key, &record)?;
                Ok(Some((doc, record_read_time(&record))))
            }
            None => Ok(None),
        }
    }

    fn read_size(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<(Option<MaybeDocument>, i64)> {
        let encoded_path = encode_resource_path(key.path());
        match txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &encoded_path)? {
            Some(record) => Ok((
                Some(self.serializer.from_db_remote_document(key, &record)?),
                document_byte_size(&record),
            )),
            None => Ok((None, 0)),
        }
    }

    fn metadata(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<DbRemoteDocumentGlobal> {
        Ok(txn
            .get(REMOTE_DOCUMENT_GLOBAL_STORE, REMOTE_DOCUMENT_GLOBAL_KEY)?
            .unwrap_or_default())
    }
}

/// Collects cache changes within one transaction and writes them together
/// with the resulting cache size delta. Every document must be read through
/// the buffer before it is changed, so its previous size is known.
#[derive(Debug)]
pub struct RemoteDocumentChangeBuffer {
    cache: RemoteDocumentCache,
    changes: BTreeMap<DocumentKey, Option<(MaybeDocument, SnapshotVersion)>>,
    document_sizes: HashMap<DocumentKey, i64>,
    applied: bool,
}

impl RemoteDocumentChangeBuffer {
    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        self.assert_not_applied();
        self.changes.insert(doc.key().clone(), Some((doc, read_time)));
    }

    pub fn remove_entry(&mut self, key: DocumentKey) {
        self.assert_not_applied();
        self.changes.insert(key, None);
    }

    pub fn get_entry(
        &mut self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        self.assert_not_applied();
        if let Some(change) = self.changes.get(key) {
            return Ok(change.as_ref().map(|(doc, _)| doc.clone()));
        }
        let (doc, size) = self.cache.read_size(txn, key)?;
        self.document_sizes.insert(key.clone(), size);
        Ok(doc)
    }

    pub fn get_entries(
        &mut self,
        txn: &PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let mut results = MaybeDocumentMap::default();
        for key in keys.iter() {
            if let Some(doc) = self.get_entry(txn, key)? {
                results = results.insert(key.clone(), doc);
            }
        }
        Ok(results)
    }

    pub fn apply_changes(&mut self, txn: &mut PersistenceTransaction<'_, '_>) -> FirestoreResult<()> {
        self.assert_not_applied();
        self.applied = true;
        let mut size_delta = 0;
        for (key, change) in std::mem::take(&mut self.changes) {
            let previous_size = self.document_sizes.get(&key).copied();
            hard_assert(
                previous_size.is_some(),
                format!("Cannot modify a document that wasn't read (for {key})"),
            );
            let previous_size = previous_size.unwrap_or_default();
            match change {
                Some((doc, read_time)) => {
                    size_delta += self.cache.put_entry(txn, &doc, read_time)? - previous_size;
                }
                None => {
                    self.cache.remove_entry(txn, &key)?;
                    size_delta -= previous_size;
                }
            }
        }
        self.cache.update_size(txn, size_delta)
    }

    fn assert_not_applied(&self) {
        hard_assert(!self.applied, "Changes have already been applied.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::test_helpers::{doc, key, started_persistence};
    use crate::firestore::model::{NoDocument, ResourcePath};

    #[tokio::test]
    async fn change_buffer_tracks_cache_size() {
        let persistence = started_persistence("rdc-size").await;
        let cache = persistence.remote_document_cache();
        let size = persistence
            .run_transaction("write", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                buffer.get_entry(txn, &key("rooms/a"))?;
                buffer.add_entry(doc("rooms/a", 1, 7).into(), SnapshotVersion::from_micros(10));
                buffer.apply_changes(txn)?;
                cache.get_size(txn)
            })
            .await
            .unwrap();
        assert!(size > 0);

        let size = persistence
            .run_transaction("remove", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                buffer.get_entry(txn, &key("rooms/a"))?;
                buffer.remove_entry(key("rooms/a"));
                buffer.apply_changes(txn)?;
                assert!(cache.get_entry(txn, &key("rooms/a"))?.is_none());
                cache.get_size(txn)
            })
            .await
            .unwrap();
        assert_eq!(size, 0);
    }

    #[tokio::test]
    async fn query_reads_immediate_children_since_read_time() {
        let persistence = started_persistence("rdc-query").await;
        let cache = persistence.remote_document_cache();
        persistence
            .run_transaction("seed", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                for (path, read_time) in [
                    ("rooms/a", 10),
                    ("rooms/b", 20),
                    ("rooms/a/messages/1", 30),
                ] {
                    buffer.get_entry(txn, &key(path))?;
                    buffer.add_entry(doc(path, 1, 1).into(), SnapshotVersion::from_micros(read_time));
                }
                buffer.get_entry(txn, &key("rooms/c"))?;
                buffer.add_entry(
                    NoDocument::new(key("rooms/c"), SnapshotVersion::from_micros(1), false).into(),
                    SnapshotVersion::from_micros(40),
                );
                buffer.apply_changes(txn)
            })
            .await
            .unwrap();

        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        let (all, recent, changes, last) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_documents_matching_query(txn, &query, SnapshotVersion::min())?,
                    cache.get_documents_matching_query(txn, &query, SnapshotVersion::from_micros(10))?,
                    cache.get_new_document_changes(txn, "rooms", SnapshotVersion::from_micros(10))?,
                    cache.get_last_read_time(txn)?,
                ))
            })
            .await
            .unwrap();

        let keys: Vec<_> = all.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b")]);
        let keys: Vec<_> = recent.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/b")]);
        let keys: Vec<_> = changes.changed_docs.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/b"), key("rooms/c")]);
        assert_eq!(changes.read_time, SnapshotVersion::from_micros(40));
        assert_eq!(last, SnapshotVersion::from_micros(40));
    }

    #[tokio::test]
    #[should_panic(expected = "wasn't read")]
    async fn writes_require_a_prior_read() {
        let persistence = started_persistence("rdc-unread").await;
        let cache = persistence.remote_document_cache();
        let _ = persistence
            .run_transaction("write", TransactionMode::ReadWritePrimary, |txn| {
                let mut buffer = cache.new_change_buffer();
                buffer.add_entry(doc("rooms/a", 1, 1).into(), SnapshotVersion::from_micros(1));
                buffer.apply_changes(txn)
            })
            .await;
    }
}
