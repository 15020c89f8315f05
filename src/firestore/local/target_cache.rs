use std::collections::BTreeSet;

use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_resource_path::{
    composite_prefix, decode_resource_path, encode_number, encode_resource_path,
};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::lru_garbage_collector::LruDelegate;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    canonical_id_key, document_target_key, target_document_key, target_key, DbTarget,
    DbTargetDocument, DbTargetGlobal, DOCUMENT_TARGETS_STORE, TARGETS_BY_CANONICAL_ID_STORE,
    TARGETS_STORE, TARGET_DOCUMENTS_STORE, TARGET_GLOBAL_KEY, TARGET_GLOBAL_STORE,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId,
};

/// Persisted targets, their matching documents and the global target
/// metadata row.
#[derive(Clone, Debug)]
pub struct TargetCache {
    serializer: LocalSerializer,
}

impl TargetCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    /// Next unused target id. Ids handed out here are even.
    pub fn allocate_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<TargetId> {
        let mut metadata = self.metadata(txn)?;
        let target_id = TargetIdGenerator::after(metadata.highest_target_id).next();
        metadata.highest_target_id = target_id;
        self.save_metadata(txn, &metadata)?;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(
            self.metadata(txn)?.last_remote_snapshot_version,
        ))
    }

    pub fn get_highest_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.metadata(txn)?.highest_listen_sequence_number)
    }

    pub fn set_target_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.highest_listen_sequence_number = metadata
            .highest_listen_sequence_number
            .max(highest_listen_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            metadata.last_remote_snapshot_version = version.timestamp();
        }
        self.save_metadata(txn, &metadata)
    }

    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        metadata.target_count += 1;
        self.update_metadata_from_target_data(&mut metadata, target_data);
        self.save_metadata(txn, &metadata)
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut metadata = self.metadata(txn)?;
        if self.update_metadata_from_target_data(&mut metadata, target_data) {
            self.save_metadata(txn, &metadata)?;
        }
        Ok(())
    }

    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.delete(TARGETS_STORE, &target_key(target_data.target_id))?;
        txn.delete(
            TARGETS_BY_CANONICAL_ID_STORE,
            &canonical_id_key(&target_data.target.canonical_id(), target_data.target_id),
        )?;
        let mut metadata = self.metadata(txn)?;
        metadata.target_count = (metadata.target_count - 1).max(0);
        self.save_metadata(txn, &metadata)
    }

    /// Drops every inactive target whose sequence number is at or below
    /// `upper_bound`, and returns how many were dropped.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.get_all_targets(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_all_targets(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<TargetData>> {
        txn.scan::<DbTarget>(TARGETS_STORE, None, None)?
            .iter()
            .map(|(_, record)| self.serializer.from_db_target(record))
            .collect()
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        Ok(self.metadata(txn)?.target_count)
    }

    /// Looks a target up through the canonical id index. Distinct targets
    /// may share a canonical id, so candidates are compared in full.
    pub fn get_target_data(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let prefix = composite_prefix(&[&target.canonical_id()]);
        for (_, target_id) in txn.scan_prefix::<TargetId>(TARGETS_BY_CANONICAL_ID_STORE, &prefix)? {
            if let Some(found) = self.get_target_data_by_id(txn, target_id)? {
                if &found.target == target {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get::<DbTarget>(TARGETS_STORE, &target_key(target_id))?
            .map(|record| self.serializer.from_db_target(&record))
            .transpose()
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
        delegate: &LruDelegate,
    ) -> FirestoreResult<()> {
        for key in keys.iter() {
            let path = encode_resource_path(key.path());
            let row = DbTargetDocument {
                target_id,
                path: path.clone(),
                sequence_number: None,
            };
            txn.put(TARGET_DOCUMENTS_STORE, &target_document_key(target_id, &path), &row)?;
            txn.put(DOCUMENT_TARGETS_STORE, &document_target_key(&path, target_id), &row)?;
            delegate.add_reference(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
        delegate: &LruDelegate,
    ) -> FirestoreResult<()> {
        for key in keys.iter() {
            let path = encode_resource_path(key.path());
            txn.delete(TARGET_DOCUMENTS_STORE, &target_document_key(target_id, &path))?;
            txn.delete(DOCUMENT_TARGETS_STORE, &document_target_key(&path, target_id))?;
            delegate.remove_reference(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let prefix = composite_prefix(&[&encode_number(i64::from(target_id))]);
        let rows: Vec<(String, DbTargetDocument)> =
            txn.scan_prefix(TARGET_DOCUMENTS_STORE, &prefix)?;
        for (key, row) in rows {
            txn.delete(TARGET_DOCUMENTS_STORE, &key)?;
            txn.delete(DOCUMENT_TARGETS_STORE, &document_target_key(&row.path, target_id))?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet> {
        let prefix = composite_prefix(&[&encode_number(i64::from(target_id))]);
        let mut keys = DocumentKeySet::default();
        for (_, row) in txn.scan_prefix::<DbTargetDocument>(TARGET_DOCUMENTS_STORE, &prefix)? {
            keys = keys.add(DocumentKey::from_path(decode_resource_path(&row.path)?)?);
        }
        Ok(keys)
    }

    /// Whether any target (sentinel rows aside) references `key`.
    pub fn contains_key(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<bool> {
        let prefix = composite_prefix(&[&encode_resource_path(key.path())]);
        Ok(txn
            .scan_prefix::<DbTargetDocument>(DOCUMENT_TARGETS_STORE, &prefix)?
            .iter()
            .any(|(_, row)| row.target_id != 0))
    }

    fn save_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let record = self.serializer.to_db_target(target_data);
        txn.put(TARGETS_STORE, &target_key(target_data.target_id), &record)?;
        txn.put(
            TARGETS_BY_CANONICAL_ID_STORE,
            &canonical_id_key(&record.canonical_id, target_data.target_id),
            &target_data.target_id,
        )
    }

    fn update_metadata_from_target_data(
        &self,
        metadata: &mut DbTargetGlobal,
        target_data: &TargetData,
    ) -> bool {
        let mut updated = false;
        if target_data.target_id > metadata.highest_target_id {
            metadata.highest_target_id = target_data.target_id;
            updated = true;
        }
        if target_data.sequence_number > metadata.highest_listen_sequence_number {
            metadata.highest_listen_sequence_number = target_data.sequence_number;
            updated = true;
        }
        updated
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn
            .get(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY)?
            .unwrap_or_default())
    }

    fn save_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        metadata: &DbTargetGlobal,
    ) -> FirestoreResult<()> {
        txn.put(TARGET_GLOBAL_STORE, TARGET_GLOBAL_KEY, metadata)
    }
}
