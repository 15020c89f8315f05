//! Least-recently-used collection of cached targets and documents.
//!
//! Every transaction carries a sequence number. Documents record the number
//! of the last transaction that touched them in a sentinel row (target id 0)
//! of the target-document index, targets record it in their metadata. A
//! collection pass picks the sequence number below which a configured
//! percentile of entries fall and removes inactive targets and unreferenced
//! documents at or below it.

use std::collections::{BTreeSet, BinaryHeap};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_resource_path::{decode_resource_path, encode_resource_path};
use crate::firestore::local::local_serializer::LocalSerializer;
use crate::firestore::local::mutation_queue::mutation_queues_contain_key;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::schema::{
    document_target_key, target_document_key, DbTargetDocument, DOCUMENT_TARGETS_STORE,
    TARGET_DOCUMENTS_STORE,
};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::settings::LruParams;

const LOG_TAG: &str = "LruGarbageCollector";

/// Keeps document sequence numbers current and answers the questions the
/// collector asks about the cache.
#[derive(Clone, Debug)]
pub struct LruDelegate {
    serializer: LocalSerializer,
}

impl LruDelegate {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        write_sentinel_key(txn, key)
    }

    pub fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        write_sentinel_key(txn, key)
    }

    pub fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        write_sentinel_key(txn, key)
    }

    pub fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        write_sentinel_key(txn, key)
    }

    /// A released target stays cached with the releasing transaction's
    /// sequence number.
    pub fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let updated = target_data.with_sequence_number(txn.current_sequence_number());
        TargetCache::new(self.serializer.clone()).update_target_data(txn, &updated)
    }

    pub fn get_sequence_number_count(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<usize> {
        let targets = TargetCache::new(self.serializer.clone()).get_target_count(txn)?;
        Ok(targets as usize + orphaned_documents(txn)?.len())
    }

    pub fn target_sequence_numbers(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<ListenSequenceNumber>> {
        Ok(TargetCache::new(self.serializer.clone())
            .get_all_targets(txn)?
            .into_iter()
            .map(|target| target.sequence_number)
            .collect())
    }

    pub fn orphaned_document_sequence_numbers(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
    ) -> FirestoreResult<Vec<ListenSequenceNumber>> {
        Ok(orphaned_documents(txn)?
            .into_iter()
            .map(|(_, sequence_number)| sequence_number)
            .collect())
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        TargetCache::new(self.serializer.clone()).remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Removes unreferenced documents at or below `upper_bound` that are
    /// neither pinned in memory nor written by a pending mutation.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        upper_bound: ListenSequenceNumber,
        in_memory_pins: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let cache = RemoteDocumentCache::new(self.serializer.clone());
        let mut removed = 0;
        let mut bytes_removed = 0;
        for (key, sequence_number) in orphaned_documents(txn)? {
            if sequence_number > upper_bound
                || in_memory_pins.contains_key(&key)
                || mutation_queues_contain_key(txn, &key)?
            {
                continue;
            }
            let path = encode_resource_path(key.path());
            txn.delete(TARGET_DOCUMENTS_STORE, &target_document_key(0, &path))?;
            txn.delete(DOCUMENT_TARGETS_STORE, &document_target_key(&path, 0))?;
            bytes_removed += cache.remove_entry(txn, &key)?;
            removed += 1;
        }
        cache.update_size(txn, -bytes_removed)?;
        Ok(removed)
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction<'_, '_>) -> FirestoreResult<i64> {
        RemoteDocumentCache::new(self.serializer.clone()).get_size(txn)
    }
}

fn write_sentinel_key(
    txn: &mut PersistenceTransaction<'_, '_>,
    key: &DocumentKey,
) -> FirestoreResult<()> {
    let path = encode_resource_path(key.path());
    let row = DbTargetDocument {
        target_id: 0,
        path: path.clone(),
        sequence_number: Some(txn.current_sequence_number()),
    };
    txn.put(TARGET_DOCUMENTS_STORE, &target_document_key(0, &path), &row)?;
    txn.put(DOCUMENT_TARGETS_STORE, &document_target_key(&path, 0), &row)
}

/// Documents whose only row in the document-target index is the sentinel.
/// The sentinel sorts first among a document's rows.
fn orphaned_documents(
    txn: &PersistenceTransaction<'_, '_>,
) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
    let rows: Vec<(String, DbTargetDocument)> = txn.scan(DOCUMENT_TARGETS_STORE, None, None)?;
    let mut orphaned = Vec::new();
    let mut candidate: Option<(String, ListenSequenceNumber)> = None;
    for (_, row) in rows {
        if row.target_id == 0 {
            if let Some((path, sequence_number)) = candidate.take() {
                orphaned.push((document_key(&path)?, sequence_number));
            }
            candidate = Some((
                row.path,
                row.sequence_number.unwrap_or(INVALID_SEQUENCE_NUMBER),
            ));
        } else {
            candidate = None;
        }
    }
    if let Some((path, sequence_number)) = candidate {
        orphaned.push((document_key(&path)?, sequence_number));
    }
    Ok(orphaned)
}

fn document_key(encoded_path: &str) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_path(decode_resource_path(encoded_path)?)
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Keeps the `max_elements` smallest sequence numbers seen.
struct RollingSequenceNumberBuffer {
    heap: BinaryHeap<ListenSequenceNumber>,
    max_elements: usize,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(max_elements),
            max_elements,
        }
    }

    fn add(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.max_elements {
            self.heap.push(sequence_number);
        } else if self.heap.peek().is_some_and(|max| sequence_number < *max) {
            self.heap.pop();
            self.heap.push(sequence_number);
        }
    }

    fn max_value(&self) -> ListenSequenceNumber {
        self.heap.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    delegate: LruDelegate,
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(delegate: LruDelegate, params: LruParams) -> Self {
        Self { delegate, params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Number of sequence numbers that make up `percentile` percent of the
    /// cache.
    pub fn calculate_target_count(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        percentile: u32,
    ) -> FirestoreResult<usize> {
        let count = self.delegate.get_sequence_number_count(txn)?;
        Ok(count * percentile as usize / 100)
    }

    /// The `n`th smallest sequence number across targets and orphaned
    /// documents.
    pub fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        n: usize,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        for sequence_number in self.delegate.target_sequence_numbers(txn)? {
            buffer.add(sequence_number);
        }
        for sequence_number in self.delegate.orphaned_document_sequence_numbers(txn)? {
            buffer.add(sequence_number);
        }
        Ok(buffer.max_value())
    }

    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
        in_memory_pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("{LOG_TAG}: garbage collection skipped; disabled");
            return Ok(LruResults::default());
        }
        let cache_size = self.delegate.get_cache_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "{LOG_TAG}: garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::default());
        }
        self.run_collection(txn, active_target_ids, in_memory_pins)
    }

    fn run_collection(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        active_target_ids: &BTreeSet<TargetId>,
        in_memory_pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "{LOG_TAG}: capping sequence numbers to collect down to the maximum of {} from {sequence_numbers_to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(txn, sequence_numbers_to_collect)?;
        let targets_removed = self
            .delegate
            .remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed =
            self.delegate
                .remove_orphaned_documents(txn, upper_bound, in_memory_pins)?;
        log::debug!(
            "{LOG_TAG}: collected up to sequence number {upper_bound}: removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        })
    }
}
