use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MaybeDocument, MaybeDocumentMap, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};
use crate::firestore::value::BytesValue;
use crate::util::assert::hard_assert;
use crate::util::SortedMap;

pub type BatchId = i32;

/// Id used before any batch has been written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by one user operation, applied atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Patches pinning the pre-write values of non-idempotent transforms.
    /// They are applied before `mutations` whenever the local view is rebuilt
    /// and are never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "Cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged results of this batch to `maybe_doc`.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        if let Some(doc) = maybe_doc.as_ref() {
            hard_assert(
                doc.key() == key,
                format!("apply_to_remote_document: key {key} doesn't match {}", doc.key()),
            );
        }
        let results = &batch_result.mutation_results;
        hard_assert(
            results.len() == self.mutations.len(),
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            ),
        );

        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current.as_ref(), result));
            }
        }
        current
    }

    /// Replays the batch on top of `maybe_doc` for the optimistic local view.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        if let Some(doc) = maybe_doc.as_ref() {
            hard_assert(
                doc.key() == key,
                format!("apply_to_local_view: key {key} doesn't match {}", doc.key()),
            );
        }

        // Base mutations first, so transforms see the values captured at
        // write time; both passes use the pre-batch document as their base.
        let base_doc = maybe_doc.clone();
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == key {
                current = mutation.apply_to_local_view(
                    current,
                    base_doc.as_ref(),
                    self.local_write_time,
                );
            }
        }
        current
    }

    /// Applies the batch to every document it touches in `docs`.
    pub fn apply_to_local_document_set(&self, docs: MaybeDocumentMap) -> MaybeDocumentMap {
        let mut result = docs.clone();
        for key in self.keys().iter() {
            let current = docs.get(key).cloned();
            match self.apply_to_local_view(key, current) {
                Some(updated) => result = result.insert(key.clone(), updated),
                None => result = result.remove(key),
            }
        }
        result
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }
}

/// Outcome of writing a [`MutationBatch`] to the backend.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: BytesValue,
    /// Version each touched document was written at.
    pub doc_versions: SortedMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: BytesValue,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}
