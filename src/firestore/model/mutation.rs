use crate::firestore::model::{
    Document, DocumentKey, DocumentState, FieldMask, FieldPath, MaybeDocument, NoDocument,
    SnapshotVersion, Timestamp, TransformOperation, UnknownDocument,
};
use crate::firestore::value::{FirestoreValue, ObjectValue};
use crate::util::assert::hard_assert;

/// Condition the backend checks before applying a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == matches!(maybe_doc, Some(MaybeDocument::Document(_)))
            }
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Per-mutation outcome reported by the backend in a write response.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: ObjectValue },
    /// Writes the fields in `field_mask`; masked fields missing from `data` are deleted.
    Patch {
        data: ObjectValue,
        field_mask: FieldMask,
    },
    Transform {
        field_transforms: Vec<FieldTransform>,
    },
    Delete,
    /// Checks the precondition without writing anything.
    Verify,
}

/// A change to a single document.
///
/// Local application keeps the base version for sets, patches and transforms
/// and resets it to zero for deletes:
///
/// | mutation  | applied to     | results in     |
/// |-----------|----------------|----------------|
/// | Set       | Document(v3)   | Document(v3)   |
/// | Set       | NoDocument(v3) | Document(v0)   |
/// | Set       | none           | Document(v0)   |
/// | Patch     | Document(v3)   | Document(v3)   |
/// | Patch     | NoDocument(v3) | NoDocument(v3) |
/// | Patch     | none           | none           |
/// | Transform | Document(v3)   | Document(v3)   |
/// | Transform | NoDocument(v3) | NoDocument(v3) |
/// | Transform | none           | none           |
/// | Delete    | Document(v3)   | NoDocument(v0) |
/// | Delete    | NoDocument(v3) | NoDocument(v0) |
/// | Delete    | none           | NoDocument(v0) |
///
/// The patch rows assume the `exists` precondition that updates carry. A
/// merge (no precondition) creates the document at version zero.
///
/// Acknowledged mutations take the version from the write result. When an
/// acknowledged mutation does not fit the cached document, the result is an
/// [`UnknownDocument`] and the watch stream supplies the real contents.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    precondition: Precondition,
    kind: MutationKind,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self::set_with_precondition(key, value, Precondition::None)
    }

    pub fn set_with_precondition(
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    ) -> Self {
        Self {
            key,
            precondition,
            kind: MutationKind::Set { value },
        }
    }

    pub fn patch(
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
    ) -> Self {
        Self {
            key,
            precondition,
            kind: MutationKind::Patch { data, field_mask },
        }
    }

    /// Transforms always require the document to exist: they are paired with
    /// a preceding set or patch that creates it.
    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Self {
            key,
            precondition: Precondition::Exists(true),
            kind: MutationKind::Transform { field_transforms },
        }
    }

    pub fn delete(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            kind: MutationKind::Delete,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            kind: MutationKind::Verify,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match &self.kind {
            MutationKind::Transform { field_transforms } => field_transforms,
            _ => &[],
        }
    }

    fn verify_key_matches(&self, maybe_doc: Option<&MaybeDocument>) {
        if let Some(doc) = maybe_doc {
            hard_assert(
                doc.key() == &self.key,
                "Can only apply a mutation to a document with the same key",
            );
        }
    }

    fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
        match maybe_doc {
            Some(MaybeDocument::Document(doc)) => doc.version(),
            _ => SnapshotVersion::min(),
        }
    }

    /// Computes the cached document after the backend acknowledged this mutation.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> MaybeDocument {
        self.verify_key_matches(maybe_doc);
        match &self.kind {
            MutationKind::Set { value } => Document::new(
                self.key.clone(),
                result.version,
                value.clone(),
                DocumentState::CommittedMutations,
            )
            .into(),
            MutationKind::Patch { data, field_mask } => {
                if !self.precondition.is_valid_for(maybe_doc) {
                    return UnknownDocument::new(self.key.clone(), result.version).into();
                }
                Document::new(
                    self.key.clone(),
                    result.version,
                    patch_object(document_data(maybe_doc), data, field_mask),
                    DocumentState::CommittedMutations,
                )
                .into()
            }
            MutationKind::Transform { field_transforms } => {
                let Some(MaybeDocument::Document(doc)) = maybe_doc else {
                    return UnknownDocument::new(self.key.clone(), result.version).into();
                };
                let server_results = result.transform_results.as_deref().unwrap_or(&[]);
                hard_assert(
                    server_results.len() == field_transforms.len(),
                    format!(
                        "server transform result count ({}) should match field transform count ({})",
                        server_results.len(),
                        field_transforms.len()
                    ),
                );
                let mut data = doc.data().clone();
                for (transform, server_result) in field_transforms.iter().zip(server_results) {
                    let previous = doc.field(&transform.field);
                    let value = transform
                        .operation
                        .apply_to_remote_document(previous, Some(server_result));
                    data.set(&transform.field, value);
                }
                Document::new(
                    self.key.clone(),
                    result.version,
                    data,
                    DocumentState::CommittedMutations,
                )
                .into()
            }
            MutationKind::Delete => {
                NoDocument::new(self.key.clone(), result.version, true).into()
            }
            MutationKind::Verify => match maybe_doc {
                Some(doc) if self.precondition.is_valid_for(maybe_doc) => doc.clone(),
                _ => UnknownDocument::new(self.key.clone(), result.version).into(),
            },
        }
    }

    /// Computes the optimistic local view. `base_doc` is the document before
    /// the batch containing this mutation was applied. A failed precondition
    /// leaves the input untouched.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        self.verify_key_matches(maybe_doc.as_ref());
        if !self.precondition.is_valid_for(maybe_doc.as_ref()) {
            return maybe_doc;
        }

        match &self.kind {
            MutationKind::Set { value } => Some(
                Document::new(
                    self.key.clone(),
                    Self::post_mutation_version(maybe_doc.as_ref()),
                    value.clone(),
                    DocumentState::LocalMutations,
                )
                .into(),
            ),
            MutationKind::Patch { data, field_mask } => {
                let version = Self::post_mutation_version(maybe_doc.as_ref());
                Some(
                    Document::new(
                        self.key.clone(),
                        version,
                        patch_object(document_data(maybe_doc.as_ref()), data, field_mask),
                        DocumentState::LocalMutations,
                    )
                    .into(),
                )
            }
            MutationKind::Transform { field_transforms } => {
                let Some(MaybeDocument::Document(doc)) = maybe_doc else {
                    return maybe_doc;
                };
                let mut data = doc.data().clone();
                for transform in field_transforms {
                    let previous = doc.field(&transform.field).or_else(|| {
                        // A patch earlier in the batch may have cleared the
                        // field; fall back to the pre-batch value.
                        base_doc
                            .and_then(MaybeDocument::as_document)
                            .and_then(|base| base.field(&transform.field))
                    });
                    let value = transform
                        .operation
                        .apply_to_local_view(previous, local_write_time);
                    data.set(&transform.field, value);
                }
                Some(
                    Document::new(
                        self.key.clone(),
                        doc.version(),
                        data,
                        DocumentState::LocalMutations,
                    )
                    .into(),
                )
            }
            MutationKind::Delete => {
                Some(NoDocument::new(self.key.clone(), SnapshotVersion::min(), false).into())
            }
            MutationKind::Verify => maybe_doc,
        }
    }

    /// Sparse object holding the pre-transform values of every non-idempotent
    /// field transform, or `None` when the mutation replays safely as is.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let MutationKind::Transform { field_transforms } = &self.kind else {
            return None;
        };
        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base: Option<ObjectValue> = None;
        for transform in field_transforms {
            let existing = doc.and_then(|doc| doc.field(&transform.field));
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base.get_or_insert_with(ObjectValue::empty)
                    .set(&transform.field, value);
            }
        }
        base
    }
}

fn document_data(maybe_doc: Option<&MaybeDocument>) -> ObjectValue {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.data().clone(),
        _ => ObjectValue::empty(),
    }
}

fn patch_object(mut target: ObjectValue, data: &ObjectValue, field_mask: &FieldMask) -> ObjectValue {
    for path in field_mask.fields() {
        match data.field(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn doc(version: i64, entries: &[(&str, FirestoreValue)]) -> MaybeDocument {
        Document::synced(key(), SnapshotVersion::from_micros(version), object(entries)).into()
    }

    fn now() -> Timestamp {
        Timestamp::new(100, 0)
    }

    #[test]
    fn set_keeps_version_locally_and_resets_on_missing_docs() {
        let set = Mutation::set(key(), object(&[("a", 1i64.into())]));
        let applied = set
            .apply_to_local_view(Some(doc(3, &[])), None, now())
            .unwrap();
        assert_eq!(applied.version(), SnapshotVersion::from_micros(3));
        assert!(applied.has_pending_writes());

        let deleted: MaybeDocument =
            NoDocument::new(key(), SnapshotVersion::from_micros(3), false).into();
        let created = set.apply_to_local_view(Some(deleted), None, now()).unwrap();
        assert_eq!(created.version(), SnapshotVersion::min());
        assert!(set.apply_to_local_view(None, None, now()).unwrap().is_document());
    }

    #[test]
    fn update_patch_does_not_create_documents() {
        let patch = Mutation::patch(
            key(),
            object(&[("a", 1i64.into())]),
            FieldMask::new(vec![path("a")]),
            Precondition::Exists(true),
        );
        assert!(patch.apply_to_local_view(None, None, now()).is_none());
        let deleted: MaybeDocument =
            NoDocument::new(key(), SnapshotVersion::from_micros(3), false).into();
        assert_eq!(
            patch.apply_to_local_view(Some(deleted.clone()), None, now()),
            Some(deleted)
        );
    }

    #[test]
    fn merge_patch_creates_missing_documents() {
        let merge = Mutation::patch(
            key(),
            object(&[("a", 1i64.into())]),
            FieldMask::new(vec![path("a")]),
            Precondition::None,
        );
        let created = merge.apply_to_local_view(None, None, now()).unwrap();
        assert_eq!(created.version(), SnapshotVersion::min());
        assert_eq!(
            created.as_document().unwrap().field(&path("a")),
            Some(&1i64.into())
        );
    }

    #[test]
    fn patch_merges_masked_fields_and_deletes_missing_ones() {
        let patch = Mutation::patch(
            key(),
            object(&[("y", 2i64.into())]),
            FieldMask::new(vec![path("y"), path("gone")]),
            Precondition::Exists(true),
        );
        let base = doc(5, &[("x", 9i64.into()), ("gone", true.into())]);
        let applied = patch.apply_to_local_view(Some(base), None, now()).unwrap();
        let applied = applied.as_document().unwrap();
        assert_eq!(applied.field(&path("x")), Some(&9i64.into()));
        assert_eq!(applied.field(&path("y")), Some(&2i64.into()));
        assert_eq!(applied.field(&path("gone")), None);
        assert_eq!(applied.version(), SnapshotVersion::from_micros(5));
    }

    #[test]
    fn failed_precondition_on_ack_yields_unknown_document() {
        let patch = Mutation::patch(
            key(),
            object(&[("a", 1i64.into())]),
            FieldMask::new(vec![path("a")]),
            Precondition::Exists(true),
        );
        let result = MutationResult::new(SnapshotVersion::from_micros(7), None);
        let applied = patch.apply_to_remote_document(None, &result);
        assert_eq!(
            applied,
            UnknownDocument::new(key(), SnapshotVersion::from_micros(7)).into()
        );
    }

    #[test]
    fn delete_resets_version_locally() {
        let delete = Mutation::delete(key(), Precondition::None);
        let applied = delete
            .apply_to_local_view(Some(doc(3, &[])), None, now())
            .unwrap();
        assert_eq!(applied, NoDocument::new(key(), SnapshotVersion::min(), false).into());

        let acked = delete.apply_to_remote_document(
            Some(&doc(3, &[])),
            &MutationResult::new(SnapshotVersion::from_micros(9), None),
        );
        assert!(acked.has_committed_mutations());
        assert_eq!(acked.version(), SnapshotVersion::from_micros(9));
    }

    #[test]
    fn transform_uses_server_results_on_ack() {
        let transform = Mutation::transform(
            key(),
            vec![
                FieldTransform::new(path("count"), TransformOperation::NumericIncrement(1i64.into())),
                FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
            ],
        );
        let base = doc(2, &[("count", 4i64.into())]);
        let local = transform
            .apply_to_local_view(Some(base.clone()), None, now())
            .unwrap();
        let local_doc = local.as_document().unwrap();
        assert_eq!(local_doc.field(&path("count")), Some(&5i64.into()));
        assert!(local_doc.field(&path("at")).unwrap().is_server_timestamp());

        let server_time = FirestoreValue::from_timestamp(Timestamp::new(200, 0));
        let result = MutationResult::new(
            SnapshotVersion::from_micros(8),
            Some(vec![10i64.into(), server_time.clone()]),
        );
        let acked = transform.apply_to_remote_document(Some(&base), &result);
        let acked = acked.as_document().unwrap();
        assert_eq!(acked.field(&path("count")), Some(&10i64.into()));
        assert_eq!(acked.field(&path("at")), Some(&server_time));
        assert!(acked.has_committed_mutations());
    }

    #[test]
    fn transform_falls_back_to_pre_batch_value() {
        let transform = Mutation::transform(
            key(),
            vec![FieldTransform::new(
                path("m.n"),
                TransformOperation::NumericIncrement(1i64.into()),
            )],
        );
        let cleared = doc(1, &[("m", FirestoreValue::from_map(BTreeMap::new()))]);
        let before = doc(1, &[("m.n", 41i64.into())]);
        let applied = transform
            .apply_to_local_view(Some(cleared), Some(&before), now())
            .unwrap();
        assert_eq!(
            applied.as_document().unwrap().field(&path("m.n")),
            Some(&42i64.into())
        );
    }

    #[test]
    fn extracts_base_values_only_for_increments() {
        let transform = Mutation::transform(
            key(),
            vec![
                FieldTransform::new(path("n"), TransformOperation::NumericIncrement(1i64.into())),
                FieldTransform::new(path("t"), TransformOperation::ServerTimestamp),
            ],
        );
        let base = transform
            .extract_base_value(Some(&doc(1, &[("n", "text".into())])))
            .unwrap();
        assert_eq!(base.field(&path("n")), Some(&0i64.into()));
        assert_eq!(base.field(&path("t")), None);
        assert!(Mutation::delete(key(), Precondition::None)
            .extract_base_value(None)
            .is_none());
    }

    #[test]
    fn verify_is_a_local_no_op() {
        let verify = Mutation::verify(key(), Precondition::Exists(true));
        let base = doc(4, &[("a", 1i64.into())]);
        assert_eq!(
            verify.apply_to_local_view(Some(base.clone()), None, now()),
            Some(base.clone())
        );
        let result = MutationResult::new(SnapshotVersion::from_micros(6), None);
        assert_eq!(verify.apply_to_remote_document(Some(&base), &result), base);
        assert_eq!(
            verify.apply_to_remote_document(None, &result),
            UnknownDocument::new(key(), SnapshotVersion::from_micros(6)).into()
        );
    }
}
