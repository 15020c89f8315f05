use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::encoded_resource_path::encode_resource_path;
use crate::firestore::local::schema::{
    DbMutationBatch, DbNoDocument, DbRemoteDocument, DbTarget, DbUnknownDocument,
};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, DocumentState, MaybeDocument, MutationBatch, NoDocument, SnapshotVersion, Timestamp,
    UnknownDocument,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::BytesValue;

/// Converts model types to the records kept in persistence.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn to_db_remote_document(
        &self,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> DbRemoteDocument {
        let parent_path = encode_resource_path(&doc.key().path().without_last());
        let mut record = DbRemoteDocument {
            unknown_document: None,
            no_document: None,
            document: None,
            has_committed_mutations: doc.has_committed_mutations(),
            read_time: Some(read_time.timestamp()),
            parent_path,
        };
        match doc {
            MaybeDocument::Document(document) => {
                record.document = Some(self.remote.encode_document(document));
            }
            MaybeDocument::NoDocument(no_document) => {
                record.no_document = Some(DbNoDocument {
                    read_time: no_document.version().timestamp(),
                });
            }
            MaybeDocument::Unknown(unknown) => {
                record.unknown_document = Some(DbUnknownDocument {
                    version: unknown.version().timestamp(),
                });
            }
        }
        record
    }

    pub fn from_db_remote_document(
        &self,
        key: &DocumentKey,
        record: &DbRemoteDocument,
    ) -> FirestoreResult<MaybeDocument> {
        if let Some(document) = &record.document {
            let decoded = self.remote.decode_document(document)?;
            let state = if record.has_committed_mutations {
                DocumentState::CommittedMutations
            } else {
                DocumentState::Synced
            };
            let version = decoded.version();
            return Ok(Document::new(
                decoded.key().clone(),
                version,
                decoded.into_data(),
                state,
            )
            .into());
        }
        if let Some(no_document) = &record.no_document {
            return Ok(NoDocument::new(
                key.clone(),
                SnapshotVersion::new(no_document.read_time),
                record.has_committed_mutations,
            )
            .into());
        }
        if let Some(unknown) = &record.unknown_document {
            return Ok(UnknownDocument::new(
                key.clone(),
                SnapshotVersion::new(unknown.version),
            )
            .into());
        }
        Err(data_loss(format!(
            "Remote document record for {key} has no content"
        )))
    }

    pub fn to_db_mutation_batch(&self, user_id: &str, batch: &MutationBatch) -> DbMutationBatch {
        DbMutationBatch {
            user_id: user_id.to_string(),
            batch_id: batch.batch_id,
            local_write_time: batch.local_write_time,
            base_mutations: batch
                .base_mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        }
    }

    pub fn from_db_mutation_batch(&self, record: &DbMutationBatch) -> FirestoreResult<MutationBatch> {
        let base_mutations = record
            .base_mutations
            .iter()
            .map(|value| self.remote.decode_mutation(value))
            .collect::<FirestoreResult<Vec<_>>>()?;
        let mutations = record
            .mutations
            .iter()
            .map(|value| self.remote.decode_mutation(value))
            .collect::<FirestoreResult<Vec<_>>>()?;
        if mutations.is_empty() {
            return Err(data_loss(format!(
                "Mutation batch {} has no mutations",
                record.batch_id
            )));
        }
        Ok(MutationBatch::new(
            record.batch_id,
            record.local_write_time,
            base_mutations,
            mutations,
        ))
    }

    pub fn to_db_target(&self, target_data: &TargetData) -> DbTarget {
        let query = if target_data.target.is_document_query() {
            self.remote.encode_documents_target(&target_data.target)
        } else {
            self.remote.encode_query_target(&target_data.target)
        };
        DbTarget {
            target_id: target_data.target_id,
            canonical_id: target_data.target.canonical_id(),
            read_time: target_data.snapshot_version.timestamp(),
            resume_token: target_data.resume_token.to_base64(),
            last_listen_sequence_number: target_data.sequence_number,
            last_limbo_free_snapshot_version: target_data
                .last_limbo_free_snapshot_version
                .timestamp(),
            query,
        }
    }

    pub fn from_db_target(&self, record: &DbTarget) -> FirestoreResult<TargetData> {
        let target = if record.query.get("documents").is_some() {
            self.remote.decode_documents_target(&record.query)?
        } else {
            self.remote.decode_query_target(&record.query)?
        };
        let resume_token = BytesValue::from_base64(&record.resume_token)
            .map_err(|err| data_loss(format!("Corrupt resume token: {err}")))?;
        Ok(TargetData::new(
            target,
            record.target_id,
            TargetPurpose::Listen,
            record.last_listen_sequence_number,
        )
        .with_resume_token(resume_token, SnapshotVersion::new(record.read_time))
        .with_last_limbo_free_snapshot_version(SnapshotVersion::new(
            record.last_limbo_free_snapshot_version,
        )))
    }
}

/// Read time recorded for a cache entry; entries written before read times
/// existed report the minimum.
pub fn record_read_time(record: &DbRemoteDocument) -> SnapshotVersion {
    SnapshotVersion::new(record.read_time.unwrap_or_else(Timestamp::default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::{
        DatabaseId, FieldMask, FieldPath, Mutation, Precondition, ResourcePath,
    };
    use crate::firestore::value::ObjectValue;

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data() -> ObjectValue {
        let mut value = ObjectValue::empty();
        value.set(&FieldPath::from_single("n"), 7i64.into());
        value
    }

    #[test]
    fn remote_documents_keep_their_variant() {
        let serializer = serializer();
        let version = SnapshotVersion::from_micros(5_000_000);
        let docs: Vec<MaybeDocument> = vec![
            Document::new(key("c/a"), version, data(), DocumentState::CommittedMutations).into(),
            NoDocument::new(key("c/b"), version, false).into(),
            UnknownDocument::new(key("c/c"), version).into(),
        ];
        for doc in docs {
            let record = serializer.to_db_remote_document(&doc, version);
            assert_eq!(record.read_time, Some(version.timestamp()));
            let decoded = serializer
                .from_db_remote_document(doc.key(), &record)
                .unwrap();
            assert_eq!(decoded, doc);
        }
    }

    #[test]
    fn mutation_batches_keep_base_mutations() {
        let serializer = serializer();
        let batch = MutationBatch::new(
            4,
            Timestamp::new(10, 0),
            vec![Mutation::patch(
                key("c/a"),
                data(),
                FieldMask::new(vec![FieldPath::from_single("n")]),
                Precondition::Exists(true),
            )],
            vec![Mutation::delete(key("c/a"), Precondition::None)],
        );
        let record = serializer.to_db_mutation_batch("alice", &batch);
        assert_eq!(record.user_id, "alice");
        assert_eq!(serializer.from_db_mutation_batch(&record).unwrap(), batch);
    }

    #[test]
    fn targets_restore_resume_state() {
        let serializer = serializer();
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_data = TargetData::new(target, 2, TargetPurpose::Listen, 9)
            .with_resume_token(
                BytesValue::new(vec![1, 2, 3]),
                SnapshotVersion::from_micros(3_000_000),
            );
        let record = serializer.to_db_target(&target_data);
        assert_eq!(record.canonical_id, target_data.target.canonical_id());
        assert_eq!(serializer.from_db_target(&record).unwrap(), target_data);

        let doc_target = TargetData::new(
            crate::firestore::core::target::Target::for_document(&key("rooms/a")),
            4,
            TargetPurpose::Listen,
            1,
        );
        let record = serializer.to_db_target(&doc_target);
        assert_eq!(serializer.from_db_target(&record).unwrap(), doc_target);
    }
}
