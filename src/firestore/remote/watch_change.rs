use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::rpc_error::decode_status;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::BytesValue;

/// One decoded message of the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document was added, changed, deleted or removed from some targets.
///
/// `new_doc` is a `Document` for changes, a `NoDocument` for deletes and
/// `None` when the document merely left the targets.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MaybeDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: BytesValue,
    /// Set when a `Removed` change reports that the backend rejected the target.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: BytesValue::empty(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: BytesValue) -> Self {
        self.resume_token = resume_token;
        self
    }
}

/// Number of documents the backend holds for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i64,
}

/// Decodes a `ListenResponse`. Unknown message kinds are reported as errors.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change);
    }
    if let Some(document_change) = value.get("documentChange") {
        let document = document_change
            .get("document")
            .ok_or_else(|| invalid_argument("documentChange without a document"))?;
        let doc = serializer.decode_document(document)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: target_ids(document_change.get("targetIds")),
            removed_target_ids: target_ids(document_change.get("removedTargetIds")),
            key: doc.key().clone(),
            new_doc: Some(doc.into()),
        }));
    }
    if let Some(document_delete) = value.get("documentDelete") {
        let key = document_key(serializer, document_delete)?;
        let read_time = serializer.decode_version(document_delete.get("readTime"))?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(document_delete.get("removedTargetIds")),
            new_doc: Some(NoDocument::new(key.clone(), read_time, false).into()),
            key,
        }));
    }
    if let Some(document_remove) = value.get("documentRemove") {
        let key = document_key(serializer, document_remove)?;
        return Ok(WatchChange::Document(DocumentWatchChange {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids(document_remove.get("removedTargetIds")),
            key,
            new_doc: None,
        }));
    }
    if let Some(filter) = value.get("filter") {
        let target_id = filter
            .get("targetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| invalid_argument("filter missing targetId"))?;
        let count = filter.get("count").and_then(JsonValue::as_i64).unwrap_or(0);
        return Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id: target_id as TargetId,
            count,
        }));
    }
    Err(invalid_argument(format!("Unknown watch change: {value}")))
}

/// Version of the consistent snapshot a message completes. Only a target
/// change that names no targets carries a global snapshot version.
pub fn decode_snapshot_version(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !target_ids(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    serializer.decode_version(target_change.get("readTime"))
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let state = match value.get("targetChangeType").and_then(JsonValue::as_str) {
        None | Some("NO_CHANGE") => WatchTargetChangeState::NoChange,
        Some("ADD") => WatchTargetChangeState::Added,
        Some("REMOVE") => WatchTargetChangeState::Removed,
        Some("CURRENT") => WatchTargetChangeState::Current,
        Some("RESET") => WatchTargetChangeState::Reset,
        Some(other) => {
            return Err(invalid_argument(format!(
                "Unknown target change type {other}"
            )))
        }
    };
    Ok(WatchChange::Target(WatchTargetChange {
        state,
        target_ids: target_ids(value.get("targetIds")),
        resume_token: serializer.decode_bytes(value.get("resumeToken"))?,
        cause: value.get("cause").and_then(decode_status),
    }))
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Watch change without a document name"))?;
    serializer.decode_key(name)
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    const DOC: &str = "projects/project/databases/(default)/documents/rooms/eros";

    #[test]
    fn decodes_target_change_with_cause() {
        let change = decode_watch_change(
            &serializer(),
            &json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [2],
                    "resumeToken": "AQID",
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .unwrap();
        match change {
            WatchChange::Target(change) => {
                assert_eq!(change.state, WatchTargetChangeState::Removed);
                assert_eq!(change.target_ids, vec![2]);
                assert_eq!(change.resume_token.as_slice(), &[1, 2, 3]);
                assert_eq!(
                    change.cause.map(|cause| cause.code),
                    Some(FirestoreErrorCode::PermissionDenied)
                );
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_document_messages() {
        let serializer = serializer();
        let change = decode_watch_change(
            &serializer,
            &json!({
                "documentChange": {
                    "document": { "name": DOC, "updateTime": "1970-01-01T00:00:05Z" },
                    "targetIds": [2, 4],
                    "removedTargetIds": [6]
                }
            }),
        )
        .unwrap();
        let WatchChange::Document(change) = change else {
            panic!("expected a document change");
        };
        assert_eq!(change.updated_target_ids, vec![2, 4]);
        assert_eq!(change.removed_target_ids, vec![6]);
        assert!(change.new_doc.unwrap().is_document());

        let delete = decode_watch_change(
            &serializer,
            &json!({
                "documentDelete": {
                    "document": DOC,
                    "readTime": "1970-01-01T00:00:06Z",
                    "removedTargetIds": [2]
                }
            }),
        )
        .unwrap();
        let WatchChange::Document(delete) = delete else {
            panic!("expected a document change");
        };
        let deleted = delete.new_doc.unwrap();
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), SnapshotVersion::from_micros(6_000_000));

        let remove = decode_watch_change(
            &serializer,
            &json!({ "documentRemove": { "document": DOC, "removedTargetIds": [2] } }),
        )
        .unwrap();
        let WatchChange::Document(remove) = remove else {
            panic!("expected a document change");
        };
        assert!(remove.new_doc.is_none());
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({
            "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "1970-01-01T00:00:07Z" }
        });
        assert_eq!(
            decode_snapshot_version(&serializer, &global).unwrap(),
            SnapshotVersion::from_micros(7_000_000)
        );
        let scoped = json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "readTime": "1970-01-01T00:00:07Z"
            }
        });
        assert!(decode_snapshot_version(&serializer, &scoped)
            .unwrap()
            .is_min());
    }
}
