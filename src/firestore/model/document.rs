use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, ObjectValue};
use crate::util::{SortedMap, SortedSet};

pub type DocumentKeySet = SortedSet<DocumentKey>;
pub type MaybeDocumentMap = SortedMap<DocumentKey, MaybeDocument>;
pub type DocumentMap = SortedMap<DocumentKey, Document>;

/// Write status of an existing document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    /// Matches what the backend last reported.
    Synced,
    /// Reflects mutations that have not been acknowledged yet.
    LocalMutations,
    /// Reflects acknowledged mutations the watch stream has not caught up with.
    CommittedMutations,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: ObjectValue,
    state: DocumentState,
}

impl Document {
    pub fn new(
        key: DocumentKey,
        version: SnapshotVersion,
        data: ObjectValue,
        state: DocumentState,
    ) -> Self {
        Self {
            key,
            version,
            data,
            state,
        }
    }

    pub fn synced(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        Self::new(key, version, data, DocumentState::Synced)
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn into_data(self) -> ObjectValue {
        self.data
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::LocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::CommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.state != DocumentState::Synced
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion, has_committed_mutations: bool) -> Self {
        Self {
            key,
            version,
            has_committed_mutations,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document known to exist at `version` whose contents are not cached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

/// What the client knows about one key at a given version.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    Unknown(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::Unknown(doc) => doc.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::Unknown(doc) => doc.version(),
        }
    }

    /// Unknown documents only ever come from acknowledged writes, so they
    /// always count as pending.
    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    pub fn has_committed_mutations(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_committed_mutations(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(_))
    }
}

impl From<Document> for MaybeDocument {
    fn from(doc: Document) -> Self {
        MaybeDocument::Document(doc)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(doc: NoDocument) -> Self {
        MaybeDocument::NoDocument(doc)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(doc: UnknownDocument) -> Self {
        MaybeDocument::Unknown(doc)
    }
}

pub fn document_key_set<I: IntoIterator<Item = DocumentKey>>(keys: I) -> DocumentKeySet {
    keys.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_write_flags() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let version = SnapshotVersion::from_micros(1);
        let local = Document::new(
            key.clone(),
            version,
            ObjectValue::empty(),
            DocumentState::LocalMutations,
        );
        assert!(local.has_pending_writes());
        assert!(!Document::synced(key.clone(), version, ObjectValue::empty()).has_pending_writes());

        let unknown: MaybeDocument = UnknownDocument::new(key.clone(), version).into();
        assert!(unknown.has_pending_writes());
        let deleted: MaybeDocument = NoDocument::new(key.clone(), version, false).into();
        assert!(!deleted.has_pending_writes());
        assert_eq!(deleted.key(), &key);
    }
}
