use crate::firestore::core::target::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

/// Why the client is listening to a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// A user query re-listened after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// A single document watched to resolve its limbo state.
    LimboResolution,
}

/// A target together with everything the client tracks about it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Sequence number of the last transaction that used this target.
    pub sequence_number: ListenSequenceNumber,
    /// Latest version for which the backend sent a consistent snapshot.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the target was current and had no limbo
    /// documents. Used to re-run the query from cached documents only.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque backend token used to resume the target. Empty when unknown.
    pub resume_token: BytesValue,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: BytesValue::empty(),
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(&self, resume_token: BytesValue, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
