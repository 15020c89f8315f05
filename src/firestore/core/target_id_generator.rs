use crate::firestore::model::TargetId;

/// Generates target ids from disjoint ranges: the target cache uses even ids
/// starting at 2, limbo resolution in the sync engine uses odd ids from 1.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Continues after an id that was already handed out.
    pub fn after(last_id: TargetId) -> Self {
        Self { last_id }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
