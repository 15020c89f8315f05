use async_trait::async_trait;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKeySet, MutationBatchResult, TargetId};
use crate::firestore::remote::credentials::User;
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks the remote store uses to hand backend results to the sync engine.
///
/// The remote store only holds a weak reference to its syncer; the sync
/// engine owns the remote store.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot from the watch stream.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend rejected the listen for `target_id`.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    /// The write stream acknowledged the oldest outstanding batch.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend permanently rejected the oldest outstanding batch.
    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the target is known to contain on the backend. Limbo targets
    /// report the single document they resolve.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Called with the streams stopped; the syncer switches to `user`.
    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState);
}
