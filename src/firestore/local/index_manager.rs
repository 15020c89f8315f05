use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_resource_path::{
    composite_prefix, decode_resource_path, encode_resource_path, KEY_SEPARATOR,
};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{collection_parent_key, COLLECTION_PARENTS_STORE};
use crate::firestore::model::ResourcePath;

/// Remembers every parent path under which a collection id was seen, so
/// collection group queries can be answered one collection at a time.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    /// Records `collection_path` (an odd-length path) in the index.
    pub fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction<'_, '_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = encode_resource_path(&collection_path.without_last());
        let key = collection_parent_key(collection_id, &parent);
        if !txn.contains(COLLECTION_PARENTS_STORE, &key) {
            txn.put(COLLECTION_PARENTS_STORE, &key, &())?;
        }
        Ok(())
    }

    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_, '_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let prefix = composite_prefix(&[collection_id]);
        txn.keys_with_prefix(COLLECTION_PARENTS_STORE, &prefix)
            .into_iter()
            .map(|key| {
                let encoded_parent = key
                    .rsplit(KEY_SEPARATOR)
                    .next()
                    .unwrap_or_default();
                decode_resource_path(encoded_parent)
            })
            .collect()
    }
}
