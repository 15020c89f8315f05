use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::DatabaseId;

/// Passing this as `cache_size_bytes` disables LRU collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Names the shared persistence area; clients with the same key coordinate.
    pub persistence_key: String,
    pub database_id: DatabaseId,
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    /// Share persistence with other clients and elect a primary among them.
    pub synchronize_tabs: bool,
    /// Unique id of this client inside the persistence area.
    pub client_id: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            persistence_key: "[DEFAULT]".to_string(),
            database_id: DatabaseId::default("test-project"),
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            synchronize_tabs: false,
            client_id: generate_client_id(),
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be positive",
            ));
        }
        if self.client_id.is_empty() {
            return Err(invalid_argument("client_id cannot be empty"));
        }
        Ok(())
    }

    pub fn lru_params(&self) -> LruParams {
        LruParams::with_cache_size(self.cache_size_bytes)
    }
}

/// Tuning knobs for the LRU garbage collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection is skipped while the cache is smaller than this.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE_BYTES)
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != CACHE_SIZE_UNLIMITED
    }
}

/// Random 20 character alphanumeric id, the format used for client ids.
pub fn generate_client_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = ClientSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.client_id.len(), 20);
        assert!(settings.lru_params().is_enabled());
        assert_eq!(settings.lru_params().percentile_to_collect, 10);
    }

    #[test]
    fn rejects_tiny_caches_but_allows_unlimited() {
        let mut settings = ClientSettings {
            cache_size_bytes: 1_000,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.cache_size_bytes = CACHE_SIZE_UNLIMITED;
        settings.validate().unwrap();
        assert!(!settings.lru_params().is_enabled());
    }
}
