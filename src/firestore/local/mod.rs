pub mod encoded_resource_path;
pub mod index_manager;
pub mod kv_store;
pub mod local_documents_view;
pub mod local_serializer;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod lru_scheduler;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod schema;
pub mod shared_client_state;
pub mod target_cache;
pub mod target_data;
pub mod web_storage;

#[cfg(test)]
pub(crate) mod test_helpers;

#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruResults};
#[doc(inline)]
pub use lru_scheduler::LruScheduler;
#[doc(inline)]
pub use persistence::{Persistence, PersistenceParams, TransactionMode};
#[doc(inline)]
pub use shared_client_state::{
    MemorySharedClientState, SharedClientState, SharedClientStateSyncer,
    WebStorageSharedClientState,
};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
#[doc(inline)]
pub use web_storage::WebStorageArea;
