pub mod event_manager;
pub mod firestore_client;
pub mod listen_sequence;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod types;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, QueryListener, SnapshotObserver};
pub use firestore_client::{ClientComponents, FirestoreClient};
pub use query::Query;
pub use sync_engine::SyncEngine;
pub use types::{OnlineState, QueryTargetState};
pub use view_snapshot::ViewSnapshot;
