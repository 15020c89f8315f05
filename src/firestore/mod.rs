pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

pub use self::core::firestore_client::FirestoreClient;
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{ClientSettings, LruParams, CACHE_SIZE_UNLIMITED};
