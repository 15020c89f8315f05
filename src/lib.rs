//! Client-side Firestore synchronization engine.
//!
//! The crate keeps a local, transactional cache of documents and queries,
//! applies writes optimistically, synchronizes with the backend over the
//! watch and write streams, and raises consistent query snapshots. Several
//! clients sharing one persistence area coordinate through a primary lease.

pub mod firestore;
pub mod platform;
pub mod util;
