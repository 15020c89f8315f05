//! In-process transactional key-value database.
//!
//! Mirrors the subset of IndexedDB the persistence layer relies on: named
//! object stores holding JSON values under string keys, ordered range scans,
//! a schema version with an upgrade hook, and all-or-nothing transactions.
//! Several clients may open the same [`KvDatabase`] to share one cache.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    data_loss, failed_precondition, internal_error, persistence_transaction_error,
    FirestoreResult,
};

const LOG_TAG: &str = "KvStore";

/// Attempts made for a transaction that fails with a transient error.
pub const TRANSACTION_RETRY_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvTransactionMode {
    ReadOnly,
    ReadWrite,
}

type ObjectStore = BTreeMap<String, JsonValue>;

#[derive(Default)]
struct DbContents {
    version: u32,
    stores: BTreeMap<String, ObjectStore>,
}

/// A named database shared by every client that opens it.
pub struct KvDatabase {
    name: String,
    contents: Mutex<DbContents>,
    /// Number of upcoming transactions that fail as if the backing store
    /// aborted them.
    injected_failures: AtomicUsize,
}

impl KvDatabase {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            contents: Mutex::new(DbContents::default()),
            injected_failures: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.lock().version
    }

    /// Brings the database to `version`, running `upgrade` with the old
    /// version inside one read-write transaction when it is behind.
    pub fn open<F>(&self, version: u32, upgrade: F) -> FirestoreResult<()>
    where
        F: FnOnce(&mut KvTransaction<'_>, u32, u32) -> FirestoreResult<()>,
    {
        let mut contents = self.lock();
        let current = contents.version;
        if current > version {
            return Err(failed_precondition(format!(
                "Database '{}' has version {current}, newer than the supported version {version}",
                self.name
            )));
        }
        if current == version {
            return Ok(());
        }
        log::debug!(
            "{LOG_TAG}: upgrading '{}' from version {current} to {version}",
            self.name
        );
        let mut txn = KvTransaction::new(&mut contents, KvTransactionMode::ReadWrite);
        match upgrade(&mut txn, current, version) {
            Ok(()) => {
                txn.commit();
                contents.version = version;
                Ok(())
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Runs `operation` atomically. Its writes are only visible once it
    /// returns `Ok`; transient failures are retried a bounded number of times.
    pub fn run_transaction<T, F>(
        &self,
        action: &str,
        mode: KvTransactionMode,
        mut operation: F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut KvTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_transaction_once(mode, &mut operation) {
                Err(err)
                    if err.is_persistence_transaction_error()
                        && attempt < TRANSACTION_RETRY_COUNT =>
                {
                    log::debug!(
                        "{LOG_TAG}: transaction '{action}' failed (attempt {attempt}), retrying: {err}"
                    );
                }
                result => return result,
            }
        }
    }

    fn run_transaction_once<T, F>(
        &self,
        mode: KvTransactionMode,
        operation: &mut F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut KvTransaction<'_>) -> FirestoreResult<T>,
    {
        if self.take_injected_failure() {
            return Err(persistence_transaction_error(
                "Transaction aborted by the storage backend",
            ));
        }
        let mut contents = self.lock();
        let mut txn = KvTransaction::new(&mut contents, mode);
        match operation(&mut txn) {
            Ok(value) => {
                txn.commit();
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Makes the next `count` transaction attempts fail with a persistence
    /// transaction error.
    pub fn inject_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, DbContents> {
        self.contents
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

enum UndoEntry {
    Restore {
        store: String,
        key: String,
        previous: Option<JsonValue>,
    },
}

/// Scoped access to the database. Operations are synchronous, so a
/// transaction can never be suspended between its reads and writes.
pub struct KvTransaction<'a> {
    contents: &'a mut DbContents,
    mode: KvTransactionMode,
    undo: Vec<UndoEntry>,
}

impl<'a> KvTransaction<'a> {
    fn new(contents: &'a mut DbContents, mode: KvTransactionMode) -> Self {
        Self {
            contents,
            mode,
            undo: Vec::new(),
        }
    }

    pub fn mode(&self) -> KvTransactionMode {
        self.mode
    }

    pub fn get<T: DeserializeOwned>(&self, store: &str, key: &str) -> FirestoreResult<Option<T>> {
        self.contents
            .stores
            .get(store)
            .and_then(|entries| entries.get(key))
            .map(|value| decode(store, key, value))
            .transpose()
    }

    pub fn contains(&self, store: &str, key: &str) -> bool {
        self.contents
            .stores
            .get(store)
            .is_some_and(|entries| entries.contains_key(key))
    }

    pub fn put<T: Serialize>(&mut self, store: &str, key: &str, value: &T) -> FirestoreResult<()> {
        self.check_writable(store)?;
        let encoded = serde_json::to_value(value)
            .map_err(|err| internal_error(format!("Failed to encode '{store}' entry: {err}")))?;
        let previous = self
            .contents
            .stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), encoded);
        self.undo.push(UndoEntry::Restore {
            store: store.to_string(),
            key: key.to_string(),
            previous,
        });
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: &str) -> FirestoreResult<()> {
        self.check_writable(store)?;
        let previous = self
            .contents
            .stores
            .get_mut(store)
            .and_then(|entries| entries.remove(key));
        if previous.is_some() {
            self.undo.push(UndoEntry::Restore {
                store: store.to_string(),
                key: key.to_string(),
                previous,
            });
        }
        Ok(())
    }

    /// Entries with keys in `[start, end)`, in key order. `None` leaves the
    /// side unbounded.
    pub fn scan<T: DeserializeOwned>(
        &self,
        store: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> FirestoreResult<Vec<(String, T)>> {
        let Some(entries) = self.contents.stores.get(store) else {
            return Ok(Vec::new());
        };
        let lower = start.map_or(Bound::Unbounded, |key| Bound::Included(key.to_string()));
        let upper = end.map_or(Bound::Unbounded, |key| Bound::Excluded(key.to_string()));
        if let (Bound::Included(low), Bound::Excluded(high)) = (&lower, &upper) {
            if low >= high {
                return Ok(Vec::new());
            }
        }
        entries
            .range((lower, upper))
            .map(|(key, value)| Ok((key.clone(), decode(store, key, value)?)))
            .collect()
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        store: &str,
        prefix: &str,
    ) -> FirestoreResult<Vec<(String, T)>> {
        let Some(entries) = self.contents.stores.get(store) else {
            return Ok(Vec::new());
        };
        entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| Ok((key.clone(), decode(store, key, value)?)))
            .collect()
    }

    /// Keys with the given prefix, without decoding their values.
    pub fn keys_with_prefix(&self, store: &str, prefix: &str) -> Vec<String> {
        self.contents
            .stores
            .get(store)
            .map(|entries| {
                entries
                    .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, store: &str) -> usize {
        self.contents.stores.get(store).map_or(0, BTreeMap::len)
    }

    pub fn clear(&mut self, store: &str) -> FirestoreResult<()> {
        let keys: Vec<String> = self
            .contents
            .stores
            .get(store)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.delete(store, &key)?;
        }
        Ok(())
    }

    fn check_writable(&self, store: &str) -> FirestoreResult<()> {
        if self.mode == KvTransactionMode::ReadOnly {
            return Err(internal_error(format!(
                "Write to '{store}' inside a read-only transaction"
            )));
        }
        Ok(())
    }

    fn commit(self) {}

    fn abort(self) {
        for entry in self.undo.into_iter().rev() {
            let UndoEntry::Restore {
                store,
                key,
                previous,
            } = entry;
            let entries = self.contents.stores.entry(store).or_default();
            match previous {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
    }
}

fn decode<T: DeserializeOwned>(store: &str, key: &str, value: &JsonValue) -> FirestoreResult<T> {
    T::deserialize(value)
        .map_err(|err| data_loss(format!("Corrupt '{store}' entry at {key:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::invalid_argument;

    #[test]
    fn committed_writes_are_visible() {
        let db = KvDatabase::new("test");
        db.run_transaction("write", KvTransactionMode::ReadWrite, |txn| {
            txn.put("store", "b", &2)?;
            txn.put("store", "a", &1)
        })
        .unwrap();

        let entries: Vec<(String, i32)> = db
            .run_transaction("read", KvTransactionMode::ReadOnly, |txn| {
                txn.scan("store", None, None)
            })
            .unwrap();
        assert_eq!(entries, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }

    #[test]
    fn failed_transactions_roll_back() {
        let db = KvDatabase::new("test");
        db.run_transaction("seed", KvTransactionMode::ReadWrite, |txn| {
            txn.put("store", "a", &1)
        })
        .unwrap();

        let result: FirestoreResult<()> =
            db.run_transaction("fail", KvTransactionMode::ReadWrite, |txn| {
                txn.put("store", "a", &10)?;
                txn.put("store", "b", &20)?;
                txn.delete("store", "a")?;
                Err(invalid_argument("boom"))
            });
        assert!(result.is_err());

        let entries: Vec<(String, i32)> = db
            .run_transaction("read", KvTransactionMode::ReadOnly, |txn| {
                txn.scan("store", None, None)
            })
            .unwrap();
        assert_eq!(entries, vec![("a".to_string(), 1)]);
    }

    #[test]
    fn transient_failures_are_retried() {
        let db = KvDatabase::new("test");
        db.inject_failures(TRANSACTION_RETRY_COUNT - 1);
        let mut runs = 0;
        db.run_transaction("retry", KvTransactionMode::ReadWrite, |_| {
            runs += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(runs, 1);

        db.inject_failures(TRANSACTION_RETRY_COUNT);
        let err = db
            .run_transaction("give up", KvTransactionMode::ReadWrite, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_persistence_transaction_error());
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let db = KvDatabase::new("test");
        let err = db
            .run_transaction("write", KvTransactionMode::ReadOnly, |txn| {
                txn.put("store", "a", &1)
            })
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Internal);
    }

    #[test]
    fn prefix_and_range_scans() {
        let db = KvDatabase::new("test");
        db.run_transaction("seed", KvTransactionMode::ReadWrite, |txn| {
            for key in ["a/1", "a/2", "b/1", "c"] {
                txn.put("store", key, &key)?;
            }
            Ok(())
        })
        .unwrap();

        db.run_transaction("scan", KvTransactionMode::ReadOnly, |txn| {
            let prefixed: Vec<(String, String)> = txn.scan_prefix("store", "a/")?;
            assert_eq!(prefixed.len(), 2);
            let ranged: Vec<(String, String)> = txn.scan("store", Some("a/2"), Some("c"))?;
            assert_eq!(
                ranged.into_iter().map(|(key, _)| key).collect::<Vec<_>>(),
                vec!["a/2", "b/1"]
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn open_runs_upgrade_once() {
        let db = KvDatabase::new("test");
        let mut upgrades = Vec::new();
        db.open(2, |txn, from, to| {
            upgrades.push((from, to));
            txn.put("meta", "created", &true)
        })
        .unwrap();
        db.open(2, |_, from, to| {
            upgrades.push((from, to));
            Ok(())
        })
        .unwrap();
        assert_eq!(upgrades, vec![(0, 2)]);
        assert_eq!(db.version(), 2);
        assert!(db.open(1, |_, _, _| Ok(())).is_err());
    }
}
