//! Process-wide key/value area shared by clients using the same persistence.
//!
//! Writes are broadcast to every other attached client as [`StorageEvent`]s,
//! the way browsers notify other tabs about `localStorage` changes. The
//! writing client never sees its own events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A change made by another client. `new_value` is `None` for removals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
}

pub type StorageListener = Arc<dyn Fn(StorageEvent) + Send + Sync>;

/// Identifies one attached client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageHandle(u64);

#[derive(Default)]
pub struct WebStorageArea {
    items: Mutex<BTreeMap<String, String>>,
    listeners: Mutex<Vec<(StorageHandle, StorageListener)>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for WebStorageArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebStorageArea")
            .field("items", &self.items().len())
            .finish_non_exhaustive()
    }
}

impl WebStorageArea {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a client without subscribing it to events.
    pub fn attach(&self) -> StorageHandle {
        StorageHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_listener(&self, handle: StorageHandle, listener: StorageListener) {
        self.listeners().push((handle, listener));
    }

    pub fn remove_listener(&self, handle: StorageHandle) {
        self.listeners().retain(|(owner, _)| *owner != handle);
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    pub fn set_item(&self, writer: StorageHandle, key: &str, value: &str) {
        self.items().insert(key.to_string(), value.to_string());
        self.broadcast(
            writer,
            StorageEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
            },
        );
    }

    pub fn remove_item(&self, writer: StorageHandle, key: &str) {
        if self.items().remove(key).is_some() {
            self.broadcast(
                writer,
                StorageEvent {
                    key: key.to_string(),
                    new_value: None,
                },
            );
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.items().keys().cloned().collect()
    }

    fn broadcast(&self, writer: StorageHandle, event: StorageEvent) {
        let recipients: Vec<StorageListener> = self
            .listeners()
            .iter()
            .filter(|(owner, _)| *owner != writer)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in recipients {
            listener(event.clone());
        }
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.items.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(StorageHandle, StorageListener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_do_not_see_their_own_events() {
        let area = WebStorageArea::new();
        let first = area.attach();
        let second = area.attach();
        let seen: Arc<Mutex<Vec<(u64, StorageEvent)>>> = Arc::default();
        for (id, handle) in [(1, first), (2, second)] {
            let seen = Arc::clone(&seen);
            area.add_listener(
                handle,
                Arc::new(move |event| seen.lock().unwrap().push((id, event))),
            );
        }

        area.set_item(first, "k", "v");
        area.remove_item(second, "k");
        area.remove_item(second, "missing");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (
                    2,
                    StorageEvent {
                        key: "k".into(),
                        new_value: Some("v".into())
                    }
                ),
                (
                    1,
                    StorageEvent {
                        key: "k".into(),
                        new_value: None
                    }
                ),
            ]
        );
        assert_eq!(area.get_item("k"), None);
    }
}
