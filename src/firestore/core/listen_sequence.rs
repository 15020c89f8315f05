use std::sync::{Arc, Mutex};

use crate::firestore::model::ListenSequenceNumber;

type SequenceNumberHandler = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// Hands out increasing sequence numbers for LRU bookkeeping.
///
/// Clients sharing a cache observe each other's numbers through
/// [`ListenSequence::set_previous_value`], so numbers never go backwards
/// across clients.
pub struct ListenSequence {
    previous: Mutex<ListenSequenceNumber>,
    on_next: Mutex<Option<SequenceNumberHandler>>,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self {
            previous: Mutex::new(previous),
            on_next: Mutex::new(None),
        }
    }

    /// Registers a callback that sees every number this sequence hands out.
    pub fn set_handler(&self, handler: SequenceNumberHandler) {
        *self
            .on_next
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(handler);
    }

    /// Records a number produced elsewhere.
    pub fn set_previous_value(&self, external: ListenSequenceNumber) {
        let mut previous = self
            .previous
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *previous = (*previous).max(external);
    }

    pub fn current(&self) -> ListenSequenceNumber {
        *self
            .previous
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn next(&self) -> ListenSequenceNumber {
        let next = {
            let mut previous = self
                .previous
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            *previous += 1;
            *previous
        };
        let handler = self
            .on_next
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(next);
        }
        next
    }
}

impl std::fmt::Debug for ListenSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenSequence")
            .field("previous", &self.current())
            .finish()
    }
}
