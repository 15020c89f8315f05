pub mod assert;
pub mod async_queue;
pub mod backoff;
pub mod sorted_map;
pub mod sorted_set;

pub use assert::{assertion_error, fail, hard_assert};
pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use sorted_map::{Comparator, SortedMap};
pub use sorted_set::SortedSet;
