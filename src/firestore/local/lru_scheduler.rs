use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_garbage_collector::LruGarbageCollector;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "LruGarbageCollector";

/// Delay before the first collection after the client becomes primary.
pub const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
/// Delay between later collections.
pub const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

/// Runs [`LruGarbageCollector`] passes on the async queue while this client
/// holds the primary lease.
pub struct LruScheduler {
    garbage_collector: Arc<LruGarbageCollector>,
    queue: AsyncQueue,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    local_store: Option<Weak<LocalStore>>,
    gc_task: Option<DelayedOperation>,
}

impl LruScheduler {
    pub fn new(garbage_collector: LruGarbageCollector, queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            garbage_collector: Arc::new(garbage_collector),
            queue,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_started(&self) -> bool {
        self.state().gc_task.is_some()
    }

    pub fn start(self: &Arc<Self>, local_store: &Arc<LocalStore>) {
        if !self.garbage_collector.params().is_enabled() {
            log::debug!("{LOG_TAG}: garbage collection disabled by cache size setting");
            return;
        }
        self.state().local_store = Some(Arc::downgrade(local_store));
        self.schedule_gc(INITIAL_GC_DELAY);
    }

    pub fn stop(&self) {
        let task = {
            let mut state = self.state();
            state.local_store = None;
            state.gc_task.take()
        };
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn schedule_gc(self: &Arc<Self>, delay: Duration) {
        if self.state().gc_task.is_some() {
            return;
        }
        log::debug!("{LOG_TAG}: garbage collection scheduled in {}s", delay.as_secs());
        let weak = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                let local_store = {
                    let mut state = scheduler.state();
                    state.gc_task = None;
                    state.local_store.as_ref().and_then(Weak::upgrade)
                };
                let Some(local_store) = local_store else {
                    return;
                };
                scheduler.run_once(&local_store).await;
                let still_running = scheduler.state().local_store.is_some();
                if still_running {
                    scheduler.schedule_gc(REGULAR_GC_DELAY);
                }
            });
        self.state().gc_task = Some(task);
    }

    async fn run_once(&self, local_store: &LocalStore) {
        match local_store.collect_garbage(&self.garbage_collector).await {
            Ok(results) if results.did_run => log::debug!(
                "{LOG_TAG}: removed {} targets and {} documents",
                results.targets_removed,
                results.documents_removed
            ),
            Ok(_) => {}
            Err(err) if err.is_persistence_transaction_error() => {
                log::debug!("{LOG_TAG}: ignoring persistence error during garbage collection: {err}");
            }
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!("{LOG_TAG}: skipping garbage collection, primary lease lost");
            }
            Err(err) => log::error!("{LOG_TAG}: garbage collection failed: {err}"),
        }
    }
}
