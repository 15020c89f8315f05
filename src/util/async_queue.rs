use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures_util::FutureExt;

use crate::firestore::error::{cancelled, failed_precondition, internal_error, FirestoreResult};
use crate::platform::runtime;
use crate::util::assert::{fail, hard_assert};
use crate::util::backoff::BackoffState;

const LOG_TAG: &str = "AsyncQueue";

/// Identifies the kind of delayed operation scheduled on an [`AsyncQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer; only meaningful for `run_all_delayed_operations_until`.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    /// Fires when the watch stream has not reached a healthy state in time.
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    AsyncQueueRetry,
}

type QueueJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type RetryableOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    op: Option<QueueJob>,
    completion: Option<oneshot::Sender<FirestoreResult<()>>>,
}

#[derive(Default)]
struct QueueState {
    operation_in_progress: bool,
    shutting_down: bool,
    failure: Option<String>,
    delayed: Vec<DelayedEntry>,
    timer_ids_to_skip: Vec<TimerId>,
    retryable_ops: VecDeque<RetryableOp>,
    retry_timer: Option<DelayedOperation>,
}

struct AsyncQueueInner {
    sender: Sender<QueueJob>,
    state: Mutex<QueueState>,
    retry_backoff: Mutex<BackoffState>,
    next_delayed_id: AtomicU64,
    enqueued: AtomicU64,
}

/// Serial task queue shared by every component of a client.
///
/// Operations run strictly one after another in FIFO order on a single worker
/// task. Delayed operations are tracked so tests can fast-forward or cancel
/// them, and retryable operations form an ordered sub-queue that backs off on
/// persistence transaction failures.
///
/// Operations must never await [`AsyncQueue::enqueue`] from inside the queue;
/// they use [`AsyncQueue::enqueue_and_forget`] instead.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

/// Non-owning handle to an [`AsyncQueue`].
#[derive(Clone)]
pub struct WeakAsyncQueue {
    inner: Weak<AsyncQueueInner>,
}

impl WeakAsyncQueue {
    pub fn upgrade(&self) -> Option<AsyncQueue> {
        self.inner.upgrade().map(|inner| AsyncQueue { inner })
    }
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue").finish_non_exhaustive()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let inner = Arc::new(AsyncQueueInner {
            sender,
            state: Mutex::new(QueueState::default()),
            retry_backoff: Mutex::new(BackoffState::default()),
            next_delayed_id: AtomicU64::new(1),
            enqueued: AtomicU64::new(0),
        });
        Self::start_worker(Arc::downgrade(&inner), receiver);
        Self { inner }
    }

    fn start_worker(inner: Weak<AsyncQueueInner>, receiver: Receiver<QueueJob>) {
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                let Some(queue) = inner.upgrade() else {
                    break;
                };
                queue.state().operation_in_progress = true;
                drop(queue);

                let outcome = AssertUnwindSafe(job()).catch_unwind().await;

                let Some(queue) = inner.upgrade() else {
                    break;
                };
                {
                    let mut state = queue.state();
                    state.operation_in_progress = false;
                    if let Err(panic) = outcome {
                        let message = panic
                            .downcast_ref::<String>()
                            .cloned()
                            .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                            .unwrap_or_else(|| "unknown panic".to_string());
                        log::error!("{LOG_TAG}: INTERNAL UNHANDLED ERROR: {message}");
                        state.failure = Some(message);
                    }
                }
            }
        });
    }

    pub fn downgrade(&self) -> WeakAsyncQueue {
        WeakAsyncQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Queues `op` and waits for its result.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.verify_not_failed();
        if self.is_shutting_down() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.enqueue_internal(op).await
    }

    /// Queues `op` even after [`AsyncQueue::enter_restricted_mode`]; used by shutdown.
    pub async fn enqueue_even_while_restricted<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.verify_not_failed();
        self.enqueue_internal(op).await
    }

    async fn enqueue_internal<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.push_job(Box::new(move || {
            async move {
                let result = op().await;
                let _ = tx.send(result);
            }
            .boxed()
        }));
        rx.await
            .map_err(|_| internal_error("AsyncQueue operation was dropped before completing"))?
    }

    /// Queues `op` without waiting for it.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.verify_not_failed();
        if self.is_shutting_down() {
            return;
        }
        self.push_job(Box::new(move || op().boxed()));
    }

    fn push_job(&self, job: QueueJob) {
        self.inner.enqueued.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.try_send(job).is_err() {
            log::debug!("{LOG_TAG}: dropping operation, queue worker has stopped");
        }
    }

    /// Appends `op` to the retryable sub-queue. Retryable operations run in
    /// order; a persistence transaction failure pauses the sub-queue and
    /// retries the head with exponential backoff.
    pub fn enqueue_retryable<F, Fut>(&self, op: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let op: RetryableOp = Arc::new(move || op().boxed());
        let weak = self.downgrade();
        self.enqueue_and_forget(move || async move {
            if let Some(queue) = weak.upgrade() {
                if queue.push_retryable(op) {
                    queue.retry_next_op().await;
                }
            }
        });
    }

    /// Returns true when `op` is the only pending retryable operation.
    fn push_retryable(&self, op: RetryableOp) -> bool {
        let mut state = self.inner.state();
        state.retryable_ops.push_back(op);
        state.retryable_ops.len() == 1
    }

    fn retry_next_op(&self) -> BoxFuture<'static, ()> {
        let queue = self.clone();
        async move {
            let head = queue.inner.state().retryable_ops.front().cloned();
            let Some(op) = head else {
                return;
            };

            let retry_head = match op().await {
                Ok(()) => {
                    queue.inner.state().retryable_ops.pop_front();
                    queue.retry_backoff().reset();
                    false
                }
                Err(err) if err.is_persistence_transaction_error() => {
                    log::debug!("{LOG_TAG}: operation failed with retryable error: {err}");
                    true
                }
                Err(err) => {
                    log::error!("{LOG_TAG}: retryable operation failed permanently: {err}");
                    queue.inner.state().retryable_ops.pop_front();
                    false
                }
            };

            let has_more = !queue.inner.state().retryable_ops.is_empty();
            if has_more && !retry_head {
                let weak = queue.downgrade();
                queue.enqueue_and_forget(move || async move {
                    if let Some(queue) = weak.upgrade() {
                        queue.retry_next_op().await;
                    }
                });
            } else if retry_head {
                let delay = queue.retry_backoff().next_delay();
                let weak = queue.downgrade();
                let previous = queue.inner.state().retry_timer.take();
                if let Some(previous) = previous {
                    previous.cancel();
                }
                let timer = queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || {
                    async move {
                        if let Some(queue) = weak.upgrade() {
                            queue.retry_next_op().await;
                        }
                    }
                });
                queue.inner.state().retry_timer = Some(timer);
            }
        }
        .boxed()
    }

    fn retry_backoff(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.inner
            .retry_backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedules `op` to run on the queue after `delay`.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.verify_not_failed();
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let delay = {
            let mut state = self.inner.state();
            let delay = if state.timer_ids_to_skip.contains(&timer_id) {
                Duration::ZERO
            } else {
                delay
            };
            state.delayed.push(DelayedEntry {
                id,
                timer_id,
                target_time: Instant::now() + delay,
                op: Some(Box::new(move || op().boxed())),
                completion: Some(tx),
            });
            delay
        };

        let weak = self.downgrade();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(queue) = weak.upgrade() {
                queue.run_delayed(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: self.downgrade(),
            completion: Arc::new(Mutex::new(Some(rx))),
        }
    }

    fn run_delayed(&self, id: u64) {
        let weak = self.downgrade();
        self.push_job(Box::new(move || {
            async move {
                let Some(queue) = weak.upgrade() else {
                    return;
                };
                let entry = queue.take_delayed(id);
                if let Some((op, completion)) = entry {
                    op().await;
                    if let Some(completion) = completion {
                        let _ = completion.send(Ok(()));
                    }
                }
            }
            .boxed()
        }));
    }

    fn take_delayed(
        &self,
        id: u64,
    ) -> Option<(QueueJob, Option<oneshot::Sender<FirestoreResult<()>>>)> {
        let mut state = self.inner.state();
        let index = state.delayed.iter().position(|entry| entry.id == id)?;
        let mut entry = state.delayed.remove(index);
        let op = entry.op.take()?;
        Some((op, entry.completion.take()))
    }

    fn cancel_delayed(&self, id: u64) {
        let removed = {
            let mut state = self.inner.state();
            state
                .delayed
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| state.delayed.remove(index))
        };
        if let Some(mut entry) = removed {
            if let Some(completion) = entry.completion.take() {
                let _ = completion.send(Err(cancelled("Operation cancelled")));
            }
        }
    }

    pub fn verify_operation_in_progress(&self) {
        hard_assert(
            self.inner.state().operation_in_progress,
            "verify_operation_in_progress() called when no op in progress on this queue",
        );
    }

    fn verify_not_failed(&self) {
        let failure = self.inner.state().failure.clone();
        if let Some(failure) = failure {
            fail(format!("AsyncQueue is already failed: {failure}"));
        }
    }

    /// Stops accepting regular operations. Shutdown steps use
    /// [`AsyncQueue::enqueue_even_while_restricted`].
    pub fn enter_restricted_mode(&self) {
        self.inner.state().shutting_down = true;
    }

    /// Waits until every queued operation, including ones queued while
    /// draining, has run. Delayed operations are not run.
    pub async fn drain(&self) {
        loop {
            let before = self.inner.enqueued.load(Ordering::SeqCst);
            let _ = self.enqueue_internal(|| async { Ok(()) }).await;
            if self.inner.enqueued.load(Ordering::SeqCst) == before + 1 {
                break;
            }
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state()
            .delayed
            .iter()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Runs delayed operations early, in target-time order, up to and including
    /// the first one registered under `last_timer_id`.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) {
        self.drain().await;

        let ids: Vec<u64> = {
            let mut state = self.inner.state();
            state.delayed.sort_by_key(|entry| entry.target_time);
            let mut ids = Vec::new();
            for entry in &state.delayed {
                ids.push(entry.id);
                if last_timer_id != TimerId::All && entry.timer_id == last_timer_id {
                    break;
                }
            }
            ids
        };
        for id in ids {
            self.run_delayed(id);
        }

        self.drain().await;
    }

    /// Makes every later delay for `timer_id` fire immediately.
    pub fn skip_delays_for_timer_id(&self, timer_id: TimerId) {
        self.inner.state().timer_ids_to_skip.push(timer_id);
    }
}

impl AsyncQueueInner {
    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: WeakAsyncQueue,
    completion: Arc<Mutex<Option<oneshot::Receiver<FirestoreResult<()>>>>>,
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Removes the timer. The completion resolves with a `Cancelled` error.
    pub fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel_delayed(self.id);
        }
    }

    /// Queues the operation immediately instead of waiting for its timer.
    pub fn skip_delay(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.run_delayed(self.id);
        }
    }

    /// Resolves once the operation ran (`Ok`) or was cancelled (`Err`).
    pub async fn completion(&self) -> FirestoreResult<()> {
        let receiver = self
            .completion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match receiver {
            Some(receiver) => receiver
                .await
                .unwrap_or_else(|_| Err(cancelled("Operation cancelled"))),
            None => Err(internal_error("DelayedOperation completion already consumed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::persistence_transaction_error;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn runs_operations_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(move || async move {
                log.lock().unwrap().push(index);
            });
        }
        let value = queue.enqueue(|| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn operations_enqueued_while_running_go_to_the_tail() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_queue = queue.clone();
        let inner_log = Arc::clone(&log);
        queue.enqueue_and_forget(move || async move {
            let nested_log = Arc::clone(&inner_log);
            inner_queue.enqueue_and_forget(move || async move {
                nested_log.lock().unwrap().push("nested");
            });
            inner_log.lock().unwrap().push("outer");
        });
        let tail_log = Arc::clone(&log);
        queue.enqueue_and_forget(move || async move {
            tail_log.lock().unwrap().push("second");
        });
        queue.drain().await;
        assert_eq!(*log.lock().unwrap(), vec!["outer", "second", "nested"]);
    }

    #[tokio::test]
    async fn delayed_operations_can_be_fast_forwarded() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        queue
            .run_all_delayed_operations_until(TimerId::ListenStreamIdle)
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        assert!(op.completion().await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_operations_never_run() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(10), move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        op.cancel();
        queue.run_all_delayed_operations_until(TimerId::All).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let err = op.completion().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/cancelled");
    }

    #[tokio::test]
    async fn run_until_stops_at_requested_timer() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (timer, delay) in [
            (TimerId::ListenStreamIdle, 1),
            (TimerId::OnlineStateTimeout, 2),
            (TimerId::WriteStreamIdle, 3),
        ] {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(timer, Duration::from_secs(delay), move || async move {
                log.lock().unwrap().push(timer);
            });
        }
        queue
            .run_all_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![TimerId::ListenStreamIdle, TimerId::OnlineStateTimeout]
        );
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamIdle));
    }

    #[tokio::test]
    async fn retryable_operations_back_off_on_transaction_errors() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_attempts = Arc::clone(&attempts);
        let first_order = Arc::clone(&order);
        queue.enqueue_retryable(move || {
            let attempts = Arc::clone(&first_attempts);
            let order = Arc::clone(&first_order);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(persistence_transaction_error("simulated failure"));
                }
                order.lock().unwrap().push("first");
                Ok(())
            }
        });
        let second_order = Arc::clone(&order);
        queue.enqueue_retryable(move || {
            let order = Arc::clone(&second_order);
            async move {
                order.lock().unwrap().push("second");
                Ok(())
            }
        });

        // The second operation waits behind the failed head.
        queue.drain().await;
        assert!(order.lock().unwrap().is_empty());
        assert!(queue.contains_delayed_operation(TimerId::AsyncQueueRetry));

        queue
            .run_all_delayed_operations_until(TimerId::AsyncQueueRetry)
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn restricted_mode_rejects_new_operations() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        let err = queue.enqueue(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        let allowed = queue
            .enqueue_even_while_restricted(|| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(allowed, 7);
    }
}
