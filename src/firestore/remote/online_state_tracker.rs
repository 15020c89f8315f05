use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "OnlineStateTracker";

/// Failed connection attempts tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long the watch stream may stay unhealthy before reporting `Offline`.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's [`OnlineState`] from watch stream health.
///
/// The state starts as `Unknown`. It becomes `Online` as soon as the watch
/// stream delivers data, and `Offline` once a connection attempt fails or the
/// stream has not become healthy within [`ONLINE_STATE_TIMEOUT`]. Listeners
/// only see a change when the state actually differs.
#[derive(Clone)]
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    state: Arc<Mutex<TrackerState>>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Self {
        Self {
            queue,
            handler,
            state: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            })),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called whenever the watch stream is started. The first attempt of a
    /// series arms the timeout.
    pub fn handle_watch_stream_start(&self) {
        if self.lock().watch_stream_failures != 0 {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown);

        let tracker = self.clone();
        let timer = self.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            ONLINE_STATE_TIMEOUT,
            move || async move {
                tracker.lock().online_state_timer = None;
                hard_assert(
                    tracker.state() == OnlineState::Unknown,
                    "Timer should be canceled if we transitioned to a different state",
                );
                tracker.log_client_offline_warning_if_necessary(&format!(
                    "Backend didn't respond within {} seconds",
                    ONLINE_STATE_TIMEOUT.as_secs()
                ));
                tracker.set_and_broadcast(OnlineState::Offline);
            },
        );
        let previous = self.lock().online_state_timer.replace(timer);
        hard_assert(previous.is_none(), "online state timer already running");
    }

    /// Called when the watch stream closed with an error. An online client
    /// drops back to `Unknown`; otherwise repeated failures report `Offline`.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        if self.state() == OnlineState::Online {
            self.set_and_broadcast(OnlineState::Unknown);
            return;
        }

        let failures = {
            let mut state = self.lock();
            state.watch_stream_failures += 1;
            state.watch_stream_failures
        };
        if failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_online_state_timer();
            let reason = match error {
                Some(err) => format!(
                    "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {err}"
                ),
                None => format!("Connection failed {MAX_WATCH_STREAM_FAILURES} times"),
            };
            self.log_client_offline_warning_if_necessary(&reason);
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    /// Explicit transition, e.g. `Online` on the first watch message or
    /// `Offline` when the network is disabled. Resets the failure count.
    pub fn set(&self, new_state: OnlineState) {
        self.clear_online_state_timer();
        {
            let mut state = self.lock();
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state);
    }

    fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.handler)(new_state);
        }
    }

    fn log_client_offline_warning_if_necessary(&self, details: &str) {
        let mut state = self.lock();
        if state.should_warn_client_is_offline {
            log::warn!(
                "{LOG_TAG}: Could not reach the backend. {details}. \
                 The client will operate in offline mode until it can connect."
            );
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{LOG_TAG}: {details}");
        }
    }

    fn clear_online_state_timer(&self) {
        if let Some(timer) = self.lock().online_state_timer.take() {
            timer.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;

    fn tracker() -> (AsyncQueue, OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
        );
        (queue, tracker, seen)
    }

    #[tokio::test]
    async fn timeout_reports_offline() {
        let (queue, tracker, seen) = tracker();
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        queue
            .run_all_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await;
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn first_failure_reports_offline_and_cancels_timer() {
        let (queue, tracker, _) = tracker();
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(Some(&unavailable("down")));
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn online_client_drops_to_unknown_on_failure() {
        let (_queue, tracker, seen) = tracker();
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(None);
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }
}
