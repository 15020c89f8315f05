use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Jitter is drawn uniformly from `[-RANDOM_FACTOR, RANDOM_FACTOR] * base`.
pub const RANDOM_FACTOR: f64 = 0.5;

const LOG_TAG: &str = "ExponentialBackoff";

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Pure delay bookkeeping behind [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    current_base: Duration,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: config.initial_delay,
        }
    }

    /// Pre-jitter delay the next attempt will use.
    pub fn current_base_delay(&self) -> Duration {
        self.current_base
    }

    pub fn reset(&mut self) {
        self.current_base = self.config.initial_delay;
    }

    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    /// Returns the jittered delay for this attempt and grows the base for the next one.
    pub fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered_delay_with_rng(self.current_base, rng);
        let grown = self.current_base.mul_f64(self.config.backoff_factor);
        self.current_base = grown
            .max(self.config.initial_delay)
            .min(self.config.max_delay);
        delay
    }
}

fn jittered_delay_with_rng<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let base_ms = base.as_secs_f64() * 1_000.0;
    let jitter = RANDOM_FACTOR * base_ms * rng.gen_range(-1.0..=1.0);
    Duration::from_millis((base_ms + jitter).round().max(0.0) as u64)
}

/// Schedules retries on an [`AsyncQueue`] with exponentially growing, jittered delays.
///
/// Each call to [`ExponentialBackoff::backoff_and_run`] cancels any pending
/// attempt, so at most one retry is queued at a time. Time already spent since
/// the previous attempt counts towards the next delay.
pub struct ExponentialBackoff {
    queue: AsyncQueue,
    timer_id: TimerId,
    state: BackoffState,
    last_attempt: Arc<Mutex<Instant>>,
    timer: Option<DelayedOperation>,
}

impl ExponentialBackoff {
    pub fn new(queue: AsyncQueue, timer_id: TimerId) -> Self {
        Self::with_config(queue, timer_id, BackoffConfig::default())
    }

    pub fn with_config(queue: AsyncQueue, timer_id: TimerId, config: BackoffConfig) -> Self {
        Self {
            queue,
            timer_id,
            state: BackoffState::new(config),
            last_attempt: Arc::new(Mutex::new(Instant::now())),
            timer: None,
        }
    }

    pub fn current_base_delay(&self) -> Duration {
        self.state.current_base_delay()
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Makes the next attempt wait the maximum delay, e.g. after the backend
    /// reported resource exhaustion.
    pub fn reset_to_max(&mut self) {
        self.state.reset_to_max();
    }

    pub fn backoff_and_run<F, Fut>(&mut self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let desired = self.state.next_delay();
        let elapsed = self
            .last_attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed();
        let remaining = desired.saturating_sub(elapsed);
        if !remaining.is_zero() {
            log::debug!(
                "{LOG_TAG}: backing off for {} ms (base delay: {} ms, delay with jitter: {} ms)",
                remaining.as_millis(),
                self.state.current_base_delay().as_millis(),
                desired.as_millis()
            );
        }

        let last_attempt = Arc::clone(&self.last_attempt);
        self.timer = Some(self.queue.enqueue_after_delay(
            self.timer_id,
            remaining,
            move || {
                *last_attempt
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
                op()
            },
        ));
    }

    /// Runs a pending attempt right away.
    pub fn skip_backoff(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.skip_delay();
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn deterministic_with_seeded_rng() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut state = BackoffState::default();
        let delay = state.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1_500));
    }

    #[test]
    fn base_delay_is_monotonic_up_to_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = BackoffState::default();
        let mut previous = state.current_base_delay();
        assert_eq!(previous, DEFAULT_INITIAL_DELAY);
        for _ in 0..40 {
            state.next_delay_with_rng(&mut rng);
            let current = state.current_base_delay();
            assert!(current >= previous);
            assert!(current <= DEFAULT_MAX_DELAY);
            previous = current;
        }
        assert_eq!(previous, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut state = BackoffState::default();
        for _ in 0..5 {
            state.next_delay();
        }
        assert!(state.current_base_delay() > DEFAULT_INITIAL_DELAY);
        state.reset();
        assert_eq!(state.current_base_delay(), DEFAULT_INITIAL_DELAY);
        state.reset_to_max();
        assert_eq!(state.current_base_delay(), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let delay = jittered_delay_with_rng(Duration::from_millis(2_000), &mut rng);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(3_000));
        }
    }

    #[tokio::test]
    async fn backoff_schedules_on_queue() {
        let queue = AsyncQueue::new();
        let mut backoff = ExponentialBackoff::new(queue.clone(), TimerId::ListenStreamConnectionBackoff);
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        backoff.backoff_and_run(move || async move {
            *flag.lock().unwrap() = true;
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        queue
            .run_all_delayed_operations_until(TimerId::ListenStreamConnectionBackoff)
            .await;
        assert!(*ran.lock().unwrap());
        assert_eq!(
            backoff.current_base_delay(),
            DEFAULT_INITIAL_DELAY.mul_f64(DEFAULT_BACKOFF_FACTOR)
        );
    }
}
