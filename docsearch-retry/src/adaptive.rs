//! Backoff that slows down as the recent success rate drops.
use crate::strategy::{RetryDecision, RetryPredicate, RetryStrategy, Retryable, retryable_predicate};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Success rates below this floor are treated as the floor, which bounds the
/// delay multiplier at 10x.
const MIN_SUCCESS_RATE: f64 = 0.1;

/// Delay = `base_delay / success_rate`, clamped to `[min_delay, max_delay]`.
///
/// The success rate is the moving average over the last `window` outcomes seen
/// by this strategy (failures via [`RetryStrategy::next_delay`], successes via
/// [`RetryStrategy::record_success`]). With no history the rate is 1.0.
pub struct Adaptive<E> {
    base_delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    window: usize,
    predicate: RetryPredicate<E>,
    outcomes: Mutex<VecDeque<bool>>,
}

impl<E: Retryable + 'static> Adaptive<E> {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            min_delay: base_delay,
            max_delay,
            max_attempts,
            window: 20,
            predicate: retryable_predicate(),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }
}

impl<E> Adaptive<E> {
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate<E>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn success_rate(&self) -> f64 {
        let outcomes = self.lock();
        if outcomes.is_empty() {
            return 1.0;
        }
        let successes = outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / outcomes.len() as f64
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<bool>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, success: bool) {
        let mut outcomes = self.lock();
        outcomes.push_back(success);
        while outcomes.len() > self.window {
            outcomes.pop_front();
        }
    }

    fn current_delay(&self) -> Duration {
        let rate = self.success_rate().max(MIN_SUCCESS_RATE);
        let max = self.max_delay.max(self.min_delay);
        self.base_delay.div_f64(rate).clamp(self.min_delay, max)
    }
}

impl<E> RetryStrategy<E> for Adaptive<E> {
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    fn next_delay(&self, attempt: u32, _last_error: &E) -> RetryDecision {
        self.record(false);
        if attempt + 1 < self.max_attempts {
            RetryDecision::retry_after(self.current_delay())
        } else {
            RetryDecision::give_up()
        }
    }

    fn record_success(&self) {
        self.record(true);
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}
