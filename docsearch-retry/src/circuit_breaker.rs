//! Circuit breaker: stop calling a failing dependency for a while.
//!
//! The breaker starts `Closed`. Retryable failures are counted inside a rolling
//! window; once `failure_threshold` of them accumulate, the breaker opens and
//! rejects every attempt until `cool_down` has elapsed. The first attempt after
//! the cool-down is let through as a half-open trial: success closes the breaker,
//! any failure re-opens it for another cool-down. That includes terminal errors
//! and trials that were cancelled before they finished.
use crate::strategy::{RetryDecision, RetryPredicate, RetryStrategy, Retryable, retryable_predicate};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker<E> {
    failure_threshold: u32,
    window: Duration,
    cool_down: Duration,
    retry_delay: Duration,
    max_attempts: u32,
    predicate: RetryPredicate<E>,
    state: Mutex<BreakerState>,
}

impl<E: Retryable + 'static> CircuitBreaker<E> {
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            window: Duration::from_secs(60),
            cool_down,
            retry_delay: Duration::from_millis(100),
            max_attempts: 3,
            predicate: retryable_predicate(),
            state: Mutex::new(BreakerState::Closed {
                failures: VecDeque::new(),
            }),
        }
    }
}

impl<E> CircuitBreaker<E> {
    /// Failures older than `window` no longer count towards the threshold.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Delay and attempt cap used while the breaker is closed.
    pub fn with_retries(mut self, retry_delay: Duration, max_attempts: u32) -> Self {
        self.retry_delay = retry_delay;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate<E>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn state(&self) -> CircuitState {
        match &*self.lock() {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { until } if Instant::now() >= *until => CircuitState::HalfOpen,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen => CircuitState::HalfOpen,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, state: &mut BreakerState) {
        warn!(
            "Circuit opened; rejecting attempts for {:?}",
            self.cool_down
        );
        *state = BreakerState::Open {
            until: Instant::now() + self.cool_down,
        };
    }
}

impl<E> RetryStrategy<E> for CircuitBreaker<E> {
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    fn next_delay(&self, attempt: u32, _last_error: &E) -> RetryDecision {
        let mut state = self.lock();
        let now = Instant::now();
        let tripped = match &mut *state {
            BreakerState::Closed { failures } => {
                failures.push_back(now);
                while failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.window)
                {
                    failures.pop_front();
                }
                failures.len() >= self.failure_threshold as usize
            }
            // A failed half-open trial re-opens the circuit.
            BreakerState::HalfOpen | BreakerState::Open { .. } => true,
        };

        if tripped {
            self.open(&mut state);
            RetryDecision::give_up()
        } else if attempt + 1 < self.max_attempts {
            RetryDecision::retry_after(self.retry_delay)
        } else {
            RetryDecision::give_up()
        }
    }

    fn allows_attempt(&self) -> bool {
        let mut state = self.lock();
        let reopens_at = match &*state {
            BreakerState::Closed { .. } => return true,
            BreakerState::HalfOpen => return false,
            BreakerState::Open { until } => *until,
        };
        if Instant::now() < reopens_at {
            return false;
        }
        info!("Circuit half-open; allowing a trial attempt");
        *state = BreakerState::HalfOpen;
        true
    }

    fn record_abandoned(&self) {
        let mut state = self.lock();
        if matches!(&*state, BreakerState::HalfOpen) {
            debug!("Half-open trial ended without success");
            self.open(&mut state);
        }
    }

    fn record_success(&self) {
        let mut state = self.lock();
        if !matches!(&*state, BreakerState::Closed { .. }) {
            info!("Circuit closed after successful attempt");
        }
        *state = BreakerState::Closed {
            failures: VecDeque::new(),
        };
    }

    fn name(&self) -> &'static str {
        "circuit_breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::TestError;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::<TestError>::new(3, Duration::from_secs(60)).with_retries(Duration::ZERO, 10);

        assert!(breaker.next_delay(0, &TestError::Transient).retry);
        assert!(breaker.next_delay(1, &TestError::Transient).retry);
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(!breaker.next_delay(2, &TestError::Transient).retry);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows_attempt());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::<TestError>::new(2, Duration::from_secs(60)).with_retries(Duration::ZERO, 10);

        breaker.next_delay(0, &TestError::Transient);
        breaker.record_success();
        breaker.next_delay(0, &TestError::Transient);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allows_attempt());
    }

    #[test]
    fn test_failures_outside_window_are_forgotten() {
        let breaker = CircuitBreaker::<TestError>::new(2, Duration::from_secs(60))
            .with_window(Duration::from_millis(10))
            .with_retries(Duration::ZERO, 10);

        breaker.next_delay(0, &TestError::Transient);
        std::thread::sleep(Duration::from_millis(30));
        breaker.next_delay(1, &TestError::Transient);

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let breaker = CircuitBreaker::<TestError>::new(1, Duration::from_millis(20));
        breaker.next_delay(0, &TestError::Transient);
        assert!(!breaker.allows_attempt());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allows_attempt());
        assert!(!breaker.allows_attempt(), "only one trial while half-open");

        breaker.next_delay(0, &TestError::Transient);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_abandoned_trial_reopens() {
        let breaker = CircuitBreaker::<TestError>::new(1, Duration::from_millis(20));
        breaker.next_delay(0, &TestError::Transient);

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allows_attempt());
        breaker.record_abandoned();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allows_attempt());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allows_attempt(), "a new trial after the next cool-down");
    }

    #[test]
    fn test_abandoned_while_closed_is_ignored() {
        let breaker = CircuitBreaker::<TestError>::new(1, Duration::from_secs(60));
        breaker.record_abandoned();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
