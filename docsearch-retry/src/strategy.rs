//! The [`RetryStrategy`] trait and the stateless backoff policies.
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Errors that know whether repeating the failed operation could help.
///
/// Timeouts, crashed workers and busy resources are retryable. Malformed input,
/// unsupported formats and caller mistakes are terminal.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Classifies an error as retryable (`true`) or terminal (`false`).
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Predicate that defers to the error's own [`Retryable`] implementation.
pub fn retryable_predicate<E: Retryable + 'static>() -> RetryPredicate<E> {
    Arc::new(|error: &E| error.is_retryable())
}

/// Predicate that treats every error as retryable.
pub fn always_retry<E: 'static>() -> RetryPredicate<E> {
    Arc::new(|_: &E| true)
}

/// Outcome of [`RetryStrategy::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }

    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// A retry/backoff policy.
///
/// `attempt` is always the zero-based index of the attempt that just failed, so
/// the first call after the first failure passes `0`.
pub trait RetryStrategy<E>: Send + Sync {
    /// Whether `error` is worth retrying at all.
    fn is_retryable(&self, error: &E) -> bool;

    /// Decide whether to retry after a retryable failure, and how long to wait.
    fn next_delay(&self, attempt: u32, last_error: &E) -> RetryDecision;

    /// Whether a new attempt may start right now. Only stateful strategies such
    /// as [`crate::CircuitBreaker`] ever refuse.
    fn allows_attempt(&self) -> bool {
        true
    }

    /// Report a successful attempt.
    fn record_success(&self) {}

    /// Report an attempt that ended without success and without reaching
    /// [`next_delay`](Self::next_delay): a terminal error, or a future dropped
    /// mid-flight.
    fn record_abandoned(&self) {}

    fn name(&self) -> &'static str;
}

impl<E, S: RetryStrategy<E> + ?Sized> RetryStrategy<E> for Arc<S> {
    fn is_retryable(&self, error: &E) -> bool {
        (**self).is_retryable(error)
    }

    fn next_delay(&self, attempt: u32, last_error: &E) -> RetryDecision {
        (**self).next_delay(attempt, last_error)
    }

    fn allows_attempt(&self) -> bool {
        (**self).allows_attempt()
    }

    fn record_success(&self) {
        (**self).record_success()
    }

    fn record_abandoned(&self) {
        (**self).record_abandoned()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// `initial * 2^attempt`, saturating at `max`.
pub(crate) fn exponential_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    initial.checked_mul(factor).unwrap_or(max).min(max)
}

/// Retry with the same delay every time, up to `max_attempts` attempts in total.
pub struct Linear<E> {
    delay: Duration,
    max_attempts: u32,
    predicate: RetryPredicate<E>,
}

impl<E: Retryable + 'static> Linear<E> {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            predicate: retryable_predicate(),
        }
    }
}

impl<E> Linear<E> {
    pub fn with_predicate(mut self, predicate: RetryPredicate<E>) -> Self {
        self.predicate = predicate;
        self
    }
}

impl<E> RetryStrategy<E> for Linear<E> {
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    fn next_delay(&self, attempt: u32, _last_error: &E) -> RetryDecision {
        if attempt + 1 < self.max_attempts {
            RetryDecision::retry_after(self.delay)
        } else {
            RetryDecision::give_up()
        }
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

/// Doubling backoff: `initial * 2^attempt`, capped at `max_delay`.
pub struct Exponential<E> {
    initial: Duration,
    max_delay: Duration,
    max_attempts: u32,
    predicate: RetryPredicate<E>,
}

impl<E: Retryable + 'static> Exponential<E> {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts,
            predicate: retryable_predicate(),
        }
    }
}

impl<E> Exponential<E> {
    pub fn with_predicate(mut self, predicate: RetryPredicate<E>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial, self.max_delay, attempt)
    }
}

impl<E> RetryStrategy<E> for Exponential<E> {
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    fn next_delay(&self, attempt: u32, _last_error: &E) -> RetryDecision {
        if attempt + 1 < self.max_attempts {
            RetryDecision::retry_after(self.delay_for(attempt))
        } else {
            RetryDecision::give_up()
        }
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

/// [`Exponential`] plus uniform jitter in `[0, delay * jitter_ratio]`, so that
/// many callers failing together do not retry in lockstep.
pub struct JitteredExponential<E> {
    base: Exponential<E>,
    jitter_ratio: f64,
}

impl<E: Retryable + 'static> JitteredExponential<E> {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32, jitter_ratio: f64) -> Self {
        Self {
            base: Exponential::new(initial, max_delay, max_attempts),
            jitter_ratio: jitter_ratio.max(0.0),
        }
    }
}

impl<E> JitteredExponential<E> {
    pub fn with_predicate(mut self, predicate: RetryPredicate<E>) -> Self {
        self.base = self.base.with_predicate(predicate);
        self
    }
}

impl<E> RetryStrategy<E> for JitteredExponential<E> {
    fn is_retryable(&self, error: &E) -> bool {
        self.base.is_retryable(error)
    }

    fn next_delay(&self, attempt: u32, last_error: &E) -> RetryDecision {
        let decision = self.base.next_delay(attempt, last_error);
        if !decision.retry {
            return decision;
        }
        let spread = decision.delay.as_secs_f64() * self.jitter_ratio;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(0.0..=spread)
        } else {
            0.0
        };
        RetryDecision::retry_after(decision.delay + Duration::from_secs_f64(jitter))
    }

    fn name(&self) -> &'static str {
        "jittered_exponential"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub(crate) enum TestError {
        #[error("transient")]
        Transient,
        #[error("terminal")]
        Terminal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn test_linear_fixed_delay_and_cap() {
        let linear = Linear::<TestError>::new(Duration::from_millis(50), 3);

        let first = linear.next_delay(0, &TestError::Transient);
        let second = linear.next_delay(1, &TestError::Transient);
        let third = linear.next_delay(2, &TestError::Transient);

        assert_eq!(first, RetryDecision::retry_after(Duration::from_millis(50)));
        assert_eq!(second, RetryDecision::retry_after(Duration::from_millis(50)));
        assert!(!third.retry);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let exp = Exponential::<TestError>::new(Duration::from_millis(100), Duration::from_secs(1), 10);

        assert_eq!(exp.delay_for(0), Duration::from_millis(100));
        assert_eq!(exp.delay_for(1), Duration::from_millis(200));
        assert_eq!(exp.delay_for(3), Duration::from_millis(800));
        assert_eq!(exp.delay_for(4), Duration::from_secs(1));
        assert_eq!(exp.delay_for(63), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let jittered =
            JitteredExponential::<TestError>::new(Duration::from_millis(100), Duration::from_secs(10), 10, 0.5);

        for attempt in 0..5 {
            let base = exponential_delay(Duration::from_millis(100), Duration::from_secs(10), attempt);
            for _ in 0..20 {
                let decision = jittered.next_delay(attempt, &TestError::Transient);
                assert!(decision.retry);
                assert!(decision.delay >= base);
                assert!(decision.delay <= base + base / 2 + Duration::from_micros(1));
            }
        }
    }

    #[test]
    fn test_predicate_classifies_errors() {
        let linear = Linear::<TestError>::new(Duration::ZERO, 3);
        assert!(linear.is_retryable(&TestError::Transient));
        assert!(!linear.is_retryable(&TestError::Terminal));

        let everything = linear.with_predicate(always_retry());
        assert!(everything.is_retryable(&TestError::Terminal));
    }
}
