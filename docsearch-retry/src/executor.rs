//! Drives an async operation through a [`RetryStrategy`].
use crate::strategy::RetryStrategy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// State of one retried call, handed to the operation on every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryContext {
    /// Zero-based index of the attempt about to run.
    pub attempt: u32,
    /// Display form of the previous attempt's error, if any.
    pub last_error: Option<String>,
    /// The delay that was waited before this attempt.
    pub next_delay: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("non-retryable failure after {attempts} attempt(s): {source}")]
    Terminal {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("gave up after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("circuit open; call rejected after {attempts} attempt(s)")]
    CircuitOpen { attempts: u32, last_error: Option<E> },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::CircuitOpen { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if it ran at all.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Terminal { source, .. } | RetryError::Exhausted { source, .. } => Some(source),
            RetryError::CircuitOpen { last_error, .. } => last_error,
        }
    }

    pub fn source_ref(&self) -> Option<&E> {
        match self {
            RetryError::Terminal { source, .. } | RetryError::Exhausted { source, .. } => Some(source),
            RetryError::CircuitOpen { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryError::Terminal { .. })
    }
}

/// Reports an attempt as abandoned unless it is settled first, so a terminal
/// error or a dropped future still reaches the strategy.
struct AttemptGuard<'a, E> {
    strategy: &'a dyn RetryStrategy<E>,
    settled: bool,
}

impl<E> AttemptGuard<'_, E> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl<E> Drop for AttemptGuard<'_, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.strategy.record_abandoned();
        }
    }
}

/// Re-invokes an operation until it succeeds, fails terminally, runs out of
/// attempts, or is refused by the strategy.
pub struct RetryExecutor<E> {
    strategy: Arc<dyn RetryStrategy<E>>,
    label: String,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            strategy: Arc::clone(&self.strategy),
            label: self.label.clone(),
        }
    }
}

impl<E: std::error::Error + 'static> RetryExecutor<E> {
    pub fn new(strategy: impl RetryStrategy<E> + 'static) -> Self {
        Self::from_arc(Arc::new(strategy))
    }

    pub fn from_arc(strategy: Arc<dyn RetryStrategy<E>>) -> Self {
        Self {
            strategy,
            label: "operation".to_string(),
        }
    }

    /// Name used in log lines for this executor's calls.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn strategy(&self) -> &Arc<dyn RetryStrategy<E>> {
        &self.strategy
    }

    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut context = RetryContext::default();
        let mut last_error: Option<E> = None;

        loop {
            if !self.strategy.allows_attempt() {
                debug!(
                    "{}: {} strategy refused attempt {}",
                    self.label,
                    self.strategy.name(),
                    context.attempt
                );
                return Err(RetryError::CircuitOpen {
                    attempts: context.attempt,
                    last_error,
                });
            }

            let guard = AttemptGuard {
                strategy: self.strategy.as_ref(),
                settled: false,
            };
            let error = match op(context.clone()).await {
                Ok(value) => {
                    guard.settle();
                    self.strategy.record_success();
                    return Ok(value);
                }
                Err(error) => error,
            };
            let attempts = context.attempt + 1;

            if !self.strategy.is_retryable(&error) {
                drop(guard);
                debug!("{}: terminal failure on attempt {attempts}: {error}", self.label);
                return Err(RetryError::Terminal {
                    attempts,
                    source: error,
                });
            }
            guard.settle();

            let decision = self.strategy.next_delay(context.attempt, &error);
            if !decision.retry {
                warn!("{}: giving up after {attempts} attempt(s): {error}", self.label);
                return Err(RetryError::Exhausted {
                    attempts,
                    source: error,
                });
            }

            debug!(
                "{}: attempt {attempts} failed ({error}); retrying in {:?}",
                self.label, decision.delay
            );
            tokio::time::sleep(decision.delay).await;

            context = RetryContext {
                attempt: attempts,
                last_error: Some(error.to_string()),
                next_delay: Some(decision.delay),
            };
            last_error = Some(error);
        }
    }
}
