//! Serializable retry configuration.
use crate::adaptive::Adaptive;
use crate::circuit_breaker::CircuitBreaker;
use crate::executor::RetryExecutor;
use crate::strategy::{
    Exponential, JitteredExponential, Linear, RetryPredicate, RetryStrategy, Retryable,
    retryable_predicate,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Linear,
    Exponential,
    #[default]
    JitteredExponential,
    CircuitBreaker,
    Adaptive,
}

/// A retry policy as it appears in configuration files.
///
/// ```toml
/// strategy = "circuit_breaker"
/// max_attempts = 3
/// initial_delay_ms = 250
/// failure_threshold = 5
/// cool_down_ms = 30000
/// ```
///
/// Fields irrelevant to the chosen strategy are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProfile {
    pub strategy: StrategyKind,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub cool_down_ms: u64,
    /// Number of recent outcomes averaged by the adaptive strategy.
    pub adaptive_window: usize,
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::JitteredExponential,
            max_attempts: 4,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_ratio: 0.5,
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cool_down_ms: 30_000,
            adaptive_window: 20,
        }
    }
}

impl RetryProfile {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// A profile that runs the operation once and never retries.
    pub fn no_retry() -> Self {
        Self {
            strategy: StrategyKind::Linear,
            max_attempts: 1,
            initial_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = initial.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_circuit(mut self, failure_threshold: u32, cool_down: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.cool_down_ms = cool_down.as_millis() as u64;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }

    /// Build the strategy, classifying errors with their [`Retryable`] impl.
    pub fn build<E: Retryable + 'static>(&self) -> Arc<dyn RetryStrategy<E>> {
        self.build_with(retryable_predicate())
    }

    /// Build the strategy with a custom retryable/terminal predicate.
    pub fn build_with<E: Retryable + 'static>(
        &self,
        predicate: RetryPredicate<E>,
    ) -> Arc<dyn RetryStrategy<E>> {
        let attempts = self.max_attempts.max(1);
        let initial = self.initial_delay();
        let max = self.max_delay();
        match self.strategy {
            StrategyKind::Linear => {
                Arc::new(Linear::new(initial, attempts).with_predicate(predicate))
            }
            StrategyKind::Exponential => {
                Arc::new(Exponential::new(initial, max, attempts).with_predicate(predicate))
            }
            StrategyKind::JitteredExponential => Arc::new(
                JitteredExponential::new(initial, max, attempts, self.jitter_ratio)
                    .with_predicate(predicate),
            ),
            StrategyKind::CircuitBreaker => Arc::new(
                CircuitBreaker::new(self.failure_threshold, Duration::from_millis(self.cool_down_ms))
                    .with_window(Duration::from_millis(self.failure_window_ms))
                    .with_retries(initial, attempts)
                    .with_predicate(predicate),
            ),
            StrategyKind::Adaptive => Arc::new(
                Adaptive::new(initial, max, attempts)
                    .with_window(self.adaptive_window)
                    .with_predicate(predicate),
            ),
        }
    }

    /// Build an executor whose log lines are tagged with `label`.
    pub fn executor<E: Retryable + std::error::Error + 'static>(
        &self,
        label: impl Into<String>,
    ) -> RetryExecutor<E> {
        RetryExecutor::from_arc(self.build()).with_label(label)
    }
}
