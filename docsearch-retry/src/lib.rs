//! # docsearch-retry
//!
//! Interchangeable retry and backoff policies for the docsearch indexer.
//!
//! Every policy implements [`RetryStrategy`], whose core operation is
//! [`RetryStrategy::next_delay`]: given the zero-based index of the attempt that
//! just failed and the error it failed with, decide whether to try again and how
//! long to wait first. [`RetryExecutor`] drives an async operation through a
//! strategy until it succeeds, fails terminally, exhausts its attempts, or is
//! rejected by an open circuit.
//!
//! ## Strategies
//!
//! - [`Linear`]: fixed delay, fixed attempt cap
//! - [`Exponential`]: `initial * 2^attempt`, capped at a maximum
//! - [`JitteredExponential`]: exponential plus uniform random jitter
//! - [`CircuitBreaker`]: fail fast after repeated failures, probe after a cool-down
//! - [`Adaptive`]: delay scales inversely with the recent success rate
//!
//! Each strategy separates retryable from terminal errors with a configurable
//! [`RetryPredicate`]. By default that is the error type's own [`Retryable`] impl.
//!
//! ## Quick Start
//!
//! ```
//! use docsearch_retry::{Exponential, RetryExecutor, Retryable};
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("flaky")]
//! struct Flaky;
//!
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool {
//!         true
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let executor = RetryExecutor::new(Exponential::<Flaky>::new(
//!     Duration::from_millis(1),
//!     Duration::from_millis(10),
//!     3,
//! ));
//! let result = executor
//!     .execute(|ctx| async move {
//!         if ctx.attempt < 2 { Err(Flaky) } else { Ok(ctx.attempt) }
//!     })
//!     .await;
//! assert_eq!(result.unwrap(), 2);
//! # });
//! ```
//!
//! Strategies are usually built from a serializable [`RetryProfile`], which is
//! what configuration files carry.
pub mod adaptive;
pub mod circuit_breaker;
pub mod executor;
pub mod profile;
pub mod strategy;

pub use adaptive::Adaptive;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use executor::{RetryContext, RetryError, RetryExecutor};
pub use profile::{RetryProfile, StrategyKind};
pub use strategy::{
    Exponential, JitteredExponential, Linear, RetryDecision, RetryPredicate, RetryStrategy,
    Retryable, always_retry, retryable_predicate,
};
