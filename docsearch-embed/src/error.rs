//! Error types for the embedding system

use crate::state_machine::WorkerState;
use docsearch_retry::Retryable;
use std::time::Duration;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for models, workers and the embedder pool.
///
/// Variants fall into three groups, which [`Retryable`] reflects:
///
/// - **Process faults** (`WorkerCrashed`, `Timeout`, `Protocol`, `Io`): the pool
///   absorbs them by restarting the worker, and callers may retry.
/// - **Availability** (`NotReady`, `PoolUnavailable`): transient by nature.
/// - **Terminal** (`InvalidConfig`, `Model`, `InvalidTransition`, ...): retrying
///   the same call cannot help.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {message}")]
    ModelInitialization { message: String },

    /// The model rejected or failed on a batch
    #[error("Embedding generation failed: {message}")]
    Model { message: String },

    /// Malformed or unexpected message on a worker channel
    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    #[error("Embedding worker {worker} crashed: {reason}")]
    WorkerCrashed { worker: usize, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Embedding worker {worker} is not ready (state: {state})")]
    NotReady { worker: usize, state: WorkerState },

    #[error("Invalid worker state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error("No embedding worker became ready within {waited:?}")]
    PoolUnavailable { waited: Duration },

    #[error("Embedder pool has been disposed")]
    PoolDisposed,

    #[error("Unknown embedding worker index {index}")]
    UnknownWorker { index: usize },

    /// IO errors on worker pipes or when spawning worker processes
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors (including panics inside the model)
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn model<S: Into<String>>(message: S) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Whether the failure says something about the worker process rather than
    /// the input, meaning the worker should be replaced.
    pub fn is_process_fault(&self) -> bool {
        matches!(
            self,
            EmbedError::WorkerCrashed { .. }
                | EmbedError::Timeout { .. }
                | EmbedError::Protocol { .. }
                | EmbedError::Io { .. }
                | EmbedError::AsyncTask { .. }
        )
    }
}

impl Retryable for EmbedError {
    fn is_retryable(&self) -> bool {
        self.is_process_fault()
            || matches!(
                self,
                EmbedError::NotReady { .. } | EmbedError::PoolUnavailable { .. }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(
            EmbedError::PoolUnavailable {
                waited: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(EmbedError::timeout("embed", Duration::from_secs(1)).is_retryable());
        assert!(
            EmbedError::WorkerCrashed {
                worker: 0,
                reason: "exit".into()
            }
            .is_process_fault()
        );

        assert!(!EmbedError::model("bad input").is_retryable());
        assert!(!EmbedError::PoolDisposed.is_retryable());
        assert!(
            !EmbedError::InvalidTransition {
                from: WorkerState::Shutdown,
                to: WorkerState::Ready
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = EmbedError::NotReady {
            worker: 2,
            state: WorkerState::Restarting,
        };
        assert_eq!(
            err.to_string(),
            "Embedding worker 2 is not ready (state: restarting)"
        );
    }
}
