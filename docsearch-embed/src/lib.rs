//! # docsearch-embed
//!
//! Text embeddings for docsearch, produced by a pool of isolated workers.
//!
//! Embedding models are large, native, and occasionally leak or crash. This
//! crate keeps them at arm's length: each model lives in a worker that speaks a
//! small line-delimited JSON protocol, and the [`EmbedderPool`] supervises those
//! workers, recycling them after a number of requests or when their memory grows
//! past a limit.
//!
//! ## Features
//!
//! - **Local ONNX Models**: FastEmbed models run locally, no external API calls
//! - **Process Isolation**: workers run as `docsearch-embed-worker` subprocesses
//!   via [`ProcessLauncher`], or as tasks via [`InProcessLauncher`]
//! - **Supervision**: explicit worker state machine, health checks, restarts
//! - **Retries**: pool failures go through a configurable [`docsearch_retry`] profile
//! - **Offline Model**: [`HashingModel`] needs no model files, for tests and smoke runs
//!
//! ## Quick Start
//!
//! ```no_run
//! use docsearch_embed::{EmbedConfig, EmbedRole, EmbedderPool, PoolConfig, ProcessLauncher};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = EmbedderPool::new(
//!     EmbedConfig::fastembed("all-minilm-l6-v2"),
//!     PoolConfig::default(),
//!     Arc::new(ProcessLauncher::locate()?),
//! );
//! pool.initialize(2).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let vectors = pool.embed(&texts, EmbedRole::Passage).await?;
//! println!("Generated {} embeddings of dimension {}", vectors.len(), vectors[0].len());
//!
//! pool.dispose().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: model and pool configuration
//! - [`model`]: the [`EmbeddingModel`] trait and its implementations
//! - [`protocol`]: messages between pool and workers
//! - [`worker`]: the worker side of the protocol
//! - [`launcher`]: starting workers as processes or tasks
//! - [`state_machine`]: per-worker lifecycle
//! - [`pool`]: the supervising pool and the [`Embedder`] trait
//! - [`error`]: error types and result handling

pub mod config;
pub mod error;
pub mod launcher;
pub mod model;
pub mod pool;
pub mod protocol;
pub mod state_machine;
pub mod worker;

// Re-export main types for easy access
pub use config::{EmbedConfig, ModelSpec, PoolConfig};
pub use error::{EmbedError, Result};
pub use launcher::{InProcessLauncher, ProcessLauncher, WORKER_BINARY, WorkerLauncher};
pub use model::{EmbedRole, EmbeddingModel, FastEmbedModel, HashingModel};
pub use pool::{Embedder, EmbedderPool, PoolStats, WorkerRecord};
pub use state_machine::{WorkerState, WorkerStateMachine};
pub use worker::WorkerServer;
