//! docsearch-indexer: local semantic search over document folders
//!
//! This crate keeps a folder of documents indexed as embedded chunks in a
//! SQLite database and answers natural-language queries against it. Files are
//! tracked individually: every file has a status row saying whether it is
//! queued, indexed, failed or waiting for a retry.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: file-status table, change detection, parsing, task queue,
//!   the indexing pipeline and the directory watcher
//! - **[`storage`]**: the [`storage::VectorStore`] seam and its SQLite backend
//! - **[`search`]**: query embedding and per-file ranking
//! - **[`service`]**: everything wired together over one data directory
//! - **[`config`]**: TOML configuration
//! - **[`status`]**: status snapshots for front ends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docsearch_indexer::{DocSearch, IndexerConfig};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let docsearch = DocSearch::open(Path::new("."), IndexerConfig::default()).await?;
//! docsearch.start_embedder().await?;
//! docsearch.start()?;
//!
//! docsearch.index_folder(Path::new("docs")).await?;
//! docsearch.wait_until_idle().await;
//!
//! for hit in docsearch.search("how do I rotate the logs?", 5).await? {
//!     println!("{:.3} {}", hit.score, hit.path);
//! }
//! docsearch.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Folders → ChangeTracker → TaskQueue → IndexingEngine → Parser → Chunker → Embedder → SQLite
//!              ↑                                                                        ↓
//!       DirectoryWatcher                                                 SearchService ← query
//! ```

pub mod config;
pub mod retrieval;
pub mod search;
pub mod service;
pub mod status;
pub mod storage;

pub use config::IndexerConfig;
pub use retrieval::file_index::{FileIndex, FileStatus, TrackedFile};
pub use retrieval::indexing_engine::{FileEvent, IndexingEngine, IndexingProgress, ScanSummary};
pub use search::{ChunkMatch, SearchResult, SearchService};
pub use service::DocSearch;
pub use status::IndexStatus;
