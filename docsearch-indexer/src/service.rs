//! [`DocSearch`]: the index, the pipeline and search wired together over one
//! data directory.

use crate::config::IndexerConfig;
use crate::retrieval::directory_watcher::{ChangeHandler, DirectoryWatcher};
use crate::retrieval::file_index::{FileIndex, FileStatus, TrackedFile};
use crate::retrieval::indexing_engine::{IndexingEngine, ScanSummary};
use crate::retrieval::parser::PlainTextParser;
use crate::search::{SearchResult, SearchService};
use crate::status::IndexStatus;
use crate::storage::VectorStore;
use crate::storage::sqlite_store::SqliteStore;
use anyhow::{Context, Result};
use docsearch_embed::{
    Embedder, EmbedderPool, InProcessLauncher, ProcessLauncher, WorkerLauncher, WorkerServer,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct DocSearch {
    index: FileIndex,
    store: Arc<SqliteStore>,
    engine: Arc<IndexingEngine>,
    search: SearchService,
    pool: Option<Arc<EmbedderPool>>,
}

impl DocSearch {
    /// Open the index in `data_dir` with an embedder pool built from `config`.
    ///
    /// The pool's workers are not started yet; call
    /// [`start_embedder`](Self::start_embedder) before anything that embeds.
    pub async fn open(data_dir: &Path, config: IndexerConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Cannot create data directory {}", data_dir.display()))?;
        let index = FileIndex::open(data_dir).await?;
        let pool = Arc::new(Self::build_pool(&config)?);
        let mut docsearch = Self::with_embedder(index, config, pool.clone());
        docsearch.pool = Some(pool);
        Ok(docsearch)
    }

    /// Wire an existing index to any [`Embedder`].
    pub fn with_embedder(index: FileIndex, config: IndexerConfig, embedder: Arc<dyn Embedder>) -> Self {
        let store = Arc::new(SqliteStore::new(index.clone()));
        let search = SearchService::new(store.clone(), embedder.clone(), &config);
        let engine = IndexingEngine::new(
            config,
            index.clone(),
            store.clone(),
            Arc::new(PlainTextParser::new()),
            embedder,
        );
        Self {
            index,
            store,
            engine: Arc::new(engine),
            search,
            pool: None,
        }
    }

    fn build_pool(config: &IndexerConfig) -> Result<EmbedderPool> {
        let launcher: Arc<dyn WorkerLauncher> = if config.in_process_workers {
            Arc::new(InProcessLauncher::new(WorkerServer::new()))
        } else {
            Arc::new(ProcessLauncher::locate()?)
        };
        Ok(EmbedderPool::new(
            config.model.clone(),
            config.to_pool_config(),
            launcher,
        ))
    }

    /// Spawn the embedding workers. A no-op without a pool.
    pub async fn start_embedder(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.initialize(self.config().embedder_pool_size)
                .await
                .context("Failed to start embedding workers")?;
        }
        Ok(())
    }

    /// Leave read-only mode and start processing queued files.
    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    pub async fn index_folder(&self, root: &Path) -> Result<ScanSummary> {
        self.engine.index_folder(root).await
    }

    pub async fn wait_until_idle(&self) {
        self.engine.wait_until_idle().await
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        self.search.search(query, k).await
    }

    pub async fn similar(&self, path: &Path, k: usize) -> Result<Vec<SearchResult>> {
        self.search.similar(path, k).await
    }

    pub async fn files(&self, status: Option<FileStatus>) -> Result<Vec<TrackedFile>> {
        self.index.list_files(status).await
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let mut status = IndexStatus::collect(
            &self.index,
            self.store.as_ref(),
            self.config().parser_version,
        )
        .await?;
        if self.engine.is_started() {
            status = status.with_progress(self.engine.progress());
        }
        if let Some(pool) = &self.pool {
            status = status.with_embedder(pool.get_stats());
        }
        Ok(status)
    }

    pub async fn remove(&self, path: &Path) -> Result<usize> {
        self.engine.remove_path(path).await
    }

    pub async fn reindex_outdated(&self) -> Result<usize> {
        self.engine.reindex_outdated().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.engine.clear().await
    }

    /// Watch `root` and feed its changes into the pipeline.
    pub async fn watch(&self, root: &Path) -> Result<DirectoryWatcher> {
        let handler: Arc<dyn ChangeHandler> = self.engine.clone();
        DirectoryWatcher::open(
            root,
            Duration::from_millis(self.config().watch_debounce_ms),
            handler,
        )
        .await
    }

    /// Stop the pipeline and the embedder.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await?;
        info!("docsearch shut down");
        Ok(())
    }

    pub fn config(&self) -> &IndexerConfig {
        self.engine.config()
    }

    pub fn engine(&self) -> &IndexingEngine {
        &self.engine
    }

    pub fn file_index(&self) -> &FileIndex {
        &self.index
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        self.store.clone()
    }

    pub fn embedder_pool(&self) -> Option<&Arc<EmbedderPool>> {
        self.pool.as_ref()
    }
}
