//! Indexing pipeline: drains the task queue into the vector store.
//!
//! ## Pipeline Flow
//!
//! ```text
//! index_folder ─ ChangeTracker::scan ─┐
//! DirectoryWatcher ───────────────────┼─ TaskQueue ─ dispatcher ─┬─ index_file ─┬─ DocumentParser
//! retry_errors / reindex_outdated ────┘   (dedupe)   (bounded)   │              ├─ Chunker
//!                                                                 │              ├─ embedding cache, then Embedder (retried)
//!                                                                 │              └─ VectorStore replace_path
//!                                                                 └─ remove_path ── VectorStore delete
//! ```
//!
//! A file's new rows are committed together once every chunk has a vector, so
//! a failed run leaves the previous rows untouched.
//!
//! Every attempt ends in a status row: `indexed`, `failed` (content problem, not
//! retried) or `error` (transient problem that outlasted its retries, retried by
//! the periodic sweep).
//!
//! ## Resource Management
//!
//! The dispatcher runs at most `concurrency` files at once and drops to a
//! quarter of that while available system memory is under the configured
//! watermark. Each file's own steps are sequential.
//!
//! ## Modes
//!
//! Like the search service, a freshly constructed engine is read-only. Call
//! [`IndexingEngine::start`] before scheduling work.

use super::change_tracker::{ChangeTracker, FileChange, FileStat, hash_file, needs_work, path_key};
use super::file_index::{FileIndex, FileStatus, Fingerprint};
use super::parser::{DocumentParser, ParseError};
use super::task_queue::{IndexingTask, TaskPriority, TaskQueue, TaskType};
use crate::config::IndexerConfig;
use crate::storage::{ChunkRow, VectorStore, chunk_id, text_hash};
use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use docsearch_embed::{EmbedConfig, EmbedError, EmbedRole, Embedder};
use docsearch_retry::RetryExecutor;
use docsearch_text::{Chunker, TextChunk};
use half::f16;
use itertools::Itertools;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Counters published on the progress channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexingProgress {
    /// Tasks waiting for a slot.
    pub queued: usize,
    /// Files being processed right now.
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub errors: usize,
    /// Files found unchanged and left alone.
    pub skipped: usize,
}

/// Per-file transition, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FileEvent {
    Transition { path: String, status: FileStatus },
    Skipped { path: String },
    Removed { path: String },
}

/// What a folder scan found and queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub root: PathBuf,
    pub new: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Index tasks queued, including unchanged files that still need work.
    pub queued: usize,
    /// Files left for the next scan because the task queue was full.
    pub deferred: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Indexed { chunks: usize },
    Skipped,
    Failed(String),
    Removed,
}

/// Samples available system memory at most once per second.
struct MemoryMonitor {
    watermark_bytes: u64,
    state: Mutex<MemoryState>,
}

struct MemoryState {
    system: System,
    checked_at: Option<Instant>,
    under_pressure: bool,
}

impl MemoryMonitor {
    const REFRESH: Duration = Duration::from_secs(1);

    fn new(watermark_bytes: u64) -> Self {
        Self {
            watermark_bytes,
            state: Mutex::new(MemoryState {
                system: System::new(),
                checked_at: None,
                under_pressure: false,
            }),
        }
    }

    fn under_pressure(&self) -> bool {
        if self.watermark_bytes == 0 {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.checked_at.is_none_or(|at| at.elapsed() >= Self::REFRESH) {
            state.system.refresh_memory();
            state.checked_at = Some(Instant::now());
            let available = state.system.available_memory();
            let pressure = available < self.watermark_bytes;
            if pressure != state.under_pressure {
                if pressure {
                    warn!(
                        "Available memory {} MB under watermark, throttling indexing",
                        available / (1024 * 1024)
                    );
                } else {
                    info!("Memory pressure cleared, resuming full concurrency");
                }
            }
            state.under_pressure = pressure;
        }
        state.under_pressure
    }
}

struct EngineInner {
    config: IndexerConfig,
    index: FileIndex,
    tracker: ChangeTracker,
    store: Arc<dyn VectorStore>,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    /// Embedding-cache namespace for the configured model.
    cache_model: String,
    queue: TaskQueue,
    embed_retry: RetryExecutor<EmbedError>,
    parse_retry: RetryExecutor<ParseError>,
    memory: MemoryMonitor,
    progress: watch::Sender<IndexingProgress>,
    events: broadcast::Sender<FileEvent>,
    paused: watch::Sender<bool>,
    stop: watch::Sender<bool>,
    started: AtomicBool,
}

/// Releases a path in the queue however its task ends, panics included.
struct InFlight {
    inner: Arc<EngineInner>,
    path: PathBuf,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.queue.complete(&self.path);
        self.inner.refresh_progress();
    }
}

/// The indexing pipeline. Owns the dispatcher and the error sweep.
pub struct IndexingEngine {
    inner: Arc<EngineInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl IndexingEngine {
    const POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Create an engine over the given collaborators. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: IndexerConfig,
        index: FileIndex,
        store: Arc<dyn VectorStore>,
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let inner = EngineInner {
            tracker: ChangeTracker::new(index.clone()),
            chunker: Chunker::new(config.chunk_target_size, config.chunk_overlap),
            cache_model: cache_model(&config.model),
            queue: TaskQueue::new(config.max_queue_size),
            embed_retry: config.retry_profile.executor("embed"),
            parse_retry: config.retry_profile.executor("extract"),
            memory: MemoryMonitor::new(config.memory_watermark_bytes()),
            progress: watch::channel(IndexingProgress::default()).0,
            events: broadcast::channel(256).0,
            paused: watch::channel(false).0,
            stop: watch::channel(false).0,
            started: AtomicBool::new(false),
            config,
            index,
            store,
            parser,
            embedder,
        };
        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Start the dispatcher and the periodic error sweep. Calling it again is
    /// a no-op.
    ///
    /// # Errors
    /// Fails after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("Indexing engine has been shut down");
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(
            "Starting indexing engine (concurrency {}, batch size {})",
            self.inner.config.effective_concurrency(),
            self.inner.config.embed_batch_size
        );
        let sweep_period = self
            .inner
            .config
            .error_retry_interval()
            .clamp(Duration::from_secs(1), Duration::from_secs(60));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(EngineInner::dispatch(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(EngineInner::sweep_errors(
            Arc::downgrade(&self.inner),
            sweep_period,
        )));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self, operation: &str) -> Result<()> {
        if !self.is_started() {
            bail!("{operation} not allowed in read-only mode. Call start() first.");
        }
        Ok(())
    }

    /// Scan a directory and queue every new, modified or unfinished file, and
    /// the removal of tracked files that disappeared.
    ///
    /// Returns once the work is queued; use
    /// [`wait_until_idle`](Self::wait_until_idle) to wait for it.
    ///
    /// # Errors
    /// - If called while the engine is in read-only mode
    /// - If `root` is not a readable directory
    /// - Database errors
    pub async fn index_folder(&self, root: &Path) -> Result<ScanSummary> {
        self.ensure_started("Folder indexing")?;
        let root = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("Cannot index {}", root.display()))?;
        if !tokio::fs::metadata(&root).await?.is_dir() {
            bail!("{} is not a directory", root.display());
        }

        info!("Scanning {}", root.display());
        let inner = &self.inner;
        let changes = inner.tracker.scan(&root, Arc::clone(&inner.parser)).await?;
        let version = inner.config.parser_version;

        let mut queued = 0;
        let mut deferred = 0;
        let mut count = |pushed: bool| {
            if pushed {
                queued += 1;
            } else {
                deferred += 1;
            }
        };
        for stat in &changes.new {
            count(self.enqueue_scanned(stat, None).await?);
        }
        for stat in &changes.modified {
            let previous = inner.index.get_file(&stat.key()).await?;
            count(self.enqueue_scanned(stat, previous.map(|f| f.status)).await?);
        }

        let mut skipped = 0;
        for stat in &changes.unchanged {
            let previous = inner.index.get_file(&stat.key()).await?;
            if previous.as_ref().is_some_and(|tracked| !needs_work(tracked, version)) {
                skipped += 1;
                continue;
            }
            count(self.enqueue_scanned(stat, previous.map(|f| f.status)).await?);
        }

        for path in &changes.deleted {
            inner
                .queue
                .push(IndexingTask::remove_file(PathBuf::from(path)));
        }

        inner
            .index
            .upsert_folder(&path_key(&root), changes.total_files())
            .await?;
        inner.progress.send_modify(|p| p.skipped += skipped);
        inner.refresh_progress();

        let summary = ScanSummary {
            root,
            new: changes.new.len(),
            modified: changes.modified.len(),
            unchanged: changes.unchanged.len(),
            deleted: changes.deleted.len(),
            queued,
            deferred,
        };
        info!(
            "Queued {} files from {} ({} new, {} modified, {} unchanged, {} deleted)",
            summary.queued,
            summary.root.display(),
            summary.new,
            summary.modified,
            summary.unchanged,
            summary.deleted
        );
        if deferred > 0 {
            warn!("Task queue full; {deferred} files left for the next scan");
        }
        Ok(summary)
    }

    /// Mark a scanned file queued and push its task. When the queue is full the
    /// row goes back to `previous`, or is dropped if the file was untracked, so
    /// the next scan picks it up again.
    async fn enqueue_scanned(&self, stat: &FileStat, previous: Option<FileStatus>) -> Result<bool> {
        let index = &self.inner.index;
        let key = stat.key();
        index
            .mark_queued(&key, stat.size_bytes, stat.modified_at)
            .await?;
        if self.inner.queue.push(IndexingTask::index_file(
            stat.path.clone(),
            TaskPriority::Normal,
        )) {
            return Ok(true);
        }
        match previous {
            Some(status) => {
                index.set_status(&key, status).await?;
            }
            None => {
                index.remove_file(&key).await?;
            }
        }
        Ok(false)
    }

    /// Queue one file at high priority. A path that no longer exists is queued
    /// for removal instead.
    ///
    /// Returns `false` when the path is not something the parser handles.
    pub async fn schedule_file(&self, path: &Path) -> Result<bool> {
        self.ensure_started("File indexing")?;
        let path = match tokio::fs::canonicalize(path).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.schedule_removal(path)?;
                return Ok(true);
            }
            Err(e) => return Err(e).with_context(|| format!("Cannot index {}", path.display())),
        };
        if !self.inner.parser.supports(&path) || !tokio::fs::metadata(&path).await?.is_file() {
            return Ok(false);
        }

        let queued = self
            .inner
            .queue
            .push(IndexingTask::index_file(path, TaskPriority::High));
        self.inner.refresh_progress();
        Ok(queued)
    }

    /// Queue removal of a file, or of everything tracked under a directory.
    pub fn schedule_removal(&self, path: &Path) -> Result<()> {
        self.ensure_started("File removal")?;
        let path = std::path::absolute(path)?;
        self.inner.queue.push(IndexingTask::remove_file(path));
        self.inner.refresh_progress();
        Ok(())
    }

    /// Remove a file, or every tracked file under a directory, right away.
    /// Returns how many files were removed.
    pub async fn remove_path(&self, path: &Path) -> Result<usize> {
        let path = match tokio::fs::canonicalize(path).await {
            Ok(path) => path,
            Err(_) => std::path::absolute(path)?,
        };
        self.inner.remove_path(&path).await
    }

    /// Flag files indexed by an older parser version and queue them.
    pub async fn reindex_outdated(&self) -> Result<usize> {
        self.ensure_started("Re-indexing")?;
        let inner = &self.inner;
        let flagged = inner.tracker.mark_outdated(inner.config.parser_version).await?;
        let outdated = inner.index.list_files(Some(FileStatus::Outdated)).await?;
        for file in &outdated {
            inner.queue.push(IndexingTask::index_file(
                PathBuf::from(&file.path),
                TaskPriority::Background,
            ));
        }
        inner.refresh_progress();
        info!(
            "Queued {} outdated files ({} newly flagged)",
            outdated.len(),
            flagged
        );
        Ok(outdated.len())
    }

    /// Queue files in `error` whose last attempt is older than the retry
    /// interval. The periodic sweep calls this too.
    pub async fn retry_errors(&self) -> Result<usize> {
        self.ensure_started("Error retry")?;
        self.inner.retry_errors().await
    }

    /// Stop handing out new files. In-flight files finish.
    pub fn pause(&self) {
        info!("Indexing paused");
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        info!("Indexing resumed");
        self.inner.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Resolves once nothing is queued or being processed.
    pub async fn wait_until_idle(&self) {
        self.inner.queue.wait_until_idle().await
    }

    pub fn progress(&self) -> IndexingProgress {
        *self.inner.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<IndexingProgress> {
        self.inner.progress.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FileEvent> {
        self.inner.events.subscribe()
    }

    /// Drop queued work and wipe tracked files, chunks and folders.
    pub async fn clear(&self) -> Result<()> {
        self.inner.queue.clear();
        self.inner.index.clear().await?;
        self.inner.progress.send_replace(IndexingProgress::default());
        self.inner.refresh_progress();
        info!("Index cleared");
        Ok(())
    }

    /// Stop the dispatcher, wait for in-flight files (up to the configured
    /// shutdown timeout), then shut the embedder down.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down indexing engine");
        self.inner.stop.send_replace(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Indexing engine task failed: {e}");
            }
        }

        self.inner
            .embedder
            .shutdown()
            .await
            .context("Failed to shut down embedder")?;
        info!("Indexing engine stopped");
        Ok(())
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.inner.config
    }

    pub fn file_index(&self) -> &FileIndex {
        &self.inner.index
    }

    pub fn parser(&self) -> &Arc<dyn DocumentParser> {
        &self.inner.parser
    }
}

/// Cache namespace: anything that changes the vector for a given passage.
fn cache_model(model: &EmbedConfig) -> String {
    format!(
        "{}|normalize={}|prefix={}",
        model.model_name(),
        model.normalize,
        model.passage_prefix.as_deref().unwrap_or_default()
    )
}

impl Drop for IndexingEngine {
    fn drop(&mut self) {
        self.inner.stop.send_replace(true);
    }
}

impl EngineInner {
    fn refresh_progress(&self) {
        let depth = self.queue.depth();
        self.progress.send_if_modified(|p| {
            let changed = p.queued != depth.queued || p.processing != depth.in_flight;
            p.queued = depth.queued;
            p.processing = depth.in_flight;
            changed
        });
    }

    fn emit(&self, event: FileEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn concurrency_limit(&self) -> usize {
        if self.memory.under_pressure() {
            self.config.throttled_concurrency()
        } else {
            self.config.effective_concurrency()
        }
    }

    async fn dispatch(inner: Arc<EngineInner>) {
        let mut running = JoinSet::new();
        let mut stop = inner.stop.subscribe();
        let mut paused = inner.paused.subscribe();

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            if !*paused.borrow_and_update() {
                let limit = inner.concurrency_limit();
                while running.len() < limit {
                    let Some(task) = inner.queue.pop() else {
                        break;
                    };
                    debug!("Dispatching {}", task.description());
                    running.spawn(Arc::clone(&inner).run_task(task));
                }
            }
            inner.refresh_progress();

            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Indexing task panicked: {e}");
                    }
                }
                _ = inner.queue.notified() => {}
                _ = paused.changed() => {}
                _ = stop.changed() => {}
                _ = tokio::time::sleep(IndexingEngine::POLL_INTERVAL) => {}
            }
        }

        if running.is_empty() {
            return;
        }
        let timeout = inner.config.shutdown_timeout();
        info!(
            "Waiting up to {timeout:?} for {} in-flight files",
            running.len()
        );
        let drained = tokio::time::timeout(timeout, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Abandoning {} in-flight files after {timeout:?}",
                running.len()
            );
            running.abort_all();
            while running.join_next().await.is_some() {}
        }
    }

    async fn sweep_errors(inner: Weak<EngineInner>, period: Duration) {
        let Some(mut stop) = inner.upgrade().map(|inner| inner.stop.subscribe()) else {
            return;
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(e) = inner.retry_errors().await {
                warn!("Error sweep failed: {e:#}");
            }
        }
    }

    async fn retry_errors(&self) -> Result<usize> {
        let interval = chrono::Duration::from_std(self.config.error_retry_interval())?;
        let due = self.index.errors_due(Utc::now() - interval).await?;
        for path in &due {
            self.index.set_status(path, FileStatus::Queued).await?;
            self.queue.push(IndexingTask::index_file(
                PathBuf::from(path),
                TaskPriority::Background,
            ));
        }
        if !due.is_empty() {
            info!("Retrying {} files in error", due.len());
            self.refresh_progress();
        }
        Ok(due.len())
    }

    async fn run_task(self: Arc<Self>, task: IndexingTask) {
        let _in_flight = InFlight {
            inner: Arc::clone(&self),
            path: task.path().to_path_buf(),
        };
        let key = path_key(task.path());

        match &task.task_type {
            TaskType::IndexFile { path } => match self.index_file(path).await {
                Ok(outcome) => self.record(&key, outcome),
                Err(e) => {
                    let message = format!("{e:#}");
                    warn!("Indexing {key} failed: {message}");
                    if let Err(e) = self.record_error(&key, &message).await {
                        error!("Failed to record error for {key}: {e:#}");
                    }
                    self.progress.send_modify(|p| p.errors += 1);
                    self.emit(FileEvent::Transition {
                        path: key,
                        status: FileStatus::Error,
                    });
                }
            },
            TaskType::RemoveFile { path } => {
                if let Err(e) = self.remove_path(path).await {
                    error!("Failed to remove {key} from the index: {e:#}");
                    self.progress.send_modify(|p| p.errors += 1);
                }
            }
        }
    }

    fn record(&self, key: &str, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Indexed { chunks } => {
                debug!("Indexed {key} ({chunks} chunks)");
                self.progress.send_modify(|p| p.done += 1);
                self.emit(FileEvent::Transition {
                    path: key.to_string(),
                    status: FileStatus::Indexed,
                });
            }
            FileOutcome::Skipped => {
                self.progress.send_modify(|p| p.skipped += 1);
                self.emit(FileEvent::Skipped {
                    path: key.to_string(),
                });
            }
            FileOutcome::Failed(reason) => {
                info!("Cannot index {key}: {reason}");
                self.progress.send_modify(|p| p.failed += 1);
                self.emit(FileEvent::Transition {
                    path: key.to_string(),
                    status: FileStatus::Failed,
                });
            }
            FileOutcome::Removed => {}
        }
    }

    /// Park the file in `error`, creating its row if the failure came first.
    async fn record_error(&self, key: &str, message: &str) -> Result<()> {
        if self.index.get_file(key).await?.is_none() {
            self.index.mark_queued(key, 0, 0).await?;
        }
        self.index.mark_error(key, message).await
    }

    async fn index_file(&self, path: &Path) -> Result<FileOutcome> {
        let key = path_key(path);
        let version = self.config.parser_version;

        let stat = match FileStat::read(path).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{key} vanished before processing");
                self.remove_path(path).await?;
                return Ok(FileOutcome::Removed);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {key}")),
        };

        match self.index.get_file(&key).await? {
            Some(tracked) if !needs_work(&tracked, version) => {
                let change = self
                    .tracker
                    .classify_tracked(&tracked, path, stat.size_bytes, stat.modified_at)
                    .await?;
                if change == FileChange::Unchanged {
                    debug!("Skipping unchanged {key}");
                    return Ok(FileOutcome::Skipped);
                }
            }
            Some(_) => {}
            None => {
                self.index
                    .mark_queued(&key, stat.size_bytes, stat.modified_at)
                    .await?
            }
        }

        self.index.set_status(&key, FileStatus::Processing).await?;
        self.emit(FileEvent::Transition {
            path: key.clone(),
            status: FileStatus::Processing,
        });

        let content_hash = match hash_file(path).await {
            Ok(hash) => hash,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.remove_path(path).await?;
                return Ok(FileOutcome::Removed);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to hash {key}")),
        };
        let fingerprint = Fingerprint {
            size_bytes: stat.size_bytes,
            modified_at: stat.modified_at,
            content_hash,
        };

        let parser = &self.parser;
        let extracted = match self
            .parse_retry
            .execute(move |_| parser.extract_text(path))
            .await
        {
            Ok(extracted) => extracted,
            Err(e) if e.source_ref().is_some_and(ParseError::is_not_found) => {
                self.remove_path(path).await?;
                return Ok(FileOutcome::Removed);
            }
            Err(e) if e.is_terminal() => {
                let reason = e
                    .source_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| e.to_string());
                return self.fail(&key, &fingerprint, reason).await;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to extract {key}")),
        };

        if extracted.is_blank() {
            return self
                .fail(&key, &fingerprint, "no extractable text".to_string())
                .await;
        }

        let drafts: Vec<(usize, TextChunk)> = extracted
            .pages
            .iter()
            .enumerate()
            .flat_map(|(page, text)| {
                self.chunker
                    .chunk(text)
                    .into_iter()
                    .map(move |chunk| (page, chunk))
            })
            .collect();

        let hashes: Vec<String> = drafts.iter().map(|(_, chunk)| text_hash(&chunk.text)).collect();
        let mut vectors = self
            .store
            .cached_embeddings(&self.cache_model, &hashes)
            .await?;
        let missing: Vec<(&String, &str)> = hashes
            .iter()
            .zip(&drafts)
            .filter(|(hash, _)| !vectors.contains_key(*hash))
            .map(|(hash, (_, chunk))| (hash, chunk.text.as_str()))
            .unique_by(|(hash, _)| *hash)
            .collect();
        debug!(
            "{key}: {} chunks, {} to embed",
            drafts.len(),
            missing.len()
        );

        for batch in missing.chunks(self.config.embed_batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.to_string()).collect();
            let embedder = &self.embedder;
            let batch_texts = &texts;
            let embedded = self
                .embed_retry
                .execute(move |_| embedder.embed(batch_texts, EmbedRole::Passage))
                .await
                .with_context(|| format!("Failed to embed {key}"))?;
            if embedded.len() != texts.len() {
                bail!(
                    "Embedder returned {} vectors for {} chunks of {key}",
                    embedded.len(),
                    texts.len()
                );
            }

            let entries: Vec<(String, Vec<f16>)> = batch
                .iter()
                .zip(embedded)
                .map(|((hash, _), vector)| {
                    ((*hash).clone(), vector.into_iter().map(f16::from_f32).collect())
                })
                .collect();
            self.store
                .cache_embeddings(&self.cache_model, &entries)
                .await?;
            vectors.extend(entries);
        }

        let rows = drafts
            .iter()
            .zip(&hashes)
            .map(|((page, chunk), hash)| {
                let vector = vectors
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| anyhow!("No vector for chunk at {} of {key}", chunk.offset))?;
                Ok(ChunkRow {
                    id: chunk_id(&key, *page, chunk.offset),
                    path: key.clone(),
                    mtime: fingerprint.modified_at,
                    page: *page,
                    offset: chunk.offset,
                    text: chunk.text.clone(),
                    vector,
                    source_type: extracted.source_type.clone(),
                    title: extracted.title.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pruned = self.store.replace_path(&key, &rows).await?;
        if pruned > 0 {
            debug!("Pruned {pruned} stale chunks of {key}");
        }
        self.index
            .mark_indexed(&key, &fingerprint, version, rows.len())
            .await?;
        Ok(FileOutcome::Indexed { chunks: rows.len() })
    }

    async fn fail(&self, key: &str, fingerprint: &Fingerprint, reason: String) -> Result<FileOutcome> {
        self.store.delete_by_path(key).await?;
        self.index
            .mark_failed(key, fingerprint, self.config.parser_version, &reason)
            .await?;
        Ok(FileOutcome::Failed(reason))
    }

    async fn remove_path(&self, path: &Path) -> Result<usize> {
        let key = path_key(path);
        let mut keys = self.index.paths_under(&key).await?;
        keys.push(key.clone());

        let mut removed = 0;
        for key in keys {
            let rows = self.store.delete_by_path(&key).await?;
            if self.index.remove_file(&key).await? || rows > 0 {
                debug!("Removed {key} ({rows} chunks)");
                removed += 1;
                self.emit(FileEvent::Removed { path: key });
            }
        }
        self.index.remove_folder(&key).await?;
        Ok(removed)
    }
}
