//! Index status snapshot for the CLI and other front ends.

use crate::retrieval::file_index::{FileIndex, FileStatus, IndexedFolder};
use crate::retrieval::indexing_engine::IndexingProgress;
use crate::storage::VectorStore;
use anyhow::Result;
use docsearch_embed::PoolStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    /// Database file; `None` for an in-memory index.
    pub database: Option<PathBuf>,
    pub parser_version: u32,
    pub total_files: usize,
    /// Every status is present, zero or not.
    pub files_by_status: BTreeMap<FileStatus, usize>,
    pub total_chunks: u64,
    pub folders: Vec<IndexedFolder>,
    pub progress: Option<IndexingProgress>,
    pub embedder: Option<PoolStats>,
}

impl IndexStatus {
    pub async fn collect(
        index: &FileIndex,
        store: &dyn VectorStore,
        parser_version: u32,
    ) -> Result<Self> {
        let mut files_by_status: BTreeMap<FileStatus, usize> =
            FileStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        files_by_status.extend(index.status_counts().await?);

        Ok(Self {
            database: index.location().map(|p| p.to_path_buf()),
            parser_version,
            total_files: files_by_status.values().sum(),
            files_by_status,
            total_chunks: store.count_rows().await?,
            folders: index.folders().await?,
            progress: None,
            embedder: None,
        })
    }

    pub fn with_progress(mut self, progress: IndexingProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_embedder(mut self, stats: PoolStats) -> Self {
        self.embedder = Some(stats);
        self
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files_by_status.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(path) => writeln!(f, "Database: {}", path.display())?,
            None => writeln!(f, "Database: (in memory)")?,
        }
        writeln!(f, "Parser version: {}", self.parser_version)?;
        writeln!(f, "Files: {}", self.total_files)?;
        for (status, count) in &self.files_by_status {
            writeln!(f, "  {status:<11} {count}")?;
        }
        writeln!(f, "Chunks: {}", self.total_chunks)?;

        if !self.folders.is_empty() {
            writeln!(f, "Folders:")?;
            for folder in &self.folders {
                writeln!(
                    f,
                    "  {} ({} files, indexed {})",
                    folder.path,
                    folder.total_files,
                    folder.last_indexed_at.format("%Y-%m-%d %H:%M:%S")
                )?;
            }
        }

        if let Some(progress) = &self.progress {
            writeln!(
                f,
                "Progress: {} queued, {} processing, {} done, {} failed, {} errors, {} skipped",
                progress.queued,
                progress.processing,
                progress.done,
                progress.failed,
                progress.errors,
                progress.skipped
            )?;
        }

        if let Some(embedder) = &self.embedder {
            writeln!(
                f,
                "Embedder: {} ({} launcher), {}/{} workers ready, {} restarts",
                embedder.model.as_deref().unwrap_or("unknown model"),
                embedder.launcher,
                embedder.ready_workers,
                embedder.workers.len(),
                embedder.total_restarts
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite_store::SqliteStore;

    #[tokio::test]
    async fn test_collect_counts_every_status() -> Result<()> {
        let index = FileIndex::open_memory().await?;
        index.mark_queued("/docs/a.md", 10, 1).await?;
        index.mark_queued("/docs/b.md", 10, 1).await?;
        index.mark_error("/docs/b.md", "worker crashed").await?;
        index.upsert_folder("/docs", 2).await?;
        let store = SqliteStore::new(index.clone());

        let status = IndexStatus::collect(&index, &store, 1).await?;
        assert_eq!(status.total_files, 2);
        assert_eq!(status.count(FileStatus::Queued), 1);
        assert_eq!(status.count(FileStatus::Error), 1);
        assert_eq!(status.count(FileStatus::Indexed), 0);
        assert_eq!(status.files_by_status.len(), FileStatus::ALL.len());
        assert_eq!(status.total_chunks, 0);

        let text = status.to_string();
        assert!(text.contains("Database: (in memory)"));
        assert!(text.contains("/docs (2 files"));

        let json = serde_json::to_value(&status)?;
        assert_eq!(json["files_by_status"]["error"], 1);
        Ok(())
    }
}
