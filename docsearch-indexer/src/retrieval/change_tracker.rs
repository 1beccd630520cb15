//! Decides which files need (re-)indexing.
//!
//! The content hash is authoritative; size and modification time are a cheap
//! pre-filter in front of it:
//!
//! | stored vs. current            | result                                   |
//! |-------------------------------|------------------------------------------|
//! | not tracked                   | `New`                                    |
//! | same size, same mtime         | `Unchanged`, no hashing                  |
//! | different size                | `Modified`, no hashing                   |
//! | same size, different mtime    | hash; equal ⇒ `Unchanged` + mtime stored |

use super::file_index::{FileIndex, FileStatus, TrackedFile};
use super::parser::DocumentParser;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Key under which a path is tracked.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Blake3 of a file's content, hex encoded. Runs on the blocking pool.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize().as_bytes()))
    })
    .await
    .map_err(io::Error::other)?
}

/// Size and modification time (unix ms) of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: i64,
}

impl FileStat {
    pub fn from_metadata(path: PathBuf, metadata: &std::fs::Metadata) -> io::Result<Self> {
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            path,
            size_bytes: metadata.len(),
            modified_at: modified.timestamp_millis(),
        })
    }

    pub async fn read(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Self::from_metadata(path.to_path_buf(), &metadata)
    }

    pub fn key(&self) -> String {
        path_key(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    New,
    Modified,
    Unchanged,
}

/// Result of comparing a directory tree against the status table.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub new: Vec<FileStat>,
    pub modified: Vec<FileStat>,
    pub unchanged: Vec<FileStat>,
    /// Tracked paths under the root that no longer exist.
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn total_files(&self) -> usize {
        self.new.len() + self.modified.len() + self.unchanged.len()
    }
}

/// Whether a tracked file still needs processing even though its content is
/// unchanged.
pub fn needs_work(file: &TrackedFile, parser_version: u32) -> bool {
    match file.status {
        FileStatus::Indexed | FileStatus::Failed => file.parser_version < parser_version,
        FileStatus::Queued | FileStatus::Processing | FileStatus::Error | FileStatus::Outdated => {
            true
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChangeTracker {
    index: FileIndex,
}

impl ChangeTracker {
    pub fn new(index: FileIndex) -> Self {
        Self { index }
    }

    /// Compare a file on disk with its tracked fingerprint.
    pub async fn classify(&self, path: &Path, size_bytes: u64, modified_at: i64) -> Result<FileChange> {
        let key = path_key(path);
        let Some(tracked) = self.index.get_file(&key).await? else {
            return Ok(FileChange::New);
        };
        self.classify_tracked(&tracked, path, size_bytes, modified_at)
            .await
    }

    pub(crate) async fn classify_tracked(
        &self,
        tracked: &TrackedFile,
        path: &Path,
        size_bytes: u64,
        modified_at: i64,
    ) -> Result<FileChange> {
        let Some(stored_hash) = tracked.content_hash.as_deref() else {
            // Never processed to completion.
            return Ok(FileChange::Modified);
        };
        if tracked.size_bytes != size_bytes {
            return Ok(FileChange::Modified);
        }
        if tracked.modified_at == modified_at {
            return Ok(FileChange::Unchanged);
        }

        let current_hash = hash_file(path).await?;
        if current_hash == stored_hash {
            debug!("{} touched without content change", path.display());
            self.index
                .refresh_modified_at(&tracked.path, modified_at)
                .await?;
            Ok(FileChange::Unchanged)
        } else {
            Ok(FileChange::Modified)
        }
    }

    /// Walk `root` (gitignore-aware, hidden entries skipped) and classify every
    /// file the parser supports.
    pub async fn scan(&self, root: &Path, parser: Arc<dyn DocumentParser>) -> Result<ChangeSet> {
        let walk_root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || walk(&walk_root, parser.as_ref())).await?;

        let mut changes = ChangeSet::default();
        let mut seen = HashSet::with_capacity(files.len());
        for stat in files {
            seen.insert(stat.key());
            match self
                .classify(&stat.path, stat.size_bytes, stat.modified_at)
                .await
            {
                Ok(FileChange::New) => changes.new.push(stat),
                Ok(FileChange::Modified) => changes.modified.push(stat),
                Ok(FileChange::Unchanged) => changes.unchanged.push(stat),
                Err(e) => {
                    // Let the pipeline surface the error against the file.
                    warn!("Failed to classify {}: {e}", stat.path.display());
                    changes.modified.push(stat);
                }
            }
        }

        changes.deleted = self
            .index
            .paths_under(&path_key(root))
            .await?
            .into_iter()
            .filter(|path| !seen.contains(path))
            .collect();

        debug!(
            "Scanned {}: {} new, {} modified, {} unchanged, {} deleted",
            root.display(),
            changes.new.len(),
            changes.modified.len(),
            changes.unchanged.len(),
            changes.deleted.len()
        );
        Ok(changes)
    }

    /// Flag files indexed by an older parser. Returns how many were flagged.
    pub async fn mark_outdated(&self, parser_version: u32) -> Result<u64> {
        self.index.mark_outdated(parser_version).await
    }
}

fn walk(root: &Path, parser: &dyn DocumentParser) -> Vec<FileStat> {
    let mut files = Vec::new();
    for entry in ignore::WalkBuilder::new(root)
        .hidden(true)
        .require_git(false)
        .build()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {e}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) || !parser.supports(entry.path()) {
            continue;
        }
        match entry
            .metadata()
            .map_err(io::Error::other)
            .and_then(|m| FileStat::from_metadata(entry.path().to_path_buf(), &m))
        {
            Ok(stat) => files.push(stat),
            Err(e) => warn!("Failed to stat {}: {e}", entry.path().display()),
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::file_index::Fingerprint;
    use crate::retrieval::parser::PlainTextParser;
    use tempfile::tempdir;

    async fn tracked(index: &FileIndex, path: &Path, status_indexed: bool) -> Result<FileStat> {
        let stat = FileStat::read(path).await?;
        index
            .mark_queued(&stat.key(), stat.size_bytes, stat.modified_at)
            .await?;
        if status_indexed {
            let fingerprint = Fingerprint {
                size_bytes: stat.size_bytes,
                modified_at: stat.modified_at,
                content_hash: hash_file(path).await?,
            };
            index.mark_indexed(&stat.key(), &fingerprint, 1, 1).await?;
        }
        Ok(stat)
    }

    #[tokio::test]
    async fn test_classify_precedence() -> Result<()> {
        let dir = tempdir()?;
        let index = FileIndex::open_memory().await?;
        let tracker = ChangeTracker::new(index.clone());
        let path = dir.path().join("a.md");
        std::fs::write(&path, "alpha")?;

        let stat = FileStat::read(&path).await?;
        assert_eq!(
            tracker.classify(&path, stat.size_bytes, stat.modified_at).await?,
            FileChange::New
        );

        let stat = tracked(&index, &path, true).await?;
        assert_eq!(
            tracker.classify(&path, stat.size_bytes, stat.modified_at).await?,
            FileChange::Unchanged
        );

        // Timestamp jitter with identical content.
        let touched = stat.modified_at + 5_000;
        assert_eq!(
            tracker.classify(&path, stat.size_bytes, touched).await?,
            FileChange::Unchanged
        );
        assert_eq!(index.get_file(&stat.key()).await?.unwrap().modified_at, touched);

        // Same size, new content.
        std::fs::write(&path, "omega")?;
        assert_eq!(
            tracker.classify(&path, stat.size_bytes, touched + 1).await?,
            FileChange::Modified
        );

        // Size differs: no hashing needed.
        assert_eq!(
            tracker.classify(&path, stat.size_bytes + 1, touched).await?,
            FileChange::Modified
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_reports_changes() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        std::fs::create_dir(root.join("sub"))?;
        std::fs::write(root.join("kept.md"), "kept")?;
        std::fs::write(root.join("sub").join("fresh.txt"), "fresh")?;
        std::fs::write(root.join("image.png"), [0u8, 1, 2])?;
        std::fs::write(root.join(".secret.md"), "hidden")?;
        std::fs::write(root.join(".gitignore"), "ignored.md\n")?;
        std::fs::write(root.join("ignored.md"), "ignored")?;

        let index = FileIndex::open_memory().await?;
        tracked(&index, &root.join("kept.md"), true).await?;
        let gone = path_key(&root.join("gone.md"));
        index.mark_queued(&gone, 1, 1).await?;

        let tracker = ChangeTracker::new(index);
        let changes = tracker.scan(&root, Arc::new(PlainTextParser::new())).await?;

        let new: Vec<_> = changes.new.iter().map(FileStat::key).collect();
        assert_eq!(new, vec![path_key(&root.join("sub").join("fresh.txt"))]);
        assert_eq!(changes.unchanged.len(), 1);
        assert!(changes.modified.is_empty());
        assert_eq!(changes.deleted, vec![gone]);
        assert_eq!(changes.total_files(), 2);
        Ok(())
    }

    #[test]
    fn test_needs_work() {
        let mut file = TrackedFile::queued("/a.md", 1, 1);
        assert!(needs_work(&file, 1));
        file.status = FileStatus::Indexed;
        file.parser_version = 1;
        assert!(!needs_work(&file, 1));
        assert!(needs_work(&file, 2));
        file.status = FileStatus::Error;
        assert!(needs_work(&file, 1));
    }
}
