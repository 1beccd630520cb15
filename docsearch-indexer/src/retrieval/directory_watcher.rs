use super::indexing_engine::IndexingEngine;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reacts to a debounced filesystem change.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn path_changed(&self, path: &Path) -> Result<()>;
}

#[async_trait]
impl ChangeHandler for IndexingEngine {
    /// Existing files are scheduled; vanished paths (files or whole
    /// directories) are scheduled for removal.
    async fn path_changed(&self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                let dir = path.to_path_buf();
                let files = tokio::task::spawn_blocking(move || {
                    ignore::Walk::new(&dir)
                        .filter_map(|entry| entry.ok())
                        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
                        .map(|entry| entry.into_path())
                        .collect::<Vec<_>>()
                })
                .await?;
                for file in files {
                    self.schedule_file(&file).await?;
                }
                Ok(())
            }
            Ok(_) => self.schedule_file(path).await.map(|_| ()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.schedule_removal(path),
            Err(e) => Err(e.into()),
        }
    }
}

/// Watches a directory tree and feeds changes to a [`ChangeHandler`].
pub struct DirectoryWatcher {
    root: PathBuf,
    // Dropping the debouncer stops the OS watcher.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    listener: tokio::task::JoinHandle<Result<()>>,
}

impl DirectoryWatcher {
    pub async fn open(
        root: &Path,
        debounce: Duration,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<Self> {
        let root = tokio::fs::canonicalize(root).await?;
        let (events_tx, events_rx) = mpsc::channel(128);

        // The listener needs to exist first or the debouncer thread may block.
        let listener = tokio::task::spawn(Self::listen(root.clone(), events_rx, handler));

        // A long window avoids catching blips during git checkouts and editor saves.
        let mut debouncer = notify_debouncer_mini::new_debouncer(
            debounce,
            move |res: notify_debouncer_mini::DebounceEventResult| match res {
                Ok(events) => {
                    for event in events {
                        // Runs on the debouncer's own thread, not inside the runtime.
                        if events_tx.blocking_send(event.path).is_err() {
                            warn!("Change listener stopped, dropping filesystem events");
                            break;
                        }
                    }
                }
                Err(e) => warn!("Filesystem watch error: {e}"),
            },
        )?;

        debouncer
            .watcher()
            .watch(&root, notify::RecursiveMode::Recursive)?;
        info!("Watching {} for changes", root.display());

        Ok(Self {
            root,
            _debouncer: debouncer,
            listener,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop watching and wait for the listener to finish pending events.
    pub async fn close(self) -> Result<()> {
        let Self {
            root,
            _debouncer,
            listener,
        } = self;
        drop(_debouncer);
        listener.await??;
        info!("Stopped watching {}", root.display());
        Ok(())
    }

    async fn listen(
        root: PathBuf,
        events_rx: mpsc::Receiver<PathBuf>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<()> {
        let root = &root;
        let handler = &handler;
        tokio_stream::wrappers::ReceiverStream::new(events_rx)
            .filter(|path| std::future::ready(!is_hidden(root, path)))
            .for_each_concurrent(16, |path| async move {
                debug!("Change detected: {}", path.display());
                if let Err(err) = handler.path_changed(&path).await {
                    error!("Failed to handle change to {}: {err:#}", path.display());
                }
            })
            .await;
        Ok(())
    }
}

/// Whether any component below `root` is hidden (dot-prefixed), such as
/// `.git/` internals or the index database itself.
fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn path_changed(&self, path: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            if path.ends_with("broken.md") {
                anyhow::bail!("cannot read");
            }
            Ok(())
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_listen_forwards_visible_paths() -> Result<()> {
        let root = PathBuf::from("/tmp/watch_root");
        let (tx, rx) = mpsc::channel(8);
        let handler = Arc::new(RecordingHandler::default());

        for path in [
            root.join("notes.md"),
            root.join(".git").join("index"),
            root.join(".docsearch.db-wal"),
            root.join("sub").join("broken.md"),
        ] {
            tx.send(path).await?;
        }
        drop(tx);

        DirectoryWatcher::listen(root.clone(), rx, handler.clone()).await?;

        let mut calls = handler.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![root.join("notes.md"), root.join("sub").join("broken.md")]
        );
        assert!(logs_contain("Failed to handle change"));
        Ok(())
    }

    #[test]
    fn test_is_hidden() {
        let root = Path::new("/home/me/.config/docs");
        assert!(!is_hidden(root, &root.join("a.md")));
        assert!(is_hidden(root, &root.join(".cache").join("a.md")));
    }
}
