//! End-to-end tests over a real data directory.
//!
//! Every test runs the full stack: SQLite on disk, the indexing pipeline, and
//! an embedder pool whose workers run in-process with the hashing model.

use anyhow::Result;
use docsearch_embed::EmbedConfig;
use docsearch_indexer::retrieval::parser::PARSER_VERSION;
use docsearch_indexer::{DocSearch, FileStatus, IndexerConfig, TrackedFile};
use std::fs;
use std::path::Path;
use tempfile::{TempDir, tempdir};
use tokio::time::{Duration, timeout};

fn test_config() -> IndexerConfig {
    IndexerConfig::default()
        .with_model(EmbedConfig::hashing(256))
        .with_in_process_workers(true)
        .with_concurrency(2)
        .with_chunking(32, 4)
}

async fn open(data_dir: &Path, config: IndexerConfig) -> Result<DocSearch> {
    let docsearch = DocSearch::open(data_dir, config).await?;
    docsearch.start_embedder().await?;
    docsearch.start()?;
    Ok(docsearch)
}

async fn index_and_wait(docsearch: &DocSearch, root: &Path) -> Result<()> {
    docsearch.index_folder(root).await?;
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;
    Ok(())
}

/// A data directory and a separate documents directory.
fn workspace() -> Result<(TempDir, TempDir)> {
    Ok((tempdir()?, tempdir()?))
}

async fn tracked(docsearch: &DocSearch, name: &str) -> Result<TrackedFile> {
    docsearch
        .files(None)
        .await?
        .into_iter()
        .find(|f| f.path.ends_with(name))
        .ok_or_else(|| anyhow::anyhow!("{name} is not tracked"))
}

#[tokio::test]
async fn test_index_then_search() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(
        docs.path().join("cats.md"),
        "# Cats\n\nCats purr when they are content. A cat sleeps most of the day.\n",
    )?;
    fs::write(
        docs.path().join("compiler.txt"),
        "The borrow checker rejects dangling references at compile time.\n",
    )?;
    fs::write(
        docs.path().join("garden.md"),
        "# Garden\n\nTomatoes need full sun and regular watering.\n",
    )?;
    fs::write(docs.path().join("photo.png"), [0x89, b'P', b'N', b'G'])?;

    let docsearch = open(data.path(), test_config()).await?;
    let summary = docsearch.index_folder(docs.path()).await?;
    assert_eq!(summary.new, 3, "unsupported files are not tracked");
    assert_eq!(summary.queued, 3);
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;

    let indexed = docsearch.files(Some(FileStatus::Indexed)).await?;
    assert_eq!(indexed.len(), 3);
    assert!(indexed.iter().all(|f| f.chunk_count > 0 && f.content_hash.is_some()));

    let results = docsearch.search("why do cats purr", 2).await?;
    assert!(!results.is_empty() && results.len() <= 2);
    assert!(results[0].path.ends_with("cats.md"));
    assert_eq!(results[0].title.as_deref(), Some("Cats"));
    assert!(results[0].text.contains("purr"));

    assert!(docsearch.search("", 5).await?.is_empty());

    let status = docsearch.status().await?;
    assert_eq!(status.count(FileStatus::Indexed), 3);
    assert_eq!(status.folders.len(), 1);
    assert_eq!(status.folders[0].total_files, 3);
    assert!(status.total_chunks >= 3);
    assert_eq!(status.progress.map(|p| p.done), Some(3));

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_modified_file_chunks_are_replaced() -> Result<()> {
    let (data, docs) = workspace()?;
    let path = docs.path().join("notes.txt");
    fs::write(
        &path,
        "Apples grow on trees in the orchard behind the old farmhouse. \
         Every autumn the family picks them and presses fresh cider. \
         The cellar keeps the barrels cool through the long winter. \
         By spring the cider has turned sharp and everyone drinks it anyway. \
         Then the blossoms come back and the whole cycle starts again.",
    )?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;

    let before = tracked(&docsearch, "notes.txt").await?;
    assert_eq!(before.status, FileStatus::Indexed);
    assert!(before.chunk_count >= 2);
    let store = docsearch.store();
    assert_eq!(store.chunks_for_path(&before.path).await?.len(), before.chunk_count);

    let replacement = "Submarines dive below the waves. Sonar pings echo back.";
    fs::write(&path, replacement)?;
    let summary = docsearch.index_folder(docs.path()).await?;
    assert_eq!(summary.modified, 1);
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;

    let after = tracked(&docsearch, "notes.txt").await?;
    assert_eq!(after.status, FileStatus::Indexed);
    assert_ne!(after.content_hash, before.content_hash);

    let rows = store.chunks_for_path(&after.path).await?;
    assert_eq!(rows.len(), after.chunk_count);
    assert!(rows.iter().all(|row| replacement.contains(row.text.trim())));
    assert!(rows.iter().all(|row| !row.text.contains("cider")));

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_unchanged_files_are_left_alone() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(docs.path().join("a.md"), "# A\n\nAlpha document body.\n")?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;
    let first = tracked(&docsearch, "a.md").await?;

    let summary = docsearch.index_folder(docs.path()).await?;
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.queued, 0);
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;

    let second = tracked(&docsearch, "a.md").await?;
    assert_eq!(second, first);

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_deleted_files_leave_no_rows() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(docs.path().join("keep.md"), "Kept around for later.\n")?;
    fs::write(docs.path().join("gone.md"), "About to be deleted.\n")?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;
    let gone = tracked(&docsearch, "gone.md").await?;

    fs::remove_file(docs.path().join("gone.md"))?;
    let summary = docsearch.index_folder(docs.path()).await?;
    assert_eq!(summary.deleted, 1);
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;

    let files = docsearch.files(None).await?;
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("keep.md"));
    assert!(docsearch.store().chunks_for_path(&gone.path).await?.is_empty());

    // Removing the whole folder empties the index.
    assert_eq!(docsearch.remove(docs.path()).await?, 1);
    assert_eq!(docsearch.store().count_rows().await?, 0);

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_blank_file_fails_without_retry() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(docs.path().join("empty.txt"), "   \n\n")?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;

    let file = tracked(&docsearch, "empty.txt").await?;
    assert_eq!(file.status, FileStatus::Failed);
    assert!(file.error_message.is_some());
    assert_eq!(file.chunk_count, 0);

    // A failed file with unchanged content is not picked up again.
    let summary = docsearch.index_folder(docs.path()).await?;
    assert_eq!(summary.queued, 0);

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_parser_upgrade_reindexes_outdated_files() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(docs.path().join("a.md"), "Versioned content.\n")?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;
    assert_eq!(tracked(&docsearch, "a.md").await?.parser_version, PARSER_VERSION);
    docsearch.shutdown().await?;
    drop(docsearch);

    let upgraded = test_config().with_parser_version(PARSER_VERSION + 1);
    let docsearch = open(data.path(), upgraded).await?;
    assert_eq!(docsearch.reindex_outdated().await?, 1);
    timeout(Duration::from_secs(30), docsearch.wait_until_idle()).await?;

    let file = tracked(&docsearch, "a.md").await?;
    assert_eq!(file.status, FileStatus::Indexed);
    assert_eq!(file.parser_version, PARSER_VERSION + 1);

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_similar_documents() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(
        docs.path().join("cats.md"),
        "Cats purr and nap in warm sunny windows all afternoon.\n",
    )?;
    fs::write(
        docs.path().join("kittens.md"),
        "Kittens purr and nap in warm sunny windows too.\n",
    )?;
    fs::write(
        docs.path().join("taxes.md"),
        "Quarterly estimated tax payments are due in April.\n",
    )?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;

    let results = docsearch.similar(&docs.path().join("cats.md"), 5).await?;
    assert!(results.iter().all(|r| !r.path.ends_with("cats.md")));
    assert!(results[0].path.ends_with("kittens.md"));

    docsearch.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_clear_wipes_everything() -> Result<()> {
    let (data, docs) = workspace()?;
    fs::write(docs.path().join("a.md"), "Something to forget.\n")?;

    let docsearch = open(data.path(), test_config()).await?;
    index_and_wait(&docsearch, docs.path()).await?;
    docsearch.clear().await?;

    let status = docsearch.status().await?;
    assert_eq!(status.total_files, 0);
    assert_eq!(status.total_chunks, 0);
    assert!(status.folders.is_empty());

    docsearch.shutdown().await?;
    Ok(())
}
